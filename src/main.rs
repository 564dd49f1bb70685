//! Command-line front end for CCS spectrometers.
//!
//! # Usage
//!
//! List attached spectrometers, uploading firmware where needed:
//! ```bash
//! ccs-daq list
//! ```
//!
//! Take one noise-bounded scan and write spectrum plus metadata as JSON:
//! ```bash
//! ccs-daq scan --mode noise --integration-time 0.05 --output run.json
//! ```
//!
//! Every command also runs against simulated devices with `--mock`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;

use ccs_daq::calibration::CalibrationSource;
use ccs_daq::config::{CcsConfig, DEFAULT_CONFIG_PATH};
use ccs_daq::discovery::{find_spectrometer, list_spectrometers, FirmwareMap};
use ccs_daq::logging::{self, OutputFormat, TracingConfig};
use ccs_daq::metadata::{JsonMetadataSink, MetadataBuilder};
use ccs_daq::mock::{MockBus, MockCcs};
use ccs_daq::scan::{
    DEFAULT_NOISE_AMPLIFICATION_DB, DEFAULT_NOISE_CENTER_WAVELENGTH, DEFAULT_RANGE_MAX_WAVELENGTH,
    DEFAULT_RANGE_MIN_WAVELENGTH,
};
use ccs_daq::{CcsDriver, CcsModel, ScanKind, Spectrometer, Spectrum, UsbBus};

#[derive(Parser)]
#[command(name = "ccs-daq", version)]
#[command(about = "Acquire spectra from Thorlabs CCS spectrometers", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Override the configured log level
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Log output format (pretty, compact, json)
    #[arg(long, global = true, default_value = "compact")]
    log_format: OutputFormat,

    /// Use simulated spectrometers instead of USB hardware
    #[arg(long, global = true)]
    mock: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the effective configuration as TOML
    Config,

    /// List usable spectrometers
    List,

    /// Show identity and calibration of one spectrometer
    Info {
        /// Serial number; the first device when omitted
        #[arg(long)]
        serial: Option<String>,
    },

    /// Acquire one spectrum
    Scan {
        /// Serial number; the first device when omitted
        #[arg(long)]
        serial: Option<String>,

        /// Processing applied to the scan
        #[arg(long, value_enum, default_value_t = Mode::Plain)]
        mode: Mode,

        /// Integration time in seconds; the configured default when omitted
        #[arg(long)]
        integration_time: Option<f64>,

        /// Wavelength calibration; user when valid, else factory
        #[arg(long, value_enum)]
        calibration: Option<Source>,

        /// Lower bound of the range-corrected window, nm
        #[arg(long, default_value_t = DEFAULT_RANGE_MIN_WAVELENGTH)]
        min_wavelength: f64,

        /// Upper bound of the range-corrected window, nm
        #[arg(long, default_value_t = DEFAULT_RANGE_MAX_WAVELENGTH)]
        max_wavelength: f64,

        /// Center of the noise-bounded window, nm
        #[arg(long, default_value_t = DEFAULT_NOISE_CENTER_WAVELENGTH)]
        center_wavelength: f64,

        /// Noise amplification budget of the noise-bounded window, dB
        #[arg(long, default_value_t = DEFAULT_NOISE_AMPLIFICATION_DB)]
        max_noise_db: f64,

        /// Write spectrum and metadata to this JSON file
        #[arg(long)]
        output: Option<PathBuf>,

        /// Experiment name stored in the metadata
        #[arg(long)]
        experiment: Option<String>,
    },

    /// Write the EEPROM contents to a file
    DumpEeprom {
        /// Serial number; the first device when omitted
        #[arg(long)]
        serial: Option<String>,

        /// Destination file
        #[arg(long)]
        output: PathBuf,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Mode {
    Plain,
    Factory,
    Range,
    Noise,
}

#[derive(Clone, Copy, ValueEnum)]
enum Source {
    Factory,
    User,
}

impl From<Source> for CalibrationSource {
    fn from(source: Source) -> Self {
        match source {
            Source::Factory => CalibrationSource::Factory,
            Source::User => CalibrationSource::User,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = CcsConfig::load_from(&cli.config)
        .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?;
    if let Some(level) = cli.log_level {
        config.application.log_level = level;
    }
    config.validate().map_err(anyhow::Error::msg)?;

    let tracing_config = TracingConfig::from_config(&config)
        .map_err(anyhow::Error::msg)?
        .with_format(cli.log_format);
    logging::init(tracing_config).map_err(anyhow::Error::msg)?;

    if let Commands::Config = cli.command {
        print!("{}", config.to_toml_string().context("Failed to render configuration")?);
        return Ok(());
    }

    if cli.mock {
        info!("Using simulated spectrometers");
        return run(&mock_bus(), &config, cli.command);
    }
    run_hardware(&config, cli.command)
}

#[cfg(feature = "usb")]
fn run_hardware(config: &CcsConfig, command: Commands) -> Result<()> {
    let bus = ccs_daq::usb::RusbBus::new(config.transfer_timeout()).context("Failed to initialize libusb")?;
    run(&bus, config, command)
}

#[cfg(not(feature = "usb"))]
fn run_hardware(_config: &CcsConfig, _command: Commands) -> Result<()> {
    anyhow::bail!("Built without USB support; rebuild with `--features usb` or pass --mock")
}

/// A CCS200 and a CCS100, both calibrated and showing a flat spectrum.
fn mock_bus() -> MockBus {
    MockBus::new()
        .with_device(MockCcs::calibrated().with_uniform_scan(1200, 24_000))
        .with_device(
            MockCcs::calibrated()
                .with_product_id(CcsModel::Ccs100.configured_pid())
                .with_port(vec![2])
                .with_serial_number("M00111111")
                .with_uniform_scan(1100, 18_000),
        )
}

fn run<B: UsbBus>(bus: &B, config: &CcsConfig, command: Commands) -> Result<()> {
    let firmware = config.firmware_map().map_err(anyhow::Error::msg)?;

    match command {
        Commands::Config => Ok(()),
        Commands::List => list(bus, config, &firmware),
        Commands::Info { serial } => {
            let spec = open(bus, config, &firmware, serial.as_deref())?;
            print_info(&spec)
        }
        Commands::Scan {
            serial,
            mode,
            integration_time,
            calibration,
            min_wavelength,
            max_wavelength,
            center_wavelength,
            max_noise_db,
            output,
            experiment,
        } => {
            let mut spec = open(bus, config, &firmware, serial.as_deref())?;
            if let Some(source) = calibration {
                spec.set_calibration_source(source.into())?;
            }
            if let Some(seconds) = integration_time {
                spec.set_integration_time(seconds)?;
            }

            let kind = match mode {
                Mode::Plain => ScanKind::Plain,
                Mode::Factory => ScanKind::Factory,
                Mode::Range => ScanKind::Range {
                    min_wavelength,
                    max_wavelength,
                },
                Mode::Noise => ScanKind::Noise {
                    center_wavelength,
                    max_noise_db,
                },
            };

            let spectrum = match output {
                Some(path) => scan_to_file(&mut spec, kind, &path, experiment.as_deref())?,
                None => spec.scan_spectrum(kind, None)?,
            };
            print_summary(&spectrum);
            Ok(())
        }
        Commands::DumpEeprom { serial, output } => {
            let mut spec = open(bus, config, &firmware, serial.as_deref())?;
            let bytes = spec.driver_mut().dump_eeprom()?;
            std::fs::write(&output, &bytes).with_context(|| format!("Failed to write {}", output.display()))?;
            info!(bytes = bytes.len(), path = %output.display(), "EEPROM dumped");
            Ok(())
        }
    }
}

fn list<B: UsbBus>(bus: &B, config: &CcsConfig, firmware: &FirmwareMap) -> Result<()> {
    let devices =
        list_spectrometers(bus, firmware, config.renumeration_policy()).context("Failed to scan for spectrometers")?;
    if devices.is_empty() {
        println!("No CCS spectrometers found");
    }
    for device in devices {
        let model = CcsModel::from_pid(device.product_id).map_or("unknown", |m| m.name());
        println!(
            "{:<8} {:<12} bus {} port {:?}",
            model,
            device.serial_number.as_deref().unwrap_or("-"),
            device.bus_number,
            device.port_numbers
        );
    }
    Ok(())
}

fn open<B: UsbBus>(
    bus: &B,
    config: &CcsConfig,
    firmware: &FirmwareMap,
    serial: Option<&str>,
) -> Result<Spectrometer<B::Transport>> {
    let device = find_spectrometer(bus, firmware, config.renumeration_policy(), serial)?;
    let transport = bus.open(&device).with_context(|| format!("Failed to open {}", device))?;
    let driver = CcsDriver::open_with(transport, config.driver_settings())
        .with_context(|| format!("Failed to initialize {}", device))?;
    Ok(Spectrometer::new(driver))
}

fn print_info<T: ccs_daq::UsbTransport>(spec: &Spectrometer<T>) -> Result<()> {
    let id = spec.identity();
    let calibration = spec.driver().calibration();

    println!("Model:             {}", id.model().map_or("unknown", |m| m.name()));
    println!("Serial number:     {}", id.serial_number);
    println!("User label:        {}", id.user_label);
    println!("Firmware version:  {}", id.firmware_version);
    println!("Hardware version:  {}", id.hardware_version);
    println!("Integration time:  {} s", spec.integration_time());

    let factory = &calibration.factory;
    println!("Factory range:     {:.2} - {:.2} nm", factory.min, factory.max);
    match (&calibration.user, &calibration.user_points) {
        (Some(user), Some(points)) => println!(
            "User range:        {:.2} - {:.2} nm ({} points)",
            user.min,
            user.max,
            points.count()
        ),
        _ => println!("User range:        none"),
    }
    println!(
        "Dark offsets:      0x{:04X} / 0x{:04X}",
        calibration.dark_offsets.even, calibration.dark_offsets.odd
    );
    Ok(())
}

fn scan_to_file<T: ccs_daq::UsbTransport>(
    spec: &mut Spectrometer<T>,
    kind: ScanKind,
    path: &Path,
    experiment: Option<&str>,
) -> Result<Spectrum> {
    let mut builder = MetadataBuilder::new();
    if let Some(name) = experiment {
        builder = builder.experiment_name(name);
    }
    let metadata = builder.build();
    metadata.validate()?;

    let mut sink = JsonMetadataSink::to_file(metadata, path);
    spec.describe(&mut sink)?;
    let spectrum = spec.scan_spectrum(kind, Some(&mut sink))?;
    sink.flush().with_context(|| format!("Failed to write {}", path.display()))?;
    info!(path = %path.display(), "Spectrum written");
    Ok(spectrum)
}

fn print_summary(spectrum: &Spectrum) {
    let peak = spectrum
        .intensity
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|(i, v)| (spectrum.wavelengths[i], *v));

    println!("Pixels:            {}", spectrum.intensity.len());
    println!("Integration time:  {} s", spectrum.integration_time);
    if let Some((wavelength, value)) = peak {
        println!("Peak:              {:.4} at {:.2} nm", value, wavelength);
    }
    if let Some((lo, hi)) = spectrum.window {
        println!("Window:            {:.2} - {:.2} nm", lo, hi);
    }
    if let Some(db) = spectrum.noise_amplification_db {
        println!("Noise gain:        {:.3} dB", db);
    }
}
