//! # CCS Spectrometer Driver
//!
//! USB protocol driver for the Thorlabs CCS compact spectrometer family
//! (CCS100, CCS125, CCS150, CCS175, CCS200).
//!
//! ## Crate Structure
//!
//! - **`transport`**: The `UsbTransport` / `UsbBus` capability traits every
//!   backend implements.
//! - **`usb`**: libusb backend through `rusb` (feature `usb`).
//! - **`mock`**: Simulated spectrometers for tests and hardware-free runs.
//! - **`protocol`**: Vendor request codes, product ids and frame layout.
//! - **`eeprom`**: Chunked EEPROM reads, CRC-verified regions and memory dumps.
//! - **`calibration`**: Wavelength polynomials, user calibration points,
//!   amplitude correction and dark offsets.
//! - **`timing`**: Integration time register codec.
//! - **`scan`**: Dark-level normalization and amplitude-corrected spectra.
//! - **`state`**: Device identity and versions.
//! - **`driver`**: `CcsDriver`, the device handle tying everything together.
//! - **`firmware`**: `.spt` firmware images and the block upload.
//! - **`discovery`**: Bus scans, firmware bring-up and re-enumeration.
//! - **`spectrometer`**: High-level acquisition with metadata recording.
//! - **`metadata`**: The `MetadataSink` trait and a JSON implementation.
//! - **`config`**: Figment-based configuration.
//! - **`logging`**: Tracing subscriber setup.
//! - **`error`**: The `CcsError` type.
//!
//! ## Example
//!
//! ```
//! use ccs_daq::discovery::{find_spectrometer, FirmwareMap, RenumerationPolicy};
//! use ccs_daq::mock::{MockBus, MockCcs};
//! use ccs_daq::transport::UsbBus;
//! use ccs_daq::{ScanKind, Spectrometer};
//!
//! let bus = MockBus::new().with_device(MockCcs::calibrated().with_uniform_scan(1000, 30_000));
//! let device = find_spectrometer(&bus, &FirmwareMap::new(), RenumerationPolicy::default(), None)?;
//!
//! let mut spec = Spectrometer::open(bus.open(&device)?)?;
//! spec.set_integration_time(0.02)?;
//! let spectrum = spec.scan_spectrum(ScanKind::Plain, None)?;
//! assert_eq!(spectrum.intensity.len(), ccs_daq::protocol::NUM_PIXELS);
//! # Ok::<(), ccs_daq::CcsError>(())
//! ```

pub mod calibration;
pub mod config;
pub mod discovery;
pub mod driver;
pub mod eeprom;
pub mod error;
pub mod firmware;
pub mod logging;
pub mod metadata;
pub mod mock;
pub mod protocol;
pub mod scan;
pub mod spectrometer;
pub mod state;
pub mod timing;
pub mod transport;

#[cfg(feature = "usb")]
pub mod usb;

pub use calibration::{Calibration, CalibrationSource};
pub use driver::{CcsDriver, DriverSettings, ScanPolicy};
pub use error::{CcsError, Result};
pub use metadata::{JsonMetadataSink, MetadataSink};
pub use protocol::{CcsModel, NUM_PIXELS};
pub use spectrometer::{ScanKind, Spectrometer, Spectrum};
pub use state::{DeviceIdentity, Version};
pub use transport::{UsbBus, UsbDeviceDescriptor, UsbTransport};
