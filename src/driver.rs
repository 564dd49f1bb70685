//! CCS spectrometer driver.
//!
//! [`CcsDriver`] owns one open transport and the state read from the device at
//! initialization. A typical acquisition is:
//!
//! ```text
//! set_integration_time -> start_scan -> wait_for_scan -> read & process
//! ```
//!
//! The `scan_data*` methods wait for the transfer-ready status bit, pull the
//! raw scan over the bulk endpoint and run it through [`crate::scan`].
//!
//! # Example
//!
//! ```
//! use ccs_daq::driver::CcsDriver;
//! use ccs_daq::mock::MockCcs;
//!
//! let mut ccs = CcsDriver::open(MockCcs::calibrated().with_uniform_scan(900, 20_000))?;
//! ccs.set_integration_time(0.05)?;
//! ccs.start_scan()?;
//! let corrected = ccs.scan_data_corrected_range(400.0, 700.0)?;
//! assert!(corrected.noise_amplification_db >= 0.0);
//! # Ok::<(), ccs_daq::error::CcsError>(())
//! ```

use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, instrument, warn};

use crate::calibration::{Calibration, CalibrationSource, WavelengthCalibration};
use crate::eeprom::{self, RamDump};
use crate::error::{CcsError, Result};
use crate::protocol::{
    DeviceStatus, ScanMode, NUM_RAW_PIXELS, RCMD_GET_STATUS, SCAN_DATA_ENDPOINT, WCMD_INTEGRATION_TIME,
    WCMD_MODUS, WCMD_RESET,
};
use crate::scan::{self, NoiseBoundedScan, RangeCorrectedScan};
use crate::state::{DeviceIdentity, DeviceState};
use crate::timing::{self, DEFAULT_INTEGRATION_TIME, INTEGRATION_CONTROL_BYTES};
use crate::transport::UsbTransport;

/// Added to the integration time to get the default scan timeout.
pub const SCAN_TIMEOUT_MARGIN: Duration = Duration::from_secs(2);

/// Default delay between two status polls.
pub const DEFAULT_SCAN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// How long to wait for scan data.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScanPolicy {
    /// Fixed timeout; `None` means integration time + [`SCAN_TIMEOUT_MARGIN`]
    pub timeout: Option<Duration>,
    /// Delay between status polls
    pub poll_interval: Duration,
}

impl Default for ScanPolicy {
    fn default() -> Self {
        Self {
            timeout: None,
            poll_interval: DEFAULT_SCAN_POLL_INTERVAL,
        }
    }
}

/// Settings applied when a driver is opened.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DriverSettings {
    /// Integration time programmed during initialization, seconds
    pub integration_time: f64,
    /// Scan wait behaviour
    pub scan_policy: ScanPolicy,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            integration_time: DEFAULT_INTEGRATION_TIME,
            scan_policy: ScanPolicy::default(),
        }
    }
}

/// Driver for one CCS spectrometer.
#[derive(Debug)]
pub struct CcsDriver<T: UsbTransport> {
    transport: T,
    state: DeviceState,
    scan_policy: ScanPolicy,
}

impl<T: UsbTransport> CcsDriver<T> {
    /// Initialize a device with default settings.
    pub fn open(transport: T) -> Result<Self> {
        Self::open_with(transport, DriverSettings::default())
    }

    /// Initialize a device.
    ///
    /// Selects the configuration, resets the USB port, programs the
    /// integration time and reads calibration and identity from EEPROM.
    ///
    /// # Errors
    ///
    /// Any transport error, an invalid integration time, or corrupted
    /// calibration data. A missing user calibration is not an error.
    #[instrument(skip(transport, settings), fields(device = %transport.descriptor()))]
    pub fn open_with(mut transport: T, settings: DriverSettings) -> Result<Self> {
        let registers = timing::encode_integration_time(settings.integration_time)?;

        transport.set_configuration()?;
        transport.reset()?;
        transport.control_out(WCMD_INTEGRATION_TIME, 0, 0, &registers)?;

        let calibration = Calibration::read(&mut transport)?;
        let identity = DeviceIdentity::read(&mut transport)?;
        let source = calibration.default_source();

        info!(
            serial = %identity.serial_number,
            firmware = %identity.firmware_version,
            hardware = %identity.hardware_version,
            ?source,
            "CCS spectrometer initialized"
        );

        Ok(Self {
            transport,
            state: DeviceState {
                identity,
                calibration,
                integration_time: settings.integration_time,
                source,
            },
            scan_policy: settings.scan_policy,
        })
    }

    // =========================================================================
    // State access
    // =========================================================================

    /// Device state.
    pub fn state(&self) -> &DeviceState {
        &self.state
    }

    /// Identity and versions.
    pub fn identity(&self) -> &DeviceIdentity {
        &self.state.identity
    }

    /// Calibration set.
    pub fn calibration(&self) -> &Calibration {
        &self.state.calibration
    }

    /// Underlying transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Underlying transport, mutable.
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Current scan wait policy.
    pub fn scan_policy(&self) -> ScanPolicy {
        self.scan_policy
    }

    /// Replace the scan wait policy.
    pub fn set_scan_policy(&mut self, policy: ScanPolicy) {
        self.scan_policy = policy;
    }

    // =========================================================================
    // Wavelength calibration
    // =========================================================================

    /// Source reported by [`CcsDriver::current_wavelengths`].
    pub fn calibration_source(&self) -> CalibrationSource {
        self.state.source
    }

    /// Select the default wavelength calibration.
    ///
    /// # Errors
    ///
    /// [`CcsError::InvalidCalibrationData`] when selecting `User` without a
    /// valid user calibration.
    pub fn set_calibration_source(&mut self, source: CalibrationSource) -> Result<()> {
        self.state.calibration.get(source)?;
        self.state.source = source;
        Ok(())
    }

    /// Per-pixel wavelengths of `source`, nm.
    pub fn wavelengths(&self, source: CalibrationSource) -> Result<&[f64]> {
        self.state.calibration.wavelengths(source)
    }

    /// Per-pixel wavelengths of the selected source, nm.
    pub fn current_wavelengths(&self) -> Result<&[f64]> {
        self.wavelengths(self.state.source)
    }

    /// Wavelength calibration of `source`.
    pub fn wavelength_calibration(&self, source: CalibrationSource) -> Result<&WavelengthCalibration> {
        self.state.calibration.get(source)
    }

    /// Read the calibration set from EEPROM again.
    ///
    /// Falls back to the factory source when the user calibration disappeared.
    pub fn reload_calibration(&mut self) -> Result<()> {
        let calibration = Calibration::read(&mut self.transport)?;
        if calibration.get(self.state.source).is_err() {
            self.state.source = CalibrationSource::Factory;
        }
        self.state.calibration = calibration;
        Ok(())
    }

    // =========================================================================
    // Integration time
    // =========================================================================

    /// Program the exposure, seconds.
    ///
    /// The value is validated before anything is sent.
    pub fn set_integration_time(&mut self, seconds: f64) -> Result<()> {
        let registers = timing::encode_integration_time(seconds)?;
        self.transport.control_out(WCMD_INTEGRATION_TIME, 0, 0, &registers)?;
        self.state.integration_time = seconds;
        debug!(seconds, "integration time set");
        Ok(())
    }

    /// Exposure as read back from the device registers, seconds.
    pub fn get_integration_time(&mut self) -> Result<f64> {
        let bytes = self
            .transport
            .control_in(WCMD_INTEGRATION_TIME, 0, 0, INTEGRATION_CONTROL_BYTES)?;
        timing::decode_integration_time(&bytes)
    }

    /// Exposure last programmed by this driver, seconds.
    pub fn integration_time(&self) -> f64 {
        self.state.integration_time
    }

    // =========================================================================
    // Acquisition
    // =========================================================================

    fn set_scan_mode(&mut self, mode: ScanMode) -> Result<()> {
        self.transport.control_out(WCMD_MODUS, mode as u16, 0, &[])?;
        debug!(?mode, "scan started");
        Ok(())
    }

    /// Trigger one scan.
    pub fn start_scan(&mut self) -> Result<()> {
        self.set_scan_mode(ScanMode::InternalSingleShot)
    }

    /// Scan continuously.
    pub fn start_scan_continuous(&mut self) -> Result<()> {
        self.set_scan_mode(ScanMode::InternalContinuous)
    }

    /// Arm one scan on the external trigger input.
    pub fn start_scan_external_trigger(&mut self) -> Result<()> {
        self.set_scan_mode(ScanMode::ExternalSingleShot)
    }

    /// Scan on every external trigger.
    pub fn start_scan_continuous_external_trigger(&mut self) -> Result<()> {
        self.set_scan_mode(ScanMode::ExternalContinuous)
    }

    /// Status register.
    pub fn status(&mut self) -> Result<DeviceStatus> {
        let bytes = self.transport.control_in(RCMD_GET_STATUS, 0, 0, 2)?;
        if bytes.len() < 2 {
            return Err(CcsError::transport(
                "control_in",
                format!("status read returned {} bytes", bytes.len()),
            ));
        }
        Ok(DeviceStatus::from_bits_retain(u16::from_le_bytes([bytes[0], bytes[1]])))
    }

    fn scan_timeout(&self) -> Duration {
        self.scan_policy.timeout.unwrap_or_else(|| {
            Duration::from_secs_f64(self.state.integration_time) + SCAN_TIMEOUT_MARGIN
        })
    }

    /// Poll the status register until scan data is ready.
    ///
    /// # Errors
    ///
    /// [`CcsError::ScanTimeout`] when the timeout of the current
    /// [`ScanPolicy`] expires first.
    pub fn wait_for_scan(&mut self) -> Result<DeviceStatus> {
        let timeout = self.scan_timeout();
        let started = Instant::now();
        loop {
            let status = self.status()?;
            if status.scan_ready() {
                return Ok(status);
            }
            if started.elapsed() >= timeout {
                warn!(?timeout, status = status.bits(), "Scan data not ready");
                return Err(CcsError::ScanTimeout {
                    timeout,
                    last_status: status.bits(),
                });
            }
            thread::sleep(self.scan_policy.poll_interval);
        }
    }

    /// Bulk read of one raw scan. Does not wait for the status bit.
    pub fn read_raw_scan(&mut self) -> Result<Vec<u16>> {
        let expected = NUM_RAW_PIXELS * 2;
        let bytes = self.transport.bulk_in(SCAN_DATA_ENDPOINT, expected)?;
        if bytes.len() < expected {
            return Err(CcsError::transport(
                "bulk_in",
                format!("short scan transfer: {} of {} bytes", bytes.len(), expected),
            ));
        }
        Ok(scan::words_from_bytes(&bytes))
    }

    /// Wait for and return the dark-corrected, normalized spectrum.
    pub fn scan_data(&mut self) -> Result<Vec<f64>> {
        self.wait_for_scan()?;
        let raw = self.read_raw_scan()?;
        scan::process_raw_scan(&raw)
    }

    /// [`CcsDriver::scan_data`] with the factory amplitude correction.
    pub fn scan_data_factory(&mut self) -> Result<Vec<f64>> {
        let mut spectrum = self.scan_data()?;
        scan::apply_factory_correction(&mut spectrum, &self.state.calibration.factory_amplitude);
        Ok(spectrum)
    }

    /// [`CcsDriver::scan_data`] restricted to a wavelength window and
    /// flattened with the user amplitude correction.
    pub fn scan_data_corrected_range(&mut self, min_wavelength: f64, max_wavelength: f64) -> Result<RangeCorrectedScan> {
        let spectrum = self.scan_data()?;
        let cal = &self.state.calibration;
        scan::apply_range_correction(
            &spectrum,
            &cal.factory.wavelengths,
            &cal.user_amplitude,
            min_wavelength,
            max_wavelength,
        )
    }

    /// [`CcsDriver::scan_data`] over the widest window around
    /// `center_wavelength` whose noise amplification stays within
    /// `max_noise_db`.
    pub fn scan_data_corrected_noise(&mut self, center_wavelength: f64, max_noise_db: f64) -> Result<NoiseBoundedScan> {
        let spectrum = self.scan_data()?;
        let cal = &self.state.calibration;
        scan::apply_noise_bounded_correction(
            &spectrum,
            &cal.factory.wavelengths,
            &cal.user_amplitude,
            center_wavelength,
            max_noise_db,
        )
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Reset the device.
    pub fn reset(&mut self) -> Result<()> {
        info!("Resetting CCS spectrometer");
        self.transport.control_out(WCMD_RESET, 0, 0, &[])?;
        Ok(())
    }

    /// Raw copy of the EEPROM.
    pub fn dump_eeprom(&mut self) -> Result<Vec<u8>> {
        eeprom::dump_eeprom(&mut self.transport)
    }

    /// Copy of the 8051 RAM.
    pub fn dump_ram(&mut self) -> Result<RamDump> {
        eeprom::dump_ram(&mut self.transport)
    }

    /// Reset the device, then hand back the transport.
    ///
    /// A failing reset is logged; the transport is returned either way.
    pub fn close(mut self) -> T {
        debug!(device = %self.transport.descriptor(), "closing");
        if let Err(e) = self.transport.control_out(WCMD_RESET, 0, 0, &[]) {
            warn!(error = %e, "Reset on close failed");
        }
        self.transport
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockCcs;
    use crate::protocol::NUM_PIXELS;

    #[test]
    fn test_open_programs_default_integration_time() {
        let ccs = CcsDriver::open(MockCcs::calibrated()).unwrap();
        let dev = ccs.transport();
        assert!(dev.is_configured());
        assert_eq!(
            dev.integration_registers(),
            timing::encode_integration_time(DEFAULT_INTEGRATION_TIME).unwrap()
        );
        assert_eq!(ccs.integration_time(), DEFAULT_INTEGRATION_TIME);
        assert_eq!(ccs.calibration_source(), CalibrationSource::User);
    }

    #[test]
    fn test_integration_time_readback() {
        let mut ccs = CcsDriver::open(MockCcs::calibrated()).unwrap();
        ccs.set_integration_time(0.25).unwrap();
        let back = ccs.get_integration_time().unwrap();
        assert!((back - 0.25).abs() < 1e-4);
    }

    #[test]
    fn test_invalid_integration_time_sends_nothing() {
        let mut ccs = CcsDriver::open(MockCcs::calibrated()).unwrap();
        ccs.transport_mut().clear_logs();
        assert!(ccs.set_integration_time(61.0).is_err());
        assert!(ccs.transport().control_out_log().is_empty());
        assert_eq!(ccs.integration_time(), DEFAULT_INTEGRATION_TIME);
    }

    #[test]
    fn test_scan_modes() {
        let mut ccs = CcsDriver::open(MockCcs::calibrated()).unwrap();
        ccs.transport_mut().clear_logs();
        ccs.start_scan().unwrap();
        ccs.start_scan_continuous().unwrap();
        ccs.start_scan_external_trigger().unwrap();
        ccs.start_scan_continuous_external_trigger().unwrap();
        let modes: Vec<u16> = ccs
            .transport()
            .control_out_log()
            .iter()
            .filter(|r| r.request == WCMD_MODUS)
            .map(|r| r.value)
            .collect();
        assert_eq!(modes, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_wait_polls_until_ready() {
        let mut ccs = CcsDriver::open(MockCcs::calibrated()).unwrap();
        ccs.transport_mut().push_status(DeviceStatus::SCAN_TRIGGERED.bits());
        ccs.transport_mut().push_status(DeviceStatus::SCAN_START_TRANSFER.bits());
        ccs.transport_mut().clear_logs();
        let status = ccs.wait_for_scan().unwrap();
        assert!(status.scan_ready());
        let polls = ccs
            .transport()
            .control_in_log()
            .iter()
            .filter(|r| r.request == RCMD_GET_STATUS)
            .count();
        assert_eq!(polls, 3);
    }

    #[test]
    fn test_wait_times_out() {
        let mut ccs = CcsDriver::open(MockCcs::calibrated()).unwrap();
        ccs.transport_mut().set_idle_status(DeviceStatus::SCAN_TRIGGERED.bits());
        ccs.set_scan_policy(ScanPolicy {
            timeout: Some(Duration::from_millis(20)),
            poll_interval: Duration::from_millis(2),
        });
        match ccs.scan_data() {
            Err(CcsError::ScanTimeout { last_status, .. }) => assert_eq!(last_status, 0x0004),
            other => panic!("expected timeout, got {:?}", other.map(|v| v.len())),
        }
    }

    #[test]
    fn test_default_scan_timeout_follows_integration_time() {
        let mut ccs = CcsDriver::open(MockCcs::calibrated()).unwrap();
        ccs.set_integration_time(1.5).unwrap();
        assert_eq!(ccs.scan_timeout(), Duration::from_millis(3500));
    }

    #[test]
    fn test_scan_flavours() {
        let mut ccs = CcsDriver::open(MockCcs::calibrated().with_uniform_scan(1000, 33_267)).unwrap();
        let plain = ccs.scan_data().unwrap();
        assert_eq!(plain.len(), NUM_PIXELS);
        let factory = ccs.scan_data_factory().unwrap();
        assert_eq!(plain, factory);

        let range = ccs.scan_data_corrected_range(400.0, 700.0).unwrap();
        assert!(range.noise_amplification_db > 0.0);
        assert_eq!(range.spectrum[0], 0.0);

        let noise = ccs.scan_data_corrected_noise(531.78, 1.0).unwrap();
        assert!(noise.wavelength_left < 531.78 && noise.wavelength_right > 531.78);
    }

    #[test]
    fn test_overexposed_scan() {
        let mut ccs = CcsDriver::open(MockCcs::calibrated().with_uniform_scan(65_000, 65_000)).unwrap();
        assert!(matches!(ccs.scan_data(), Err(CcsError::Overexposure { .. })));
    }

    #[test]
    fn test_user_source_requires_user_calibration() {
        let mut ccs = CcsDriver::open(MockCcs::calibrated().without_user_points()).unwrap();
        assert_eq!(ccs.calibration_source(), CalibrationSource::Factory);
        assert!(ccs.set_calibration_source(CalibrationSource::User).is_err());
        assert!(ccs.wavelengths(CalibrationSource::User).is_err());
        assert_eq!(ccs.current_wavelengths().unwrap().len(), NUM_PIXELS);
    }

    #[test]
    fn test_reset_and_close() {
        let mut ccs = CcsDriver::open(MockCcs::calibrated()).unwrap();
        assert_eq!(ccs.transport().usb_reset_count(), 1);
        assert_eq!(ccs.transport().reset_count(), 0);

        ccs.reset().unwrap();
        assert_eq!(ccs.transport().reset_count(), 1);

        let dev = ccs.close();
        assert_eq!(dev.reset_count(), 2);
        let resets = dev.control_out_log().iter().filter(|r| r.request == WCMD_RESET).count();
        assert_eq!(resets, 2);
    }

    #[test]
    fn test_close_returns_transport_when_reset_fails() {
        // open sends only the integration time
        let ccs = CcsDriver::open(MockCcs::calibrated().fail_control_out_at(1)).unwrap();
        let dev = ccs.close();
        assert_eq!(dev.reset_count(), 0);
        assert_eq!(dev.control_out_log().len(), 2);
        assert_eq!(dev.control_out_log()[1].request, WCMD_RESET);
    }
}
