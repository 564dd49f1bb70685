//! High-level spectrometer handle.
//!
//! [`Spectrometer`] wraps a [`CcsDriver`] and exposes the acquisition
//! subset most callers need, plus metadata recording through a
//! [`MetadataSink`]. Everything else stays reachable through
//! [`Spectrometer::driver_mut`].

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::calibration::CalibrationSource;
use crate::driver::CcsDriver;
use crate::error::Result;
use crate::metadata::MetadataSink;
use crate::protocol::NUM_PIXELS;
use crate::scan::{
    DEFAULT_NOISE_AMPLIFICATION_DB, DEFAULT_NOISE_CENTER_WAVELENGTH, DEFAULT_RANGE_MAX_WAVELENGTH,
    DEFAULT_RANGE_MIN_WAVELENGTH,
};
use crate::state::DeviceIdentity;
use crate::transport::UsbTransport;

/// Which processing to apply to a scan.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScanKind {
    /// Dark-corrected, normalized
    Plain,
    /// With factory amplitude correction
    Factory,
    /// Wavelength window flattened with the user correction
    Range {
        /// Lower bound, nm
        min_wavelength: f64,
        /// Upper bound, nm
        max_wavelength: f64,
    },
    /// Noise-bounded window around a center wavelength
    Noise {
        /// Center, nm
        center_wavelength: f64,
        /// Noise amplification budget, dB
        max_noise_db: f64,
    },
}

impl ScanKind {
    /// Range correction with the default window.
    pub fn default_range() -> Self {
        Self::Range {
            min_wavelength: DEFAULT_RANGE_MIN_WAVELENGTH,
            max_wavelength: DEFAULT_RANGE_MAX_WAVELENGTH,
        }
    }

    /// Noise-bounded correction with the default center and budget.
    pub fn default_noise() -> Self {
        Self::Noise {
            center_wavelength: DEFAULT_NOISE_CENTER_WAVELENGTH,
            max_noise_db: DEFAULT_NOISE_AMPLIFICATION_DB,
        }
    }
}

/// Calibrated spectrum.
///
/// `wavelengths` follows the selected calibration source, which is the user
/// calibration when the device has one. Corrected windows are always located
/// on the factory axis, so `window` holds factory wavelengths; with a user
/// source the two axes can differ slightly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Spectrum {
    /// Wavelength axis of the selected calibration, nm
    pub wavelengths: Vec<f64>,
    /// Normalized intensity
    pub intensity: Vec<f64>,
    /// Integration time used, s
    pub integration_time: f64,
    /// Noise amplification of a range-corrected scan, dB
    pub noise_amplification_db: Option<f64>,
    /// Factory wavelengths of the first and last pixel kept by a corrected
    /// scan, nm
    pub window: Option<(f64, f64)>,
}

/// Spectrometer built on a driver.
#[derive(Debug)]
pub struct Spectrometer<T: UsbTransport> {
    driver: CcsDriver<T>,
}

impl<T: UsbTransport> Spectrometer<T> {
    /// Open a device with default settings.
    pub fn open(transport: T) -> Result<Self> {
        Ok(Self::new(CcsDriver::open(transport)?))
    }

    /// Wrap an initialized driver.
    pub fn new(driver: CcsDriver<T>) -> Self {
        Self { driver }
    }

    /// Driver.
    pub fn driver(&self) -> &CcsDriver<T> {
        &self.driver
    }

    /// Driver, mutable.
    pub fn driver_mut(&mut self) -> &mut CcsDriver<T> {
        &mut self.driver
    }

    /// Identity and versions.
    pub fn identity(&self) -> &DeviceIdentity {
        self.driver.identity()
    }

    /// Program the exposure, seconds.
    pub fn set_integration_time(&mut self, seconds: f64) -> Result<()> {
        self.driver.set_integration_time(seconds)
    }

    /// Exposure last programmed, seconds.
    pub fn integration_time(&self) -> f64 {
        self.driver.integration_time()
    }

    /// Select the reported wavelength calibration.
    pub fn set_calibration_source(&mut self, source: CalibrationSource) -> Result<()> {
        self.driver.set_calibration_source(source)
    }

    /// Wavelength axis of the selected calibration, nm.
    pub fn wavelengths(&self) -> Result<&[f64]> {
        self.driver.current_wavelengths()
    }

    /// Reset the device.
    pub fn reset(&mut self) -> Result<()> {
        self.driver.reset()
    }

    /// Release the device.
    pub fn close(self) -> T {
        self.driver.close()
    }

    /// Record device identity, specifications and the wavelength axis.
    pub fn describe(&self, sink: &mut dyn MetadataSink) -> Result<()> {
        let id = self.driver.identity();
        let model = id.model().map_or("unknown", |m| m.name());

        sink.set_attribute("model", model.into())?;
        sink.set_attribute("serial_number", id.serial_number.as_str().into())?;
        sink.set_attribute("user_label", id.user_label.as_str().into())?;
        sink.set_attribute("vendor_id", id.vendor_id.into())?;
        sink.set_attribute("product_id", id.product_id.into())?;
        sink.set_attribute("firmware_version", id.firmware_version.to_string().into())?;
        sink.set_attribute("hardware_version", id.hardware_version.to_string().into())?;
        sink.set_attribute("num_pixels", (NUM_PIXELS as i64).into())?;
        sink.set_attribute("integration_time_s", self.driver.integration_time().into())?;

        let source = self.driver.calibration_source();
        let source_name = match source {
            CalibrationSource::Factory => "factory",
            CalibrationSource::User => "user",
        };
        sink.set_attribute("wavelength_calibration", source_name.into())?;
        sink.write_array("wavelength", self.driver.current_wavelengths()?, "nm")?;
        Ok(())
    }

    /// Trigger one scan, wait for it and process it.
    ///
    /// When a sink is given the intensity array and scan parameters are
    /// recorded in it.
    pub fn scan_spectrum(&mut self, kind: ScanKind, sink: Option<&mut dyn MetadataSink>) -> Result<Spectrum> {
        self.driver.start_scan()?;

        let (intensity, noise_amplification_db, window) = match kind {
            ScanKind::Plain => (self.driver.scan_data()?, None, None),
            ScanKind::Factory => (self.driver.scan_data_factory()?, None, None),
            ScanKind::Range {
                min_wavelength,
                max_wavelength,
            } => {
                let scan = self.driver.scan_data_corrected_range(min_wavelength, max_wavelength)?;
                let factory = self.driver.wavelengths(CalibrationSource::Factory)?;
                let window = (factory[scan.pixels.start], factory[scan.pixels.end - 1]);
                (scan.spectrum, Some(scan.noise_amplification_db), Some(window))
            }
            ScanKind::Noise {
                center_wavelength,
                max_noise_db,
            } => {
                let scan = self.driver.scan_data_corrected_noise(center_wavelength, max_noise_db)?;
                (scan.spectrum, None, Some((scan.wavelength_left, scan.wavelength_right)))
            }
        };

        let spectrum = Spectrum {
            wavelengths: self.driver.current_wavelengths()?.to_vec(),
            intensity,
            integration_time: self.driver.integration_time(),
            noise_amplification_db,
            window,
        };
        debug!(?kind, "spectrum acquired");

        if let Some(sink) = sink {
            sink.write_array("intensity", &spectrum.intensity, "a.u.")?;
            sink.set_attribute("scan_integration_time_s", spectrum.integration_time.into())?;
            if let Some(db) = spectrum.noise_amplification_db {
                sink.set_attribute("noise_amplification_db", db.into())?;
            }
            if let Some((lo, hi)) = spectrum.window {
                sink.set_attribute("window_min_nm", lo.into())?;
                sink.set_attribute("window_max_nm", hi.into())?;
            }
        }
        Ok(spectrum)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{AttributeValue, JsonMetadataSink, Metadata};
    use crate::mock::MockCcs;

    #[test]
    fn test_describe_and_scan_record_metadata() {
        let mut spec = Spectrometer::open(MockCcs::calibrated().with_uniform_scan(1000, 20_000)).unwrap();
        let mut sink = JsonMetadataSink::new(Metadata::default());

        spec.describe(&mut sink).unwrap();
        assert_eq!(sink.attribute("model"), Some(&AttributeValue::Text("CCS200".into())));
        assert_eq!(sink.attribute("serial_number"), Some(&AttributeValue::Text("M00555555".into())));
        let wl = sink.array("wavelength").unwrap();
        assert_eq!(wl.unit, "nm");
        assert_eq!(wl.values.len(), NUM_PIXELS);

        let spectrum = spec.scan_spectrum(ScanKind::default_range(), Some(&mut sink)).unwrap();
        assert_eq!(sink.array("intensity").unwrap().values, spectrum.intensity);
        assert!(sink.attribute("noise_amplification_db").is_some());

        // realized bounds, inside the requested window
        let factory = spec.driver().wavelengths(CalibrationSource::Factory).unwrap();
        let (lo, hi) = spectrum.window.unwrap();
        assert!(321.45 < lo && hi <= 742.11);
        let first = factory.iter().position(|&w| w > 321.45).unwrap();
        let last = factory.iter().rposition(|&w| w <= 742.11).unwrap();
        assert_eq!(lo, factory[first]);
        assert_eq!(hi, factory[last]);
        assert_eq!(sink.attribute("window_min_nm"), Some(&AttributeValue::Float(lo)));
    }

    #[test]
    fn test_window_is_on_factory_axis() {
        let mut spec = Spectrometer::open(MockCcs::calibrated().with_uniform_scan(1000, 20_000)).unwrap();
        assert_eq!(spec.driver().calibration_source(), CalibrationSource::User);

        let spectrum = spec.scan_spectrum(ScanKind::default_noise(), None).unwrap();
        let (lo, hi) = spectrum.window.unwrap();
        let factory = spec.driver().wavelengths(CalibrationSource::Factory).unwrap();
        assert!(factory.contains(&lo) && factory.contains(&hi));
        assert_eq!(spectrum.wavelengths, spec.wavelengths().unwrap());
    }

    #[test]
    fn test_scan_without_sink() {
        let mut spec = Spectrometer::open(MockCcs::calibrated().with_uniform_scan(1000, 20_000)).unwrap();
        let spectrum = spec.scan_spectrum(ScanKind::default_noise(), None).unwrap();
        let (lo, hi) = spectrum.window.unwrap();
        assert!(lo < DEFAULT_NOISE_CENTER_WAVELENGTH && DEFAULT_NOISE_CENTER_WAVELENGTH < hi);
        assert_eq!(spectrum.wavelengths.len(), spectrum.intensity.len());
    }
}
