//! Error types for CCS spectrometer operations.
//!
//! `CcsError` is the single error type of the driver. It covers transport
//! failures, corrupted or inconsistent EEPROM contents, acquisition problems
//! and the firmware bring-up path.
//!
//! ## Recovery
//!
//! The driver recovers from exactly two situations itself:
//!
//! - a dark-offset field that fails its checksum falls back to `0xFFFF`;
//! - a region whose stored checksum is `0xFFFF` is treated as never written.
//!
//! Every other error is returned to the caller unchanged and is never retried
//! inside the driver. A missing user calibration is not an error at all, it is
//! represented as `None`.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for CCS operations.
pub type Result<T> = std::result::Result<T, CcsError>;

/// Errors that can occur when working with a CCS spectrometer.
#[derive(Error, Debug)]
pub enum CcsError {
    /// EEPROM payload failed its CRC and the stored value was not the
    /// "never written" marker.
    #[error("EEPROM checksum mismatch at 0x{address:04X}: stored 0x{stored:04X}, computed 0x{computed:04X}")]
    Checksum {
        address: u16,
        stored: u16,
        computed: u16,
    },

    /// Wavelength curve is ambiguous or not monotonic, or a user calibration
    /// was requested while none is valid.
    #[error("Invalid calibration data: {reason}")]
    InvalidCalibrationData { reason: String },

    /// Dark level is saturated, the scan carries no usable signal.
    #[error("Overexposure: dark level {dark_level:.1} exceeds {threshold:.1} ADC counts")]
    Overexposure { dark_level: f64, threshold: f64 },

    /// No USB device matched the request.
    #[error("Device not found: {criteria}")]
    DeviceNotFound { criteria: String },

    /// Device did not come back under its configured product id after a
    /// firmware upload.
    #[error("Device {vendor_id:04x}:{product_id:04x} not found after {timeout:?}")]
    RenumerationTimeout {
        vendor_id: u16,
        product_id: u16,
        timeout: Duration,
    },

    /// Firmware upload stopped on a failing block; the device state is
    /// indeterminate and its presence must be checked again.
    #[error("Firmware upload stopped at block {block} of {total} ({sent} sent): {message}")]
    FirmwareUploadIncomplete {
        block: usize,
        total: usize,
        sent: usize,
        message: String,
    },

    /// Firmware file could not be parsed.
    #[error("Invalid firmware image: {message}")]
    FirmwareFormat { message: String },

    /// Discovery found an unconfigured device with no firmware file mapped.
    #[error("No firmware file configured for product id 0x{product_id:04x}")]
    NoFirmwareForProduct { product_id: u16 },

    /// Requested exposure is outside the supported range.
    #[error("Integration time {seconds} s out of range [{min} s, {max} s]")]
    InvalidIntegrationTime { seconds: f64, min: f64, max: f64 },

    /// Invalid argument for a processing or device operation.
    #[error("Invalid parameter: {message}")]
    InvalidParameter { message: String },

    /// Scan data did not become ready in time.
    #[error("Scan not ready after {timeout:?} (last status 0x{last_status:04X})")]
    ScanTimeout { timeout: Duration, last_status: u16 },

    /// USB transfer or enumeration failure.
    #[error("USB {operation} failed: {message}")]
    Transport {
        operation: &'static str,
        message: String,
    },

    /// Firmware or metadata file could not be accessed.
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl CcsError {
    /// Build a transport error from any displayable cause.
    pub fn transport(operation: &'static str, cause: impl std::fmt::Display) -> Self {
        Self::Transport {
            operation,
            message: cause.to_string(),
        }
    }

    /// Build a calibration error.
    pub fn invalid_calibration(reason: impl Into<String>) -> Self {
        Self::InvalidCalibrationData {
            reason: reason.into(),
        }
    }

    /// Build a parameter error.
    pub fn invalid_parameter(message: impl Into<String>) -> Self {
        Self::InvalidParameter {
            message: message.into(),
        }
    }

    /// Check if this is a checksum failure.
    pub fn is_checksum(&self) -> bool {
        matches!(self, Self::Checksum { .. })
    }

    /// Check if this is a "device not found" type error.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::DeviceNotFound { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_display() {
        let err = CcsError::Checksum {
            address: 0x0112,
            stored: 0x1234,
            computed: 0xABCD,
        };
        let msg = err.to_string();
        assert!(msg.contains("0x0112"));
        assert!(msg.contains("0x1234"));
        assert!(msg.contains("0xABCD"));
        assert!(err.is_checksum());
    }

    #[test]
    fn test_renumeration_timeout_display() {
        let err = CcsError::RenumerationTimeout {
            vendor_id: 0x1313,
            product_id: 0x8089,
            timeout: Duration::from_secs(10),
        };
        assert!(err.to_string().contains("1313:8089"));
    }
}
