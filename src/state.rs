//! Per-device state held by an open driver.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::calibration::{Calibration, CalibrationSource};
use crate::eeprom::{self, layout, BlockState};
use crate::error::Result;
use crate::protocol::CcsModel;
use crate::transport::UsbTransport;

/// Three-part version number.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Version {
    /// Major
    pub major: u8,
    /// Minor
    pub minor: u8,
    /// Subminor
    pub subminor: u8,
}

impl Version {
    /// Version from its parts.
    pub const fn new(major: u8, minor: u8, subminor: u8) -> Self {
        Self { major, minor, subminor }
    }
}

impl From<(u8, u8, u8)> for Version {
    fn from((major, minor, subminor): (u8, u8, u8)) -> Self {
        Self::new(major, minor, subminor)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.subminor)
    }
}

/// Who the device is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    /// USB vendor id
    pub vendor_id: u16,
    /// USB product id
    pub product_id: u16,
    /// Serial number from EEPROM
    pub serial_number: String,
    /// Free-form label, empty when never written
    pub user_label: String,
    /// Firmware release reported in the USB device descriptor
    pub firmware_version: Version,
    /// Version stored by the calibration software, zero when never written
    pub hardware_version: Version,
}

impl DeviceIdentity {
    /// Read the identity fields of an open device.
    #[instrument(skip(transport))]
    pub fn read<T: UsbTransport + ?Sized>(transport: &mut T) -> Result<Self> {
        let descriptor = transport.descriptor().clone();

        let serial_number = eeprom::read_region(transport, layout::SERIAL_NUMBER)?.ascii();

        let label = eeprom::read_region(transport, layout::USER_LABEL)?;
        let user_label = if label.is_unwritten() {
            String::new()
        } else {
            label.ascii()
        };

        let version = eeprom::read_region(transport, layout::SOFTWARE_VERSION)?;
        let hardware_version = if version.state == BlockState::Verified {
            Version::new(version.data[0], version.data[1], version.data[2])
        } else {
            Version::default()
        };

        Ok(Self {
            vendor_id: descriptor.vendor_id,
            product_id: descriptor.product_id,
            serial_number,
            user_label,
            firmware_version: descriptor.device_version.into(),
            hardware_version,
        })
    }

    /// Model derived from the product id.
    pub fn model(&self) -> Option<CcsModel> {
        CcsModel::from_pid(self.product_id)
    }
}

/// Everything an open driver knows about its device.
#[derive(Debug, Clone)]
pub struct DeviceState {
    /// Identity and versions
    pub identity: DeviceIdentity,
    /// Calibration read from EEPROM
    pub calibration: Calibration,
    /// Current integration time in seconds
    pub integration_time: f64,
    /// Wavelength calibration reported by default
    pub source: CalibrationSource,
}
