//! Wire-level constants of the CCS USB protocol.
//!
//! Request codes, sensor geometry and status bits shared by the reader,
//! scan engine and firmware loader.

use bitflags::bitflags;

// =============================================================================
// Device identification
// =============================================================================

/// Thorlabs USB vendor id.
pub const THORLABS_VID: u16 = 0x1313;

/// Lowest product id of the CCS family.
pub const CCS_PID_FIRST: u16 = 0x8080;

/// Highest product id of the CCS family.
pub const CCS_PID_LAST: u16 = 0x8089;

/// CCS models. Each model enumerates under an even product id until its
/// firmware is loaded, then under the following odd id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CcsModel {
    /// CCS100 compact spectrometer
    Ccs100,
    /// CCS125 special spectrometer
    Ccs125,
    /// CCS150 UV spectrometer
    Ccs150,
    /// CCS175 NIR spectrometer
    Ccs175,
    /// CCS200 UV-NIR spectrometer
    Ccs200,
}

impl CcsModel {
    /// All models, in product id order.
    pub const ALL: [CcsModel; 5] = [
        CcsModel::Ccs100,
        CcsModel::Ccs125,
        CcsModel::Ccs150,
        CcsModel::Ccs175,
        CcsModel::Ccs200,
    ];

    /// Product id before firmware upload.
    pub fn unconfigured_pid(self) -> u16 {
        match self {
            Self::Ccs100 => 0x8080,
            Self::Ccs125 => 0x8082,
            Self::Ccs150 => 0x8084,
            Self::Ccs175 => 0x8086,
            Self::Ccs200 => 0x8088,
        }
    }

    /// Product id once the firmware runs.
    pub fn configured_pid(self) -> u16 {
        self.unconfigured_pid() + 1
    }

    /// Model for either of its product ids.
    pub fn from_pid(pid: u16) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|m| m.unconfigured_pid() == pid & !1)
    }

    /// Marketing name, also the firmware file stem.
    pub fn name(self) -> &'static str {
        match self {
            Self::Ccs100 => "CCS100",
            Self::Ccs125 => "CCS125",
            Self::Ccs150 => "CCS150",
            Self::Ccs175 => "CCS175",
            Self::Ccs200 => "CCS200",
        }
    }
}

/// Odd product ids belong to devices already running their firmware.
pub fn is_configured_pid(pid: u16) -> bool {
    pid & 1 == 1
}

/// Whether `pid` belongs to the CCS family.
pub fn is_ccs_pid(pid: u16) -> bool {
    (CCS_PID_FIRST..=CCS_PID_LAST).contains(&pid)
}

// =============================================================================
// Vendor requests
// =============================================================================

/// Read EEPROM.
pub const RCMD_READ_EEPROM: u8 = 0x21;
/// Read on-chip RAM, also the firmware loader write request.
pub const RCMD_READ_RAM: u8 = 0xA0;
/// Read the 16-bit status register.
pub const RCMD_GET_STATUS: u8 = 0x30;
/// Read or write the integration time registers.
pub const WCMD_INTEGRATION_TIME: u8 = 0x23;
/// Write the scan mode.
pub const WCMD_MODUS: u8 = 0x24;
/// Reset the device.
pub const WCMD_RESET: u8 = 0x26;

/// 8051 CPU control/status register address, written through the RAM request.
pub const CPUCS_ADDRESS: u16 = 0xE600;

/// Largest payload of a single endpoint 0 transfer.
pub const ENDPOINT_0_TRANSFER_SIZE: usize = 64;

/// Bulk endpoint carrying raw scan data.
pub const SCAN_DATA_ENDPOINT: u8 = 0x86;

/// Default USB transfer timeout in milliseconds.
pub const DEFAULT_TRANSFER_TIMEOUT_MS: u64 = 2000;

// =============================================================================
// Sensor geometry
// =============================================================================

/// Calibrated pixels per scan.
pub const NUM_PIXELS: usize = 3648;
/// Raw words delivered per scan, including dark and dummy pixels.
pub const NUM_RAW_PIXELS: usize = 3694;
/// Number of shielded pixels.
pub const NUM_DARK_PIXELS: usize = 12;
/// Index of the first shielded pixel within the raw scan.
pub const DARK_PIXELS_OFFSET: usize = 16;
/// Index of the first calibrated pixel within the raw scan.
pub const SCAN_PIXELS_OFFSET: usize = 32;
/// Full scale of the 16-bit ADC.
pub const MAX_ADC_VALUE: f64 = 65535.0;
/// Fraction of full scale above which the dark level marks an overexposure.
pub const DARK_LEVEL_THRESHOLD: f64 = 0.99;

// =============================================================================
// Status and scan mode
// =============================================================================

bitflags! {
    /// Bits of the device status register.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DeviceStatus: u16 {
        /// Waiting for a new scan
        const SCAN_IDLE = 0x0002;
        /// Scan in progress
        const SCAN_TRIGGERED = 0x0004;
        /// Scan starting
        const SCAN_START_TRANSFER = 0x0008;
        /// Scan done, data waiting for transfer
        const SCAN_TRANSFER = 0x0010;
        /// Idle with the external trigger armed
        const WAIT_FOR_EXT_TRIGGER = 0x0080;
    }
}

impl DeviceStatus {
    /// Whether scan data can be read.
    pub fn scan_ready(self) -> bool {
        self.contains(Self::SCAN_TRANSFER)
    }
}

/// Acquisition mode written through [`WCMD_MODUS`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ScanMode {
    /// One scan on software trigger
    InternalSingleShot = 0,
    /// Free running
    InternalContinuous = 1,
    /// One scan on the external trigger input
    ExternalSingleShot = 2,
    /// Scan on every external trigger
    ExternalContinuous = 3,
}
