//! Device discovery and firmware bring-up.
//!
//! [`list_spectrometers`] returns every CCS on the bus that is ready for use.
//! Devices still on the boot loader (even product id) get their firmware
//! uploaded first and are then waited for until they re-enumerate under the
//! odd product id on the same port.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, instrument, warn};

use crate::error::{CcsError, Result};
use crate::firmware::{self, FirmwareImage};
use crate::protocol::{is_ccs_pid, is_configured_pid, CcsModel, THORLABS_VID};
use crate::transport::{UsbBus, UsbDeviceDescriptor, UsbTransport};

/// How long a device may take to come back after a firmware upload.
pub const DEFAULT_RENUMERATION_TIMEOUT: Duration = Duration::from_secs(10);

/// Delay between two bus scans while waiting.
pub const DEFAULT_RENUMERATION_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Re-enumeration wait settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenumerationPolicy {
    /// Give up after this long
    pub timeout: Duration,
    /// Delay between bus scans
    pub poll_interval: Duration,
}

impl Default for RenumerationPolicy {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_RENUMERATION_TIMEOUT,
            poll_interval: DEFAULT_RENUMERATION_POLL_INTERVAL,
        }
    }
}

/// Firmware file per unconfigured product id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FirmwareMap {
    files: BTreeMap<u16, PathBuf>,
}

impl FirmwareMap {
    /// Empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// `<directory>/CCS100.spt` ... `<directory>/CCS200.spt` for every model.
    pub fn from_directory(directory: impl AsRef<Path>) -> Self {
        let directory = directory.as_ref();
        let files = CcsModel::ALL
            .into_iter()
            .map(|m| (m.unconfigured_pid(), directory.join(format!("{}.spt", m.name()))))
            .collect();
        Self { files }
    }

    /// Map a product id to a firmware file.
    pub fn insert(&mut self, product_id: u16, path: impl Into<PathBuf>) -> Option<PathBuf> {
        self.files.insert(product_id, path.into())
    }

    /// Builder form of [`FirmwareMap::insert`].
    pub fn with(mut self, product_id: u16, path: impl Into<PathBuf>) -> Self {
        self.insert(product_id, path);
        self
    }

    /// Firmware file for a product id.
    pub fn get(&self, product_id: u16) -> Option<&Path> {
        self.files.get(&product_id).map(PathBuf::as_path)
    }

    /// All entries.
    pub fn iter(&self) -> impl Iterator<Item = (u16, &Path)> {
        self.files.iter().map(|(pid, path)| (*pid, path.as_path()))
    }
}

/// Wait until a device with the given ids shows up on the port of `port`.
///
/// # Errors
///
/// [`CcsError::RenumerationTimeout`] when the policy timeout expires.
#[instrument(skip(bus, port, policy), fields(port = ?port.port_numbers))]
pub fn wait_for_device<B: UsbBus>(
    bus: &B,
    vendor_id: u16,
    product_id: u16,
    port: &UsbDeviceDescriptor,
    policy: RenumerationPolicy,
) -> Result<UsbDeviceDescriptor> {
    let started = Instant::now();
    loop {
        if let Some(device) = bus.find_on_port(vendor_id, product_id, port)? {
            debug!(device = %device, elapsed = ?started.elapsed(), "device is back");
            return Ok(device);
        }
        if started.elapsed() >= policy.timeout {
            warn!(timeout = ?policy.timeout, "Device did not re-enumerate");
            return Err(CcsError::RenumerationTimeout {
                vendor_id,
                product_id,
                timeout: policy.timeout,
            });
        }
        thread::sleep(policy.poll_interval);
    }
}

/// Upload `image` to the unconfigured device with `product_id` on the port of
/// `port`, then wait for it under `product_id + 1`.
///
/// # Errors
///
/// - [`CcsError::DeviceNotFound`] when no such device is attached
/// - [`CcsError::FirmwareUploadIncomplete`] when a block failed; no waiting
///   happens in that case
/// - [`CcsError::RenumerationTimeout`] when the device does not come back
#[instrument(skip(bus, port, image, policy))]
pub fn renumerate<B: UsbBus>(
    bus: &B,
    product_id: u16,
    port: &UsbDeviceDescriptor,
    image: &FirmwareImage,
    policy: RenumerationPolicy,
) -> Result<UsbDeviceDescriptor> {
    let device = bus
        .find_on_port(THORLABS_VID, product_id, port)?
        .ok_or_else(|| CcsError::DeviceNotFound {
            criteria: format!(
                "{:04x}:{:04x} on bus {} port {:?}",
                THORLABS_VID, product_id, port.bus_number, port.port_numbers
            ),
        })?;

    info!(device = %device, blocks = image.len(), "Uploading firmware");
    {
        let mut handle = bus.open(&device)?;
        handle.set_configuration()?;
        firmware::upload(&mut handle, image).into_result()?;
    }

    wait_for_device(bus, THORLABS_VID, product_id + 1, &device, policy)
}

/// All usable CCS spectrometers on the bus, uploading firmware where needed.
///
/// # Errors
///
/// [`CcsError::NoFirmwareForProduct`] for an unconfigured device without a
/// firmware entry, plus everything [`renumerate`] can return.
#[instrument(skip_all)]
pub fn list_spectrometers<B: UsbBus>(
    bus: &B,
    firmware: &FirmwareMap,
    policy: RenumerationPolicy,
) -> Result<Vec<UsbDeviceDescriptor>> {
    let candidates: Vec<UsbDeviceDescriptor> = bus
        .devices(THORLABS_VID)?
        .into_iter()
        .filter(|d| is_ccs_pid(d.product_id))
        .collect();
    debug!(count = candidates.len(), "CCS devices on bus");

    let mut ready = Vec::with_capacity(candidates.len());
    for device in candidates {
        if is_configured_pid(device.product_id) {
            ready.push(device);
            continue;
        }

        let path = firmware.get(device.product_id).ok_or(CcsError::NoFirmwareForProduct {
            product_id: device.product_id,
        })?;
        let image = FirmwareImage::load(path)?;
        ready.push(renumerate(bus, device.product_id, &device, &image, policy)?);
    }
    Ok(ready)
}

/// First usable spectrometer, optionally matching a serial number.
pub fn find_spectrometer<B: UsbBus>(
    bus: &B,
    firmware: &FirmwareMap,
    policy: RenumerationPolicy,
    serial_number: Option<&str>,
) -> Result<UsbDeviceDescriptor> {
    list_spectrometers(bus, firmware, policy)?
        .into_iter()
        .find(|d| serial_number.map_or(true, |s| d.serial_number.as_deref() == Some(s)))
        .ok_or_else(|| CcsError::DeviceNotFound {
            criteria: match serial_number {
                Some(s) => format!("CCS spectrometer with serial {}", s),
                None => "any CCS spectrometer".to_string(),
            },
        })
}
