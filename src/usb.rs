//! libusb transport through `rusb`.
//!
//! Enabled with the `usb` feature. Opening a device selects configuration 1
//! and claims interface 0; every transfer uses the timeout given to
//! [`RusbBus::new`].

use std::time::Duration;

use rusb::{Context, Device, DeviceHandle, Direction, Recipient, RequestType, UsbContext};
use tracing::{debug, warn};

use crate::error::{CcsError, Result};
use crate::protocol::DEFAULT_TRANSFER_TIMEOUT_MS;
use crate::transport::{UsbBus, UsbDeviceDescriptor, UsbTransport};

const CONFIGURATION: u8 = 1;
const INTERFACE: u8 = 0;

/// Host USB bus.
pub struct RusbBus {
    context: Context,
    timeout: Duration,
}

impl std::fmt::Debug for RusbBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RusbBus").field("timeout", &self.timeout).finish()
    }
}

impl RusbBus {
    /// New libusb context with the given transfer timeout.
    pub fn new(timeout: Duration) -> Result<Self> {
        let context = Context::new().map_err(|e| CcsError::transport("init", e))?;
        Ok(Self { context, timeout })
    }

    /// New libusb context with the default transfer timeout.
    pub fn with_default_timeout() -> Result<Self> {
        Self::new(Duration::from_millis(DEFAULT_TRANSFER_TIMEOUT_MS))
    }

    fn describe(&self, device: &Device<Context>) -> rusb::Result<UsbDeviceDescriptor> {
        let desc = device.device_descriptor()?;
        let version = desc.device_version();

        // Without access rights the device cannot be opened; it is still listed.
        let serial_number = match device.open() {
            Ok(handle) => handle
                .read_serial_number_string_ascii(&desc)
                .map_err(|e| debug!(error = %e, "no serial number string"))
                .ok(),
            Err(e) => {
                warn!(
                    bus = device.bus_number(),
                    address = device.address(),
                    error = %e,
                    "Cannot open device to read its serial number"
                );
                None
            }
        };

        Ok(UsbDeviceDescriptor {
            vendor_id: desc.vendor_id(),
            product_id: desc.product_id(),
            bus_number: device.bus_number(),
            port_numbers: device.port_numbers()?,
            serial_number,
            device_version: (version.major(), version.minor(), version.sub_minor()),
        })
    }

    fn find_device(&self, wanted: &UsbDeviceDescriptor) -> Result<Device<Context>> {
        let list = self.context.devices().map_err(|e| CcsError::transport("enumerate", e))?;
        for device in list.iter() {
            let Ok(desc) = device.device_descriptor() else {
                continue;
            };
            if desc.vendor_id() != wanted.vendor_id || desc.product_id() != wanted.product_id {
                continue;
            }
            if device.bus_number() != wanted.bus_number {
                continue;
            }
            if device.port_numbers().ok().as_deref() == Some(wanted.port_numbers.as_slice()) {
                return Ok(device);
            }
        }
        Err(CcsError::DeviceNotFound {
            criteria: wanted.to_string(),
        })
    }
}

impl UsbBus for RusbBus {
    type Transport = RusbTransport;

    fn devices(&self, vendor_id: u16) -> Result<Vec<UsbDeviceDescriptor>> {
        let list = self.context.devices().map_err(|e| CcsError::transport("enumerate", e))?;
        let mut found = Vec::new();
        for device in list.iter() {
            let Ok(desc) = device.device_descriptor() else {
                continue;
            };
            if desc.vendor_id() != vendor_id {
                continue;
            }
            match self.describe(&device) {
                Ok(d) => found.push(d),
                Err(e) => warn!(error = %e, "Skipping device with unreadable descriptor"),
            }
        }
        Ok(found)
    }

    fn open(&self, device: &UsbDeviceDescriptor) -> Result<RusbTransport> {
        let handle = self
            .find_device(device)?
            .open()
            .map_err(|e| CcsError::transport("open", e))?;
        debug!(device = %device, "opened");
        Ok(RusbTransport {
            handle,
            descriptor: device.clone(),
            timeout: self.timeout,
        })
    }
}

/// Open libusb device handle.
pub struct RusbTransport {
    handle: DeviceHandle<Context>,
    descriptor: UsbDeviceDescriptor,
    timeout: Duration,
}

impl std::fmt::Debug for RusbTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RusbTransport")
            .field("descriptor", &self.descriptor)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl UsbTransport for RusbTransport {
    fn control_in(&mut self, request: u8, value: u16, index: u16, length: usize) -> Result<Vec<u8>> {
        let request_type = rusb::request_type(Direction::In, RequestType::Vendor, Recipient::Device);
        let mut buf = vec![0u8; length];
        let n = self
            .handle
            .read_control(request_type, request, value, index, &mut buf, self.timeout)
            .map_err(|e| CcsError::transport("control in", e))?;
        buf.truncate(n);
        Ok(buf)
    }

    fn control_out(&mut self, request: u8, value: u16, index: u16, data: &[u8]) -> Result<usize> {
        let request_type = rusb::request_type(Direction::Out, RequestType::Vendor, Recipient::Device);
        self.handle
            .write_control(request_type, request, value, index, data, self.timeout)
            .map_err(|e| CcsError::transport("control out", e))
    }

    fn bulk_in(&mut self, endpoint: u8, length: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; length];
        let n = self
            .handle
            .read_bulk(endpoint, &mut buf, self.timeout)
            .map_err(|e| CcsError::transport("bulk in", e))?;
        buf.truncate(n);
        Ok(buf)
    }

    fn set_configuration(&mut self) -> Result<()> {
        #[cfg(any(target_os = "linux", target_os = "macos"))]
        {
            if self.handle.kernel_driver_active(INTERFACE).unwrap_or(false) {
                self.handle
                    .detach_kernel_driver(INTERFACE)
                    .map_err(|e| CcsError::transport("detach kernel driver", e))?;
            }
        }
        self.handle
            .set_active_configuration(CONFIGURATION)
            .map_err(|e| CcsError::transport("set configuration", e))?;
        self.handle
            .claim_interface(INTERFACE)
            .map_err(|e| CcsError::transport("claim interface", e))
    }

    fn reset(&mut self) -> Result<()> {
        self.handle.reset().map_err(|e| CcsError::transport("reset", e))
    }

    fn descriptor(&self) -> &UsbDeviceDescriptor {
        &self.descriptor
    }
}
