//! USB transport capability consumed by the driver.
//!
//! The driver never talks to a host controller directly. It needs vendor
//! control transfers in both directions, one bulk-in endpoint for pixel data,
//! a device reset, and enumeration of attached devices. Anything that provides
//! those can carry a spectrometer:
//!
//! - [`crate::usb::RusbBus`] - libusb through `rusb` (feature `usb`)
//! - [`crate::mock::MockBus`] - simulated devices for tests and `--mock` runs

use std::fmt;

use crate::error::Result;

/// Identity and topology of an attached USB device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbDeviceDescriptor {
    /// USB vendor id
    pub vendor_id: u16,
    /// USB product id
    pub product_id: u16,
    /// Bus number the device is attached to
    pub bus_number: u8,
    /// Port path from the root hub
    pub port_numbers: Vec<u8>,
    /// Serial number string, when the device reports one
    pub serial_number: Option<String>,
    /// Device release number (bcdDevice) as major.minor.subminor
    pub device_version: (u8, u8, u8),
}

impl UsbDeviceDescriptor {
    /// Whether `other` sits on the same physical port.
    pub fn same_port(&self, other: &UsbDeviceDescriptor) -> bool {
        self.bus_number == other.bus_number && self.port_numbers == other.port_numbers
    }
}

impl fmt::Display for UsbDeviceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04x}:{:04x} bus {} port {:?}",
            self.vendor_id, self.product_id, self.bus_number, self.port_numbers
        )?;
        if let Some(serial) = &self.serial_number {
            write!(f, " serial {}", serial)?;
        }
        Ok(())
    }
}

/// An open device handle.
///
/// Control transfers are vendor requests addressed to the device
/// (`bmRequestType` 0xC0 for IN, 0x40 for OUT).
pub trait UsbTransport {
    /// Vendor control-in transfer returning at most `length` bytes.
    fn control_in(&mut self, request: u8, value: u16, index: u16, length: usize) -> Result<Vec<u8>>;

    /// Vendor control-out transfer, returns the number of bytes written.
    fn control_out(&mut self, request: u8, value: u16, index: u16, data: &[u8]) -> Result<usize>;

    /// Bulk-in read of up to `length` bytes.
    fn bulk_in(&mut self, endpoint: u8, length: usize) -> Result<Vec<u8>>;

    /// Select the default configuration before first use.
    fn set_configuration(&mut self) -> Result<()>;

    /// USB port reset.
    fn reset(&mut self) -> Result<()>;

    /// Descriptor of the device behind this handle.
    fn descriptor(&self) -> &UsbDeviceDescriptor;
}

impl<T: UsbTransport + ?Sized> UsbTransport for Box<T> {
    fn control_in(&mut self, request: u8, value: u16, index: u16, length: usize) -> Result<Vec<u8>> {
        (**self).control_in(request, value, index, length)
    }

    fn control_out(&mut self, request: u8, value: u16, index: u16, data: &[u8]) -> Result<usize> {
        (**self).control_out(request, value, index, data)
    }

    fn bulk_in(&mut self, endpoint: u8, length: usize) -> Result<Vec<u8>> {
        (**self).bulk_in(endpoint, length)
    }

    fn set_configuration(&mut self) -> Result<()> {
        (**self).set_configuration()
    }

    fn reset(&mut self) -> Result<()> {
        (**self).reset()
    }

    fn descriptor(&self) -> &UsbDeviceDescriptor {
        (**self).descriptor()
    }
}

/// Device enumeration.
pub trait UsbBus {
    /// Handle type produced by [`UsbBus::open`].
    type Transport: UsbTransport;

    /// All attached devices with the given vendor id.
    fn devices(&self, vendor_id: u16) -> Result<Vec<UsbDeviceDescriptor>>;

    /// Open a previously enumerated device.
    fn open(&self, device: &UsbDeviceDescriptor) -> Result<Self::Transport>;

    /// First device matching vendor/product id on the given port path.
    fn find_on_port(
        &self,
        vendor_id: u16,
        product_id: u16,
        port: &UsbDeviceDescriptor,
    ) -> Result<Option<UsbDeviceDescriptor>> {
        Ok(self
            .devices(vendor_id)?
            .into_iter()
            .find(|d| d.product_id == product_id && d.same_port(port)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(pid: u16, port: Vec<u8>) -> UsbDeviceDescriptor {
        UsbDeviceDescriptor {
            vendor_id: 0x1313,
            product_id: pid,
            bus_number: 1,
            port_numbers: port,
            serial_number: None,
            device_version: (0, 0, 0),
        }
    }

    #[test]
    fn test_same_port() {
        let a = descriptor(0x8088, vec![1, 4]);
        let b = descriptor(0x8089, vec![1, 4]);
        let c = descriptor(0x8089, vec![1, 5]);
        assert!(a.same_port(&b));
        assert!(!a.same_port(&c));
    }

    #[test]
    fn test_display() {
        let mut d = descriptor(0x8089, vec![2]);
        d.serial_number = Some("M00412345".to_string());
        let s = d.to_string();
        assert!(s.starts_with("1313:8089"));
        assert!(s.contains("M00412345"));
    }
}
