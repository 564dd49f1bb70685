//! Simulated CCS spectrometer for testing without hardware.
//!
//! `MockCcs` answers the same vendor requests as a real device: EEPROM and RAM
//! reads, status polls, integration time registers, scan mode writes and bulk
//! scan transfers. Every control transfer is logged so tests can assert on the
//! exact request stream.
//!
//! `MockBus` holds several simulated devices. A device opened through the bus
//! re-enumerates under its odd product id when the CPU is released after a
//! firmware upload, just like the real boot loader does.
//!
//! # Example
//!
//! ```
//! use ccs_daq::mock::MockCcs;
//! use ccs_daq::driver::CcsDriver;
//!
//! let device = MockCcs::calibrated().with_uniform_scan(1000, 33768);
//! let mut driver = CcsDriver::open(device).unwrap();
//! let spectrum = driver.scan_data().unwrap();
//! assert_eq!(spectrum.len(), 3648);
//! ```

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::calibration::eval_poly;
use crate::eeprom::{crc16, layout, Region, CHECKSUM_SIZE};
use crate::error::{CcsError, Result};
use crate::protocol::{
    DeviceStatus, CPUCS_ADDRESS, NUM_DARK_PIXELS, NUM_PIXELS, NUM_RAW_PIXELS, RCMD_GET_STATUS,
    RCMD_READ_EEPROM, RCMD_READ_RAM, SCAN_DATA_ENDPOINT, SCAN_PIXELS_OFFSET, THORLABS_VID,
    WCMD_INTEGRATION_TIME, WCMD_MODUS, WCMD_RESET, DARK_PIXELS_OFFSET,
};
use crate::transport::{UsbBus, UsbDeviceDescriptor, UsbTransport};

const EEPROM_SIZE: usize = 0x8000;
const RAM_SIZE: usize = 0x10000;

/// Factory polynomial of [`MockCcs::calibrated`], roughly 320 to 744 nm.
pub const MOCK_FACTORY_POLY: [f64; 4] = [320.0, 0.12, -1.0e-6, 0.0];

/// One logged control transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlRecord {
    /// bRequest
    pub request: u8,
    /// wValue
    pub value: u16,
    /// wIndex
    pub index: u16,
    /// Requested (in) or written (out) length
    pub length: usize,
    /// Payload written, empty for control-in
    pub data: Vec<u8>,
}

// =============================================================================
// Simulated device
// =============================================================================

/// Simulated CCS device.
#[derive(Debug, Clone)]
pub struct MockCcs {
    descriptor: UsbDeviceDescriptor,
    eeprom: Vec<u8>,
    ram: Vec<u8>,
    status_queue: VecDeque<u16>,
    idle_status: u16,
    raw_scan: Vec<u16>,
    integration_registers: [u8; 6],
    control_in_log: Vec<ControlRecord>,
    control_out_log: Vec<ControlRecord>,
    fail_control_out_at: Option<usize>,
    renumerate_on_release: bool,
    reset_count: usize,
    usb_reset_count: usize,
    configured: bool,
    bus: Option<Arc<Mutex<BusState>>>,
}

impl Default for MockCcs {
    fn default() -> Self {
        Self::new()
    }
}

impl MockCcs {
    /// Blank CCS200 with erased EEPROM, reporting scan data ready on every
    /// status poll.
    pub fn new() -> Self {
        Self {
            descriptor: UsbDeviceDescriptor {
                vendor_id: THORLABS_VID,
                product_id: 0x8089,
                bus_number: 1,
                port_numbers: vec![1],
                serial_number: Some("M00000001".to_string()),
                device_version: (2, 1, 0),
            },
            eeprom: vec![0xFF; EEPROM_SIZE],
            ram: vec![0x00; RAM_SIZE],
            status_queue: VecDeque::new(),
            idle_status: (DeviceStatus::SCAN_IDLE | DeviceStatus::SCAN_TRANSFER).bits(),
            raw_scan: vec![0; NUM_RAW_PIXELS],
            integration_registers: [0; 6],
            control_in_log: Vec::new(),
            control_out_log: Vec::new(),
            fail_control_out_at: None,
            renumerate_on_release: true,
            reset_count: 0,
            usb_reset_count: 0,
            configured: false,
            bus: None,
        }
    }

    /// Device with a complete, valid calibration set.
    ///
    /// Factory polynomial [`MOCK_FACTORY_POLY`], five user points on the same
    /// curve, neutral factory amplitude correction, user amplitude correction
    /// rising from 1.0 at the center to 2.0 at both edges.
    pub fn calibrated() -> Self {
        let user_points: Vec<(u32, f64)> = [100u32, 900, 1800, 2700, 3500]
            .into_iter()
            .map(|p| (p, eval_poly(&MOCK_FACTORY_POLY, f64::from(p))))
            .collect();
        let factory = vec![1.0f32; NUM_PIXELS];
        let center = (NUM_PIXELS / 2) as f32;
        let user: Vec<f32> = (0..NUM_PIXELS)
            .map(|i| {
                let x = (i as f32 - center) / center;
                1.0 + x * x
            })
            .collect();

        Self::new()
            .with_serial_number("M00555555")
            .with_software_version([1, 2, 3, 0])
            .with_user_label("mock bench")
            .with_factory_poly(MOCK_FACTORY_POLY)
            .with_user_points(&user_points)
            .with_factory_amplitude(&factory)
            .with_user_amplitude(&user)
            .with_dark_offsets(1500, 1480)
    }

    // -------------------------------------------------------------------------
    // EEPROM contents
    // -------------------------------------------------------------------------

    /// Write raw bytes, no checksum.
    pub fn write_eeprom(&mut self, address: u16, bytes: &[u8]) {
        let start = address as usize;
        let end = (start + bytes.len()).min(EEPROM_SIZE);
        self.eeprom[start..end].copy_from_slice(&bytes[..end - start]);
    }

    /// Write `payload` at the region start and a valid checksum over the
    /// whole region after it.
    pub fn write_eeprom_region(&mut self, region: Region, payload: &[u8]) {
        self.write_eeprom(region.address, payload);
        let start = region.address as usize;
        let end = start + region.length as usize;
        let crc = crc16(&self.eeprom[start..end]);
        self.write_eeprom(region.address + region.length, &crc.to_le_bytes());
    }

    /// Overwrite the stored checksum of a region.
    pub fn corrupt_checksum(&mut self, region: Region) {
        let at = region.address + region.length;
        let start = at as usize;
        let stored = u16::from_le_bytes([self.eeprom[start], self.eeprom[start + 1]]);
        let bad = if stored == 0x0000 { 0x0001 } else { stored ^ 0x5A5A };
        self.write_eeprom(at, &bad.to_le_bytes()[..CHECKSUM_SIZE as usize]);
    }

    /// Raw EEPROM image.
    pub fn eeprom_image(&self) -> &[u8] {
        &self.eeprom
    }

    /// Serial number field.
    pub fn with_serial_number(mut self, serial: &str) -> Self {
        let mut field = vec![0u8; layout::SERIAL_NUMBER.length as usize];
        let n = serial.len().min(field.len());
        field[..n].copy_from_slice(&serial.as_bytes()[..n]);
        self.write_eeprom(layout::SERIAL_NUMBER.address, &field);
        self
    }

    /// Software version bytes (major, minor, subminor, reserved).
    pub fn with_software_version(mut self, version: [u8; 4]) -> Self {
        self.write_eeprom_region(layout::SOFTWARE_VERSION, &version);
        self
    }

    /// User label field.
    pub fn with_user_label(mut self, label: &str) -> Self {
        let mut field = vec![0u8; layout::USER_LABEL.length as usize];
        let n = label.len().min(field.len());
        field[..n].copy_from_slice(&label.as_bytes()[..n]);
        self.write_eeprom_region(layout::USER_LABEL, &field);
        self
    }

    /// Factory polynomial coefficients, ascending order.
    pub fn with_factory_poly(mut self, poly: [f64; 4]) -> Self {
        self.write_eeprom_region(layout::FACTORY_COEF_FLAG, &1u16.to_le_bytes());
        self.write_eeprom_region(layout::FACTORY_COEF_DATA, &f64_bytes(&poly));
        self
    }

    /// User calibration points as `(pixel, wavelength)` pairs.
    ///
    /// More than [`layout::MAX_USER_POINTS`] pairs only sets the count; the
    /// stored arrays keep the first ten.
    pub fn with_user_points(mut self, points: &[(u32, f64)]) -> Self {
        let max = layout::MAX_USER_POINTS;
        let mut data = vec![0u8; layout::USER_POINTS_DATA.length as usize];
        for (i, (pixel, wavelength)) in points.iter().take(max).enumerate() {
            data[i * 4..i * 4 + 4].copy_from_slice(&pixel.to_le_bytes());
            let at = max * 4 + i * 8;
            data[at..at + 8].copy_from_slice(&wavelength.to_le_bytes());
        }
        self.write_eeprom_region(layout::USER_POINTS_COUNT, &(points.len() as u16).to_le_bytes());
        self.write_eeprom_region(layout::USER_POINTS_DATA, &data);
        self
    }

    /// Mark the user calibration as absent (count 0xFFFF).
    pub fn without_user_points(mut self) -> Self {
        self.write_eeprom_region(layout::USER_POINTS_COUNT, &0xFFFFu16.to_le_bytes());
        self
    }

    /// Factory amplitude correction factors.
    pub fn with_factory_amplitude(mut self, factors: &[f32]) -> Self {
        self.write_eeprom_region(layout::ACOR_FACTORY, &f32_bytes(factors));
        self
    }

    /// User amplitude correction factors.
    pub fn with_user_amplitude(mut self, factors: &[f32]) -> Self {
        self.write_eeprom_region(layout::ACOR_USER, &f32_bytes(factors));
        self
    }

    /// Even and odd dark offset maxima.
    pub fn with_dark_offsets(mut self, even: u16, odd: u16) -> Self {
        self.write_eeprom_region(layout::EVEN_OFFSET_MAX, &even.to_le_bytes());
        self.write_eeprom_region(layout::ODD_OFFSET_MAX, &odd.to_le_bytes());
        self
    }

    // -------------------------------------------------------------------------
    // Acquisition behaviour
    // -------------------------------------------------------------------------

    /// Replace the USB descriptor.
    pub fn with_descriptor(mut self, descriptor: UsbDeviceDescriptor) -> Self {
        self.descriptor = descriptor;
        self
    }

    /// Product id the device enumerates under.
    pub fn with_product_id(mut self, product_id: u16) -> Self {
        self.descriptor.product_id = product_id;
        self
    }

    /// Port path the device enumerates on.
    pub fn with_port(mut self, port_numbers: Vec<u8>) -> Self {
        self.descriptor.port_numbers = port_numbers;
        self
    }

    /// Raw scan with `dark` on the shielded pixels and `signal` on every
    /// calibrated pixel.
    pub fn with_uniform_scan(mut self, dark: u16, signal: u16) -> Self {
        let mut raw = vec![0u16; NUM_RAW_PIXELS];
        raw[DARK_PIXELS_OFFSET..DARK_PIXELS_OFFSET + NUM_DARK_PIXELS].fill(dark);
        raw[SCAN_PIXELS_OFFSET..SCAN_PIXELS_OFFSET + NUM_PIXELS].fill(signal);
        self.raw_scan = raw;
        self
    }

    /// Replace the raw scan words.
    pub fn set_raw_scan(&mut self, raw: Vec<u16>) {
        self.raw_scan = raw;
    }

    /// Queue a status word returned by the next poll.
    pub fn push_status(&mut self, status: u16) {
        self.status_queue.push_back(status);
    }

    /// Status returned once the queue is empty.
    pub fn set_idle_status(&mut self, status: u16) {
        self.idle_status = status;
    }

    /// Fail the `n`-th control-out transfer (0-based).
    pub fn fail_control_out_at(mut self, n: usize) -> Self {
        self.fail_control_out_at = Some(n);
        self
    }

    /// Never come back under the odd product id after a firmware upload.
    pub fn without_renumeration(mut self) -> Self {
        self.renumerate_on_release = false;
        self
    }

    // -------------------------------------------------------------------------
    // Inspection
    // -------------------------------------------------------------------------

    /// Control-in transfers seen so far.
    pub fn control_in_log(&self) -> &[ControlRecord] {
        &self.control_in_log
    }

    /// Control-out transfers seen so far.
    pub fn control_out_log(&self) -> &[ControlRecord] {
        &self.control_out_log
    }

    /// Forget logged transfers.
    pub fn clear_logs(&mut self) {
        self.control_in_log.clear();
        self.control_out_log.clear();
    }

    /// Current integration time register block.
    pub fn integration_registers(&self) -> [u8; 6] {
        self.integration_registers
    }

    /// Number of reset commands received.
    pub fn reset_count(&self) -> usize {
        self.reset_count
    }

    /// Number of USB port resets.
    pub fn usb_reset_count(&self) -> usize {
        self.usb_reset_count
    }

    /// Whether the default configuration was selected.
    pub fn is_configured(&self) -> bool {
        self.configured
    }

    fn next_status(&mut self) -> u16 {
        self.status_queue.pop_front().unwrap_or(self.idle_status)
    }

    fn on_cpu_release(&mut self) {
        if !self.renumerate_on_release {
            return;
        }
        if let Some(bus) = &self.bus {
            bus.lock().renumerate(&self.descriptor);
        }
    }
}

impl UsbTransport for MockCcs {
    fn control_in(&mut self, request: u8, value: u16, index: u16, length: usize) -> Result<Vec<u8>> {
        self.control_in_log.push(ControlRecord {
            request,
            value,
            index,
            length,
            data: Vec::new(),
        });

        match request {
            RCMD_READ_EEPROM => Ok(memory_slice(&self.eeprom, value, length, 0xFF)),
            RCMD_READ_RAM => Ok(memory_slice(&self.ram, value, length, 0x00)),
            RCMD_GET_STATUS => Ok(self.next_status().to_le_bytes().to_vec()),
            WCMD_INTEGRATION_TIME => Ok(self.integration_registers[..length.min(6)].to_vec()),
            other => Err(CcsError::transport(
                "control_in",
                format!("mock has no handler for request 0x{:02X}", other),
            )),
        }
    }

    fn control_out(&mut self, request: u8, value: u16, index: u16, data: &[u8]) -> Result<usize> {
        let n = self.control_out_log.len();
        self.control_out_log.push(ControlRecord {
            request,
            value,
            index,
            length: data.len(),
            data: data.to_vec(),
        });

        if self.fail_control_out_at == Some(n) {
            return Err(CcsError::transport("control_out", "pipe stalled"));
        }

        match request {
            RCMD_READ_RAM => {
                let start = value as usize;
                let end = (start + data.len()).min(RAM_SIZE);
                self.ram[start..end].copy_from_slice(&data[..end - start]);
                if value == CPUCS_ADDRESS && data.first() == Some(&0x00) {
                    self.on_cpu_release();
                }
            }
            WCMD_INTEGRATION_TIME => {
                let n = data.len().min(6);
                self.integration_registers[..n].copy_from_slice(&data[..n]);
            }
            WCMD_MODUS => debug!(mode = value, "mock scan mode"),
            WCMD_RESET => self.reset_count += 1,
            other => {
                return Err(CcsError::transport(
                    "control_out",
                    format!("mock has no handler for request 0x{:02X}", other),
                ))
            }
        }
        Ok(data.len())
    }

    fn bulk_in(&mut self, endpoint: u8, length: usize) -> Result<Vec<u8>> {
        if endpoint != SCAN_DATA_ENDPOINT {
            return Err(CcsError::transport(
                "bulk_in",
                format!("no such endpoint 0x{:02X}", endpoint),
            ));
        }
        let mut bytes: Vec<u8> = self.raw_scan.iter().flat_map(|w| w.to_le_bytes()).collect();
        bytes.truncate(length);
        Ok(bytes)
    }

    fn set_configuration(&mut self) -> Result<()> {
        self.configured = true;
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        self.usb_reset_count += 1;
        Ok(())
    }

    fn descriptor(&self) -> &UsbDeviceDescriptor {
        &self.descriptor
    }
}

// =============================================================================
// Simulated bus
// =============================================================================

#[derive(Debug, Default)]
struct BusState {
    devices: Vec<MockCcs>,
}

impl BusState {
    fn renumerate(&mut self, from: &UsbDeviceDescriptor) {
        if let Some(dev) = self
            .devices
            .iter_mut()
            .find(|d| d.descriptor.same_port(from) && d.descriptor.product_id == from.product_id)
        {
            dev.descriptor.product_id |= 1;
            debug!(device = %dev.descriptor, "mock device re-enumerated");
        }
    }
}

/// Simulated USB bus.
#[derive(Debug, Clone, Default)]
pub struct MockBus {
    state: Arc<Mutex<BusState>>,
}

impl MockBus {
    /// Empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a device.
    pub fn attach(&self, device: MockCcs) {
        self.state.lock().devices.push(device);
    }

    /// Attach a device, builder style.
    pub fn with_device(self, device: MockCcs) -> Self {
        self.attach(device);
        self
    }

    /// Descriptors of every attached device.
    pub fn descriptors(&self) -> Vec<UsbDeviceDescriptor> {
        self.state.lock().devices.iter().map(|d| d.descriptor.clone()).collect()
    }
}

impl UsbBus for MockBus {
    type Transport = MockCcs;

    fn devices(&self, vendor_id: u16) -> Result<Vec<UsbDeviceDescriptor>> {
        Ok(self
            .state
            .lock()
            .devices
            .iter()
            .filter(|d| d.descriptor.vendor_id == vendor_id)
            .map(|d| d.descriptor.clone())
            .collect())
    }

    fn open(&self, device: &UsbDeviceDescriptor) -> Result<MockCcs> {
        let state = self.state.lock();
        let template = state
            .devices
            .iter()
            .find(|d| d.descriptor == *device)
            .ok_or_else(|| CcsError::DeviceNotFound {
                criteria: device.to_string(),
            })?;
        let mut handle = template.clone();
        handle.bus = Some(Arc::clone(&self.state));
        Ok(handle)
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn memory_slice(memory: &[u8], address: u16, length: usize, fill: u8) -> Vec<u8> {
    let start = address as usize;
    let mut out: Vec<u8> = memory.iter().skip(start).take(length).copied().collect();
    out.resize(length, fill);
    out
}

fn f64_bytes(values: &[f64]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn f32_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_queue_then_idle() {
        let mut dev = MockCcs::new();
        dev.push_status(DeviceStatus::SCAN_TRIGGERED.bits());
        let first = dev.control_in(RCMD_GET_STATUS, 0, 0, 2).unwrap();
        let second = dev.control_in(RCMD_GET_STATUS, 0, 0, 2).unwrap();
        assert_eq!(first, vec![0x04, 0x00]);
        assert_eq!(second, vec![0x12, 0x00]);
    }

    #[test]
    fn test_failing_control_out() {
        let mut dev = MockCcs::new().fail_control_out_at(1);
        assert!(dev.control_out(WCMD_MODUS, 0, 0, &[]).is_ok());
        assert!(dev.control_out(WCMD_MODUS, 0, 0, &[]).is_err());
        assert!(dev.control_out(WCMD_MODUS, 0, 0, &[]).is_ok());
    }

    #[test]
    fn test_bus_renumerates_on_cpu_release() {
        let bus = MockBus::new().with_device(MockCcs::new().with_product_id(0x8088));
        let desc = bus.devices(THORLABS_VID).unwrap().remove(0);
        let mut handle = bus.open(&desc).unwrap();
        handle.control_out(RCMD_READ_RAM, CPUCS_ADDRESS, 0, &[0x01]).unwrap();
        assert_eq!(bus.descriptors()[0].product_id, 0x8088);
        handle.control_out(RCMD_READ_RAM, CPUCS_ADDRESS, 0, &[0x00]).unwrap();
        assert_eq!(bus.descriptors()[0].product_id, 0x8089);
    }

    #[test]
    fn test_open_unknown_device() {
        let bus = MockBus::new();
        let desc = MockCcs::new().descriptor().clone();
        assert!(bus.open(&desc).unwrap_err().is_not_found());
    }
}
