//! EEPROM and RAM access.
//!
//! The EEPROM holds identity and calibration data. Reads go through endpoint 0
//! in chunks of at most [`ENDPOINT_0_TRANSFER_SIZE`] bytes. Every region from
//! the software version field on is followed by a little-endian CRC-16
//! (CRC-16/MODBUS: reflected polynomial 0xA001, init 0xFFFF).
//!
//! A stored checksum of `0xFFFF` marks a field that was never written. Such a
//! region is returned as [`BlockState::Unwritten`] instead of failing, since
//! fresh devices routinely carry unwritten optional fields.
//!
//! # Memory map
//!
//! ```text
//! 0x0000  boot code, vendor/product/device id
//! 0x0008  serial number (24)                 no checksum
//! 0x0020  software version (4)               + CRC
//! 0x0026  user label (32)                    + CRC
//! 0x0048  factory coefficient flag / data    + CRC each
//! 0x006E  user coefficient flag / data       + CRC each
//! 0x0094  user point count / points          + CRC each
//! 0x0112  even / odd offset max              + CRC each
//! 0x011A  factory amplitude correction       + CRC
//! 0x3A1C  user amplitude correction          + CRC
//! 0x731E  flags, checksums                   + CRC each
//! ```

use crc::{Crc, CRC_16_MODBUS};
use tracing::{debug, trace, warn};

use crate::error::{CcsError, Result};
use crate::protocol::{CPUCS_ADDRESS, ENDPOINT_0_TRANSFER_SIZE, RCMD_READ_EEPROM, RCMD_READ_RAM};
use crate::transport::UsbTransport;

const EEPROM_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// Size of the trailing checksum of a region.
pub const CHECKSUM_SIZE: u16 = 2;

/// Stored checksum value of a never-written region.
pub const UNWRITTEN_CHECKSUM: u16 = 0xFFFF;

/// Readable EEPROM size used for full dumps.
pub const EEPROM_DUMP_SIZE: usize = 0x7FFF;

/// Main RAM (program and data).
pub const RAM_PROGRAM_START: u16 = 0x0000;
/// Size of main RAM.
pub const RAM_PROGRAM_SIZE: usize = 0x4000;
/// Scratch RAM (data only).
pub const RAM_DATA_START: u16 = 0xE000;
/// Size of scratch RAM.
pub const RAM_DATA_SIZE: usize = 0x0200;

/// CRC-16 used for EEPROM regions.
pub fn crc16(data: &[u8]) -> u16 {
    EEPROM_CRC.checksum(data)
}

// =============================================================================
// Layout
// =============================================================================

/// A contiguous EEPROM field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    /// First byte
    pub address: u16,
    /// Payload length, excluding any checksum
    pub length: u16,
}

impl Region {
    /// Region at a fixed address.
    pub const fn new(address: u16, length: u16) -> Self {
        Self { address, length }
    }

    /// Region placed right after `self` and its checksum.
    pub const fn followed_by(self, length: u16) -> Self {
        Self {
            address: self.address + self.length + CHECKSUM_SIZE,
            length,
        }
    }

    /// Whether reads of this region verify a trailing checksum.
    pub const fn is_checksummed(self) -> bool {
        self.address >= layout::CHECKSUM_BOUNDARY
    }
}

/// Fixed EEPROM map of the CCS family.
pub mod layout {
    use super::Region;
    use crate::protocol::NUM_PIXELS;

    /// Number of polynomial coefficients.
    pub const NUM_POLY_COEFFICIENTS: usize = 4;
    /// Maximum number of user calibration points.
    pub const MAX_USER_POINTS: usize = 10;

    /// Boot code byte.
    pub const BOOT_CODE: Region = Region::new(0, 1);
    /// Vendor id programmed for the boot loader.
    pub const VENDOR_ID: Region = Region::new(1, 2);
    /// Product id programmed for the boot loader.
    pub const PRODUCT_ID: Region = Region::new(3, 2);
    /// Device id.
    pub const DEVICE_ID: Region = Region::new(5, 2);
    /// Serial number, NUL padded.
    pub const SERIAL_NUMBER: Region = Region::new(8, 24);
    /// Software version written by the calibration software.
    pub const SOFTWARE_VERSION: Region = Region::new(SERIAL_NUMBER.address + SERIAL_NUMBER.length, 4);
    /// Free-form user label, NUL padded.
    pub const USER_LABEL: Region = SOFTWARE_VERSION.followed_by(32);
    /// Factory calibration coefficient flag.
    pub const FACTORY_COEF_FLAG: Region = USER_LABEL.followed_by(2);
    /// Factory calibration coefficients, 4 x f64.
    pub const FACTORY_COEF_DATA: Region = FACTORY_COEF_FLAG.followed_by(8 * NUM_POLY_COEFFICIENTS as u16);
    /// User calibration coefficient flag.
    pub const USER_COEF_FLAG: Region = FACTORY_COEF_DATA.followed_by(2);
    /// User calibration coefficients, 4 x f64.
    pub const USER_COEF_DATA: Region = USER_COEF_FLAG.followed_by(8 * NUM_POLY_COEFFICIENTS as u16);
    /// Number of user calibration points.
    pub const USER_POINTS_COUNT: Region = USER_COEF_DATA.followed_by(2);
    /// User calibration points: 10 x u32 pixel, then 10 x f64 wavelength.
    pub const USER_POINTS_DATA: Region = USER_POINTS_COUNT.followed_by((4 + 8) * MAX_USER_POINTS as u16);
    /// Maximum dark offset of even pixels.
    pub const EVEN_OFFSET_MAX: Region = USER_POINTS_DATA.followed_by(2);
    /// Maximum dark offset of odd pixels.
    pub const ODD_OFFSET_MAX: Region = EVEN_OFFSET_MAX.followed_by(2);
    /// Factory amplitude correction, one f32 per pixel.
    pub const ACOR_FACTORY: Region = ODD_OFFSET_MAX.followed_by(4 * NUM_PIXELS as u16);
    /// User amplitude correction, one f32 per pixel.
    pub const ACOR_USER: Region = ACOR_FACTORY.followed_by(4 * NUM_PIXELS as u16);
    /// Flag word.
    pub const FLAGS: Region = ACOR_USER.followed_by(4);
    /// Checksums of the amplitude correction arrays.
    pub const CHECKSUMS: Region = FLAGS.followed_by(4);
    /// First unused byte.
    pub const FREE: u16 = CHECKSUMS.address + CHECKSUMS.length + super::CHECKSUM_SIZE;

    /// Regions at or above this address carry a checksum.
    pub const CHECKSUM_BOUNDARY: u16 = SOFTWARE_VERSION.address;
}

// =============================================================================
// Blocks
// =============================================================================

/// Integrity of a block read from EEPROM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    /// Checksum matched
    Verified,
    /// Stored checksum is the never-written marker
    Unwritten,
    /// Region has no checksum
    Unchecked,
}

/// Bytes read from one EEPROM region.
#[derive(Debug, Clone, PartialEq)]
pub struct EepromBlock {
    /// Start address
    pub address: u16,
    /// Payload without checksum
    pub data: Vec<u8>,
    /// Integrity of the payload
    pub state: BlockState,
}

impl EepromBlock {
    /// Whether the region was never written.
    pub fn is_unwritten(&self) -> bool {
        self.state == BlockState::Unwritten
    }

    fn bytes<const N: usize>(&self, offset: usize) -> Result<[u8; N]> {
        self.data
            .get(offset..offset + N)
            .and_then(|s| s.try_into().ok())
            .ok_or_else(|| {
                CcsError::invalid_parameter(format!(
                    "offset {} + {} beyond {}-byte block at 0x{:04X}",
                    offset,
                    N,
                    self.data.len(),
                    self.address
                ))
            })
    }

    /// Little-endian u16 at `offset`.
    pub fn u16_at(&self, offset: usize) -> Result<u16> {
        Ok(u16::from_le_bytes(self.bytes(offset)?))
    }

    /// Little-endian u32 at `offset`.
    pub fn u32_at(&self, offset: usize) -> Result<u32> {
        Ok(u32::from_le_bytes(self.bytes(offset)?))
    }

    /// Little-endian f64 at `offset`.
    pub fn f64_at(&self, offset: usize) -> Result<f64> {
        Ok(f64::from_le_bytes(self.bytes(offset)?))
    }

    /// Whole payload as little-endian f32 values.
    pub fn f32_values(&self) -> Vec<f32> {
        self.data
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    /// Payload as a NUL-terminated ASCII string.
    pub fn ascii(&self) -> String {
        let end = self.data.iter().position(|&b| b == 0 || b == 0xFF).unwrap_or(self.data.len());
        String::from_utf8_lossy(&self.data[..end]).trim().to_string()
    }
}

// =============================================================================
// Reads
// =============================================================================

fn read_chunked<T: UsbTransport + ?Sized>(
    transport: &mut T,
    request: u8,
    address: u16,
    index: u16,
    length: usize,
) -> Result<Vec<u8>> {
    let mut data = Vec::with_capacity(length);
    let mut chunk_address = address;

    while data.len() < length {
        let chunk_length = (length - data.len()).min(ENDPOINT_0_TRANSFER_SIZE);
        let chunk = transport.control_in(request, chunk_address, index, chunk_length)?;
        if chunk.is_empty() {
            return Err(CcsError::transport(
                "control_in",
                format!("empty response at 0x{:04X}", chunk_address),
            ));
        }
        let take = chunk.len().min(chunk_length);
        data.extend_from_slice(&chunk[..take]);
        chunk_address = chunk_address.wrapping_add(take as u16);
    }

    trace!(request, address, length, "memory read complete");
    Ok(data)
}

/// Read `length` EEPROM bytes without any checksum verification.
pub fn read_eeprom_raw<T: UsbTransport + ?Sized>(
    transport: &mut T,
    address: u16,
    index: u16,
    length: usize,
) -> Result<Vec<u8>> {
    read_chunked(transport, RCMD_READ_EEPROM, address, index, length)
}

/// Read `length` EEPROM bytes and verify the trailing checksum when the
/// address is in the checksummed part of the map.
pub fn read_eeprom<T: UsbTransport + ?Sized>(
    transport: &mut T,
    address: u16,
    index: u16,
    length: usize,
) -> Result<EepromBlock> {
    let data = read_eeprom_raw(transport, address, index, length)?;

    if address < layout::CHECKSUM_BOUNDARY {
        return Ok(EepromBlock {
            address,
            data,
            state: BlockState::Unchecked,
        });
    }

    let crc_address = address.wrapping_add(length as u16);
    let crc_bytes = read_eeprom_raw(transport, crc_address, index, CHECKSUM_SIZE as usize)?;
    let stored = u16::from_le_bytes([crc_bytes[0], crc_bytes[1]]);
    let computed = crc16(&data);

    let state = if stored == computed {
        BlockState::Verified
    } else if stored == UNWRITTEN_CHECKSUM {
        debug!(address, "EEPROM region never written");
        BlockState::Unwritten
    } else {
        return Err(CcsError::Checksum {
            address,
            stored,
            computed,
        });
    };

    Ok(EepromBlock {
        address,
        data,
        state,
    })
}

/// Checked read of a layout region.
pub fn read_region<T: UsbTransport + ?Sized>(transport: &mut T, region: Region) -> Result<EepromBlock> {
    read_eeprom(transport, region.address, 0, region.length as usize)
}

/// Read on-chip RAM. RAM has no checksums.
pub fn read_ram<T: UsbTransport + ?Sized>(
    transport: &mut T,
    address: u16,
    index: u16,
    length: usize,
) -> Result<Vec<u8>> {
    read_chunked(transport, RCMD_READ_RAM, address, index, length)
}

/// Raw copy of the whole EEPROM.
pub fn dump_eeprom<T: UsbTransport + ?Sized>(transport: &mut T) -> Result<Vec<u8>> {
    read_eeprom_raw(transport, 0x0000, 0x0000, EEPROM_DUMP_SIZE)
}

/// Halt the 8051 core.
pub fn hold_cpu<T: UsbTransport + ?Sized>(transport: &mut T) -> Result<()> {
    transport.control_out(RCMD_READ_RAM, CPUCS_ADDRESS, 0, &[0x01])?;
    Ok(())
}

/// Let the 8051 core run again.
pub fn release_cpu<T: UsbTransport + ?Sized>(transport: &mut T) -> Result<()> {
    transport.control_out(RCMD_READ_RAM, CPUCS_ADDRESS, 0, &[0x00])?;
    Ok(())
}

/// RAM contents captured with the CPU halted.
#[derive(Debug, Clone)]
pub struct RamDump {
    /// Main RAM
    pub program: Vec<u8>,
    /// Scratch RAM
    pub data: Vec<u8>,
}

/// Copy main and scratch RAM while the CPU is halted.
///
/// The CPU is released again even when a read fails.
pub fn dump_ram<T: UsbTransport + ?Sized>(transport: &mut T) -> Result<RamDump> {
    hold_cpu(transport)?;

    let result = read_ram(transport, RAM_PROGRAM_START, 0, RAM_PROGRAM_SIZE).and_then(|program| {
        read_ram(transport, RAM_DATA_START, 0, RAM_DATA_SIZE).map(|data| RamDump { program, data })
    });

    if let Err(e) = release_cpu(transport) {
        warn!(error = %e, "Failed to release CPU after RAM dump");
        if result.is_ok() {
            return Err(e);
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockCcs;

    #[test]
    fn test_crc16_check_value() {
        // CRC-16/MODBUS check value
        assert_eq!(crc16(b"123456789"), 0x4B37);
        assert_eq!(crc16(&[]), 0xFFFF);
    }

    #[test]
    fn test_layout_addresses() {
        assert_eq!(layout::SOFTWARE_VERSION.address, 32);
        assert_eq!(layout::USER_LABEL.address, 38);
        assert_eq!(layout::FACTORY_COEF_DATA.address, 76);
        assert_eq!(layout::USER_POINTS_COUNT.address, 148);
        assert_eq!(layout::USER_POINTS_DATA.address, 152);
        assert_eq!(layout::EVEN_OFFSET_MAX.address, 274);
        assert_eq!(layout::ODD_OFFSET_MAX.address, 278);
        assert_eq!(layout::ACOR_FACTORY.address, 282);
        assert_eq!(layout::ACOR_USER.address, 14876);
        assert_eq!(layout::FLAGS.address, 29470);
        assert_eq!(layout::FREE, 29482);
        assert!(!layout::SERIAL_NUMBER.is_checksummed());
        assert!(layout::SOFTWARE_VERSION.is_checksummed());
    }

    #[test]
    fn test_reads_are_chunked() {
        let mut dev = MockCcs::new();
        let data = read_eeprom_raw(&mut dev, 0x0100, 0, 150).unwrap();
        assert_eq!(data.len(), 150);
        let lengths: Vec<usize> = dev
            .control_in_log()
            .iter()
            .map(|r| r.length)
            .collect();
        assert_eq!(lengths, vec![64, 64, 22]);
        let addresses: Vec<u16> = dev.control_in_log().iter().map(|r| r.value).collect();
        assert_eq!(addresses, vec![0x0100, 0x0140, 0x0180]);
    }

    #[test]
    fn test_verified_block() {
        let mut dev = MockCcs::new();
        dev.write_eeprom_region(layout::EVEN_OFFSET_MAX, &1234u16.to_le_bytes());
        let block = read_region(&mut dev, layout::EVEN_OFFSET_MAX).unwrap();
        assert_eq!(block.state, BlockState::Verified);
        assert_eq!(block.u16_at(0).unwrap(), 1234);
    }

    #[test]
    fn test_unwritten_checksum_is_accepted() {
        let mut dev = MockCcs::new();
        dev.write_eeprom(layout::USER_LABEL.address, b"not checksummed");
        let block = read_region(&mut dev, layout::USER_LABEL).unwrap();
        assert_eq!(block.state, BlockState::Unwritten);
        assert!(block.is_unwritten());
    }

    #[test]
    fn test_checksum_mismatch_is_error() {
        let mut dev = MockCcs::new();
        dev.write_eeprom_region(layout::EVEN_OFFSET_MAX, &1234u16.to_le_bytes());
        dev.write_eeprom(layout::EVEN_OFFSET_MAX.address, &[0x00, 0x01]);
        let err = read_region(&mut dev, layout::EVEN_OFFSET_MAX).unwrap_err();
        assert!(err.is_checksum());
    }

    #[test]
    fn test_below_boundary_is_unchecked() {
        let mut dev = MockCcs::new();
        dev.write_eeprom(layout::SERIAL_NUMBER.address, b"M00123456\0");
        let block = read_region(&mut dev, layout::SERIAL_NUMBER).unwrap();
        assert_eq!(block.state, BlockState::Unchecked);
        assert_eq!(block.ascii(), "M00123456");
    }

    #[test]
    fn test_dump_ram_releases_cpu() {
        let mut dev = MockCcs::new();
        let dump = dump_ram(&mut dev).unwrap();
        assert_eq!(dump.program.len(), RAM_PROGRAM_SIZE);
        assert_eq!(dump.data.len(), RAM_DATA_SIZE);
        let cpucs: Vec<Vec<u8>> = dev
            .control_out_log()
            .iter()
            .filter(|r| r.request == RCMD_READ_RAM && r.value == CPUCS_ADDRESS)
            .map(|r| r.data.clone())
            .collect();
        assert_eq!(cpucs, vec![vec![0x01], vec![0x00]]);
    }
}
