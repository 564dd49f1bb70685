//! Integration time register codec.
//!
//! The sensor clock runs at 1 MHz behind a power-of-two prescaler. Exposure is
//! programmed as three 12-bit registers, each carried in a big-endian 16-bit
//! field whose upper nibble tags the register:
//!
//! ```text
//!  byte  0     1      2     3      4     5
//!       [0x0p][pp]  [0x1f][ff]  [0x2i][ii]
//!        prescaler   fill        integration
//! ```
//!
//! The shift-register gate stays open for `SH_PERCENT` of the integration
//! period, and one integration period can never be shorter than the readout of
//! a full raw line, which is what the `fill` register pads.
//!
//! Decoding gives back the requested exposure to within one clock tick of the
//! final prescaler, i.e. `2^prescaler` µs.

use crate::error::{CcsError, Result};
use crate::protocol::NUM_RAW_PIXELS;

/// Shortest exposure in seconds.
pub const MIN_INTEGRATION_TIME: f64 = 1e-5;
/// Longest exposure in seconds.
pub const MAX_INTEGRATION_TIME: f64 = 60.0;
/// Exposure programmed at initialization, in seconds.
pub const DEFAULT_INTEGRATION_TIME: f64 = 0.01;

/// Shift-gate duty in percent of the integration period.
pub const SH_PERCENT: f64 = 16.5;

/// Size of the packed register block.
pub const INTEGRATION_CONTROL_BYTES: usize = 6;

const MAX_PRESCALER: u16 = 20;
const REGISTER_MASK: i16 = 0x0FFF;
const TAG_PRESCALER: u8 = 0x00;
const TAG_FILL: u8 = 0x10;
const TAG_INTEGRATION: u8 = 0x20;

/// Decoded register triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntegrationRegisters {
    /// Clock divider exponent
    pub prescaler: u16,
    /// Padding ticks
    pub fill: u16,
    /// Integration ticks
    pub integration: u16,
}

impl IntegrationRegisters {
    /// Compute the registers for an exposure of `seconds`.
    ///
    /// # Errors
    ///
    /// [`CcsError::InvalidIntegrationTime`] outside
    /// `[MIN_INTEGRATION_TIME, MAX_INTEGRATION_TIME]`.
    pub fn from_seconds(seconds: f64) -> Result<Self> {
        if !(MIN_INTEGRATION_TIME..=MAX_INTEGRATION_TIME).contains(&seconds) {
            return Err(CcsError::InvalidIntegrationTime {
                seconds,
                min: MIN_INTEGRATION_TIME,
                max: MAX_INTEGRATION_TIME,
            });
        }

        let raw_pixels = NUM_RAW_PIXELS as i64;
        let mut ticks = (seconds * 1_000_000.0) as i64;
        let max_ticks = 4095.0 / (1.0 + 0.01 * SH_PERCENT);
        let mut prescaler: u16 = 0;

        while ticks as f64 > max_ticks && prescaler < MAX_PRESCALER {
            ticks >>= 1;
            prescaler += 1;
        }

        let line = raw_pixels >> prescaler;
        let diff = if ticks < line { line - ticks } else { 0 };

        let mut fill = ((ticks as f64 * SH_PERCENT) / 100.0 + diff as f64) as i64;
        let mut integration = ticks - 8 + fill;
        if integration > raw_pixels {
            integration >>= 1;
            integration -= 4;
            fill >>= 1;
            prescaler += 1;
        }

        Ok(Self {
            prescaler,
            fill: fill as u16,
            integration: integration as u16,
        })
    }

    /// Exposure in seconds represented by these registers.
    pub fn seconds(&self) -> f64 {
        let ticks = f64::from(self.integration) - f64::from(self.fill) + 8.0;
        ticks * 2f64.powi(i32::from(self.prescaler)) / 1_000_000.0
    }

    /// Duration of one clock tick at this prescaler, in seconds.
    pub fn tick(&self) -> f64 {
        2f64.powi(i32::from(self.prescaler)) / 1_000_000.0
    }

    /// Pack into the tagged wire format.
    pub fn to_bytes(&self) -> [u8; INTEGRATION_CONTROL_BYTES] {
        let [p0, p1] = self.prescaler.to_be_bytes();
        let [f0, f1] = self.fill.to_be_bytes();
        let [i0, i1] = self.integration.to_be_bytes();
        [
            p0 | TAG_PRESCALER,
            p1,
            f0 | TAG_FILL,
            f1,
            i0 | TAG_INTEGRATION,
            i1,
        ]
    }

    /// Unpack the wire format, dropping the tag nibbles.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < INTEGRATION_CONTROL_BYTES {
            return Err(CcsError::invalid_parameter(format!(
                "integration time block has {} bytes, expected {}",
                bytes.len(),
                INTEGRATION_CONTROL_BYTES
            )));
        }
        let field = |i: usize| (i16::from_be_bytes([bytes[i], bytes[i + 1]]) & REGISTER_MASK) as u16;
        Ok(Self {
            prescaler: field(0),
            fill: field(2),
            integration: field(4),
        })
    }
}

/// Encode an exposure in seconds into the 6-byte register block.
pub fn encode_integration_time(seconds: f64) -> Result<[u8; INTEGRATION_CONTROL_BYTES]> {
    Ok(IntegrationRegisters::from_seconds(seconds)?.to_bytes())
}

/// Decode the 6-byte register block into seconds.
pub fn decode_integration_time(bytes: &[u8]) -> Result<f64> {
    Ok(IntegrationRegisters::from_bytes(bytes)?.seconds())
}
