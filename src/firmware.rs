//! Firmware images and upload.
//!
//! An unconfigured CCS enumerates under an even product id and only runs the
//! FX2 boot loader. Firmware is shipped as `.spt` files: a sequence of
//! recorded control transfers, each wrapped in a block that starts with the
//! magic `CSPT`.
//!
//! ```text
//! offset  size  field
//!      0     4  magic "CSPT"
//!      4     4  block length, LE u32 (header included)
//!     16     1  bRequest
//!     18     2  wValue, LE
//!     20     2  wIndex, LE
//!     28     2  payload length, LE
//!     32     n  payload
//! ```
//!
//! Bytes between blocks that do not start with the magic are skipped. The
//! last recorded transfer releases the CPU, after which the device drops off
//! the bus and comes back under the odd product id.

use std::fmt;
use std::path::Path;

use tracing::{debug, error, info, instrument, warn};

use crate::error::{CcsError, Result};
use crate::transport::UsbTransport;

/// Magic at the start of every block.
pub const FIRMWARE_MAGIC: &[u8; 4] = b"CSPT";

/// Size of the fixed block header.
pub const BLOCK_HEADER_SIZE: usize = 32;

const OFFSET_LENGTH: usize = 4;
const OFFSET_REQUEST: usize = 16;
const OFFSET_VALUE: usize = 18;
const OFFSET_INDEX: usize = 20;
const OFFSET_PAYLOAD_LENGTH: usize = 28;

/// One recorded control-out transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareBlock {
    /// bRequest
    pub request: u8,
    /// wValue
    pub value: u16,
    /// wIndex
    pub index: u16,
    /// Data stage
    pub payload: Vec<u8>,
}

/// Parsed `.spt` file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FirmwareImage {
    blocks: Vec<FirmwareBlock>,
}

fn le_u16(bytes: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([bytes[at], bytes[at + 1]])
}

impl FirmwareImage {
    /// Image from already decoded blocks.
    pub fn from_blocks(blocks: Vec<FirmwareBlock>) -> Self {
        Self { blocks }
    }

    /// Parse an image.
    ///
    /// A block running past the end of the data ends parsing with a warning;
    /// the blocks before it are kept.
    ///
    /// # Errors
    ///
    /// [`CcsError::FirmwareFormat`] for a block shorter than its header or a
    /// payload that does not fit its block.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut blocks = Vec::new();
        let mut offset = 0usize;

        while offset < data.len() {
            if !data[offset..].starts_with(FIRMWARE_MAGIC) {
                offset += 1;
                continue;
            }

            let Some(len_bytes) = data.get(offset + OFFSET_LENGTH..offset + OFFSET_LENGTH + 4) else {
                warn!(offset, "Firmware block header truncated at end of file");
                break;
            };
            let block_len = u32::from_le_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]]) as usize;

            if offset.saturating_add(block_len) > data.len() {
                warn!(offset, block_len, "Firmware block exceeds file length");
                break;
            }
            if block_len < BLOCK_HEADER_SIZE {
                return Err(CcsError::FirmwareFormat {
                    message: format!("block at {} is {} bytes, header alone is {}", offset, block_len, BLOCK_HEADER_SIZE),
                });
            }

            let block = &data[offset..offset + block_len];
            let payload_len = le_u16(block, OFFSET_PAYLOAD_LENGTH) as usize;
            if BLOCK_HEADER_SIZE + payload_len > block_len {
                return Err(CcsError::FirmwareFormat {
                    message: format!(
                        "block at {} declares {} payload bytes but holds {}",
                        offset,
                        payload_len,
                        block_len - BLOCK_HEADER_SIZE
                    ),
                });
            }

            blocks.push(FirmwareBlock {
                request: block[OFFSET_REQUEST],
                value: le_u16(block, OFFSET_VALUE),
                index: le_u16(block, OFFSET_INDEX),
                payload: block[BLOCK_HEADER_SIZE..BLOCK_HEADER_SIZE + payload_len].to_vec(),
            });
            offset += block_len;
        }

        debug!(blocks = blocks.len(), "firmware image parsed");
        Ok(Self { blocks })
    }

    /// Read and parse a file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path).map_err(|source| CcsError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&data)
    }

    /// Blocks in file order.
    pub fn blocks(&self) -> &[FirmwareBlock] {
        &self.blocks
    }

    /// Number of blocks.
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Whether the image holds no blocks.
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Serialize back into the `.spt` layout.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for block in &self.blocks {
            let block_len = BLOCK_HEADER_SIZE + block.payload.len();
            let mut header = [0u8; BLOCK_HEADER_SIZE];
            header[..4].copy_from_slice(FIRMWARE_MAGIC);
            header[OFFSET_LENGTH..OFFSET_LENGTH + 4].copy_from_slice(&(block_len as u32).to_le_bytes());
            header[OFFSET_REQUEST] = block.request;
            header[OFFSET_VALUE..OFFSET_VALUE + 2].copy_from_slice(&block.value.to_le_bytes());
            header[OFFSET_INDEX..OFFSET_INDEX + 2].copy_from_slice(&block.index.to_le_bytes());
            header[OFFSET_PAYLOAD_LENGTH..OFFSET_PAYLOAD_LENGTH + 2]
                .copy_from_slice(&(block.payload.len() as u16).to_le_bytes());
            out.extend_from_slice(&header);
            out.extend_from_slice(&block.payload);
        }
        out
    }
}

// =============================================================================
// Upload
// =============================================================================

/// Block that failed to transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadFailure {
    /// 1-based block number
    pub block: usize,
    /// Transport error text
    pub message: String,
}

/// Outcome of a firmware upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReport {
    /// Blocks acknowledged by the device
    pub blocks_sent: usize,
    /// Blocks in the image
    pub total: usize,
    /// First failing block, if any
    pub failed: Option<UploadFailure>,
}

impl UploadReport {
    /// Whether every block went through.
    pub fn is_complete(&self) -> bool {
        self.failed.is_none() && self.blocks_sent == self.total
    }

    /// Turn a partial upload into [`CcsError::FirmwareUploadIncomplete`].
    pub fn into_result(self) -> Result<()> {
        match self.failed {
            None => Ok(()),
            Some(failure) => Err(CcsError::FirmwareUploadIncomplete {
                block: failure.block,
                total: self.total,
                sent: self.blocks_sent,
                message: failure.message,
            }),
        }
    }
}

impl fmt::Display for UploadReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.failed {
            None => write!(f, "{}/{} blocks sent", self.blocks_sent, self.total),
            Some(failure) => write!(
                f,
                "{}/{} blocks sent, block {} failed: {}",
                self.blocks_sent, self.total, failure.block, failure.message
            ),
        }
    }
}

/// Send every block as a vendor control-out transfer, stopping at the first
/// failure.
///
/// A failure is logged with its block number and reported, not returned as
/// an error; the device is then in an unknown state.
#[instrument(skip_all, fields(blocks = image.len()))]
pub fn upload<T: UsbTransport + ?Sized>(transport: &mut T, image: &FirmwareImage) -> UploadReport {
    let total = image.len();
    for (i, block) in image.blocks().iter().enumerate() {
        if let Err(e) = transport.control_out(block.request, block.value, block.index, &block.payload) {
            let number = i + 1;
            error!(block = number, total, error = %e, "Error sending firmware block {}", number);
            return UploadReport {
                blocks_sent: i,
                total,
                failed: Some(UploadFailure {
                    block: number,
                    message: e.to_string(),
                }),
            };
        }
    }
    info!(total, "Firmware uploaded");
    UploadReport {
        blocks_sent: total,
        total,
        failed: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockCcs;
    use crate::protocol::{CPUCS_ADDRESS, RCMD_READ_RAM};
    use tracing_test::traced_test;

    fn two_block_image() -> FirmwareImage {
        FirmwareImage::from_blocks(vec![
            FirmwareBlock {
                request: RCMD_READ_RAM,
                value: 0x0000,
                index: 0,
                payload: vec![0x02, 0x00, 0x06],
            },
            FirmwareBlock {
                request: RCMD_READ_RAM,
                value: CPUCS_ADDRESS,
                index: 0,
                payload: vec![0x00],
            },
        ])
    }

    #[test]
    fn test_parse_serialized_image() {
        let image = two_block_image();
        let mut bytes = vec![0xAA, 0xBB, 0xCC];
        bytes.extend(image.to_bytes());
        let parsed = FirmwareImage::parse(&bytes).unwrap();
        assert_eq!(parsed, image);
        assert_eq!(parsed.blocks()[1].value, 0xE600);
    }

    #[test]
    fn test_block_past_end_keeps_earlier_blocks() {
        let mut bytes = two_block_image().to_bytes();
        let truncated_len = bytes.len() - 1;
        bytes.truncate(truncated_len);
        let parsed = FirmwareImage::parse(&bytes).unwrap();
        assert_eq!(parsed.len(), 1);
    }

    #[test]
    fn test_malformed_blocks() {
        let mut short = Vec::from(&FIRMWARE_MAGIC[..]);
        short.extend_from_slice(&8u32.to_le_bytes());
        short.extend_from_slice(&[0; 8]);
        assert!(matches!(
            FirmwareImage::parse(&short),
            Err(CcsError::FirmwareFormat { .. })
        ));

        let mut bytes = two_block_image().to_bytes();
        bytes[OFFSET_PAYLOAD_LENGTH] = 0x40;
        assert!(matches!(
            FirmwareImage::parse(&bytes),
            Err(CcsError::FirmwareFormat { .. })
        ));
    }

    #[test]
    fn test_no_magic_is_empty() {
        assert!(FirmwareImage::parse(b"not a firmware file").unwrap().is_empty());
    }

    #[test]
    fn test_load_missing_file() {
        let err = FirmwareImage::load("/nonexistent/CCS200.spt").unwrap_err();
        assert!(matches!(err, CcsError::Io { .. }));
    }

    #[test]
    fn test_upload_complete() {
        let mut dev = MockCcs::new();
        let report = upload(&mut dev, &two_block_image());
        assert!(report.is_complete());
        assert_eq!(report.blocks_sent, 2);
        assert_eq!(dev.control_out_log().len(), 2);
        assert_eq!(dev.control_out_log()[0].data, vec![0x02, 0x00, 0x06]);
        assert!(report.into_result().is_ok());
    }

    #[traced_test]
    #[test]
    fn test_upload_stops_at_failing_block() {
        let mut dev = MockCcs::new().fail_control_out_at(1);
        let report = upload(&mut dev, &two_block_image());
        assert!(!report.is_complete());
        assert_eq!(report.blocks_sent, 1);
        assert_eq!(report.failed.as_ref().unwrap().block, 2);
        assert!(logs_contain("Error sending firmware block 2"));

        match report.into_result() {
            Err(CcsError::FirmwareUploadIncomplete { block, total, sent, .. }) => {
                assert_eq!((block, total, sent), (2, 2, 1));
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
