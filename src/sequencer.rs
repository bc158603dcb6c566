//! Reference command sequencer for block devices.
//!
//! Decodes the READ/WRITE family, SYNCHRONIZE CACHE, VERIFY and TEST UNIT
//! READY into data or control commands. INQUIRY and READ CAPACITY are
//! answered by emulation executors instead of the device backend.

use std::sync::Arc;

use crate::emulation::{InquiryEmulation, ReadCapacityEmulation};
use crate::interfaces::{Classification, CommandSequencer, DeviceGeometry};
use crate::model::{DataDirection, SenseReason};
use crate::scsi::ScsiOp;

/// Standard INQUIRY data length.
pub const INQUIRY_DATA_LEN: usize = 36;

/// READ CAPACITY (10) parameter data length.
pub const READ_CAPACITY_DATA_LEN: usize = 8;

/// Table-driven sequencer for the common block command set.
pub struct BasicSequencer {
    inquiry: Arc<InquiryEmulation>,
    read_capacity: Arc<ReadCapacityEmulation>,
}

impl Default for BasicSequencer {
    fn default() -> Self {
        Self::new()
    }
}

impl BasicSequencer {
    pub fn new() -> Self {
        Self {
            inquiry: Arc::new(InquiryEmulation::default()),
            read_capacity: Arc::new(ReadCapacityEmulation),
        }
    }

    /// Use custom identification strings for INQUIRY.
    pub fn with_inquiry(inquiry: InquiryEmulation) -> Self {
        Self {
            inquiry: Arc::new(inquiry),
            ..Self::new()
        }
    }
}

fn need(cdb: &[u8], len: usize) -> Result<(), SenseReason> {
    if cdb.len() < len {
        Err(SenseReason::InvalidCdbField)
    } else {
        Ok(())
    }
}

fn be16(b: &[u8]) -> u64 {
    u64::from(u16::from_be_bytes([b[0], b[1]]))
}

fn be32(b: &[u8]) -> u64 {
    u64::from(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
}

fn be64(b: &[u8]) -> u64 {
    u64::from_be_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
}

/// `(lba, blocks)` for the READ/WRITE family.
fn rw_extent(op: ScsiOp, cdb: &[u8]) -> Result<(u64, u64), SenseReason> {
    match op {
        ScsiOp::READ_6 | ScsiOp::WRITE_6 => {
            need(cdb, 6)?;
            let lba = (u64::from(cdb[1] & 0x1f) << 16) | be16(&cdb[2..4]);
            let blocks = match cdb[4] {
                0 => 256,
                n => u64::from(n),
            };
            Ok((lba, blocks))
        }
        ScsiOp::READ_10 | ScsiOp::WRITE_10 | ScsiOp::VERIFY_10 | ScsiOp::SYNCHRONIZE_CACHE => {
            need(cdb, 10)?;
            Ok((be32(&cdb[2..6]), be16(&cdb[7..9])))
        }
        ScsiOp::READ_12 | ScsiOp::WRITE_12 => {
            need(cdb, 12)?;
            Ok((be32(&cdb[2..6]), be32(&cdb[6..10])))
        }
        ScsiOp::READ_16 | ScsiOp::WRITE_16 | ScsiOp::VERIFY_16 | ScsiOp::SYNCHRONIZE_CACHE_16 => {
            need(cdb, 16)?;
            Ok((be64(&cdb[2..10]), be32(&cdb[10..14])))
        }
        _ => Err(SenseReason::UnsupportedOpcode),
    }
}

fn check_range(lba: u64, blocks: u64, capacity: u64) -> Result<(), SenseReason> {
    match lba.checked_add(blocks) {
        Some(end) if end <= capacity && (blocks > 0 || lba <= capacity) => Ok(()),
        _ => Err(SenseReason::LbaOutOfRange),
    }
}

impl CommandSequencer for BasicSequencer {
    fn classify(
        &self,
        cdb: &[u8],
        geometry: &DeviceGeometry,
    ) -> Result<Classification, SenseReason> {
        let op = ScsiOp(*cdb.first().ok_or(SenseReason::InvalidCdbField)?);
        let capacity = geometry.capacity_sectors;

        match op {
            ScsiOp::TEST_UNIT_READY => Ok(Classification::control(0, DataDirection::None)),

            ScsiOp::INQUIRY => {
                need(cdb, 6)?;
                if cdb[1] & 0x01 != 0 {
                    // Vital product data pages are not provided.
                    return Err(SenseReason::InvalidCdbField);
                }
                let allocation = be16(&cdb[3..5]) as usize;
                Ok(
                    Classification::control(allocation.min(INQUIRY_DATA_LEN), DataDirection::Read)
                        .emulated_by(self.inquiry.clone()),
                )
            }

            ScsiOp::READ_CAPACITY => {
                need(cdb, 10)?;
                Ok(
                    Classification::control(READ_CAPACITY_DATA_LEN, DataDirection::Read)
                        .emulated_by(self.read_capacity.clone()),
                )
            }

            ScsiOp::READ_6 | ScsiOp::READ_10 | ScsiOp::READ_12 | ScsiOp::READ_16 => {
                let (lba, blocks) = rw_extent(op, cdb)?;
                check_range(lba, blocks, capacity)?;
                Ok(Classification::data(lba, blocks, geometry.block_size, DataDirection::Read))
            }

            ScsiOp::WRITE_6 | ScsiOp::WRITE_10 | ScsiOp::WRITE_12 | ScsiOp::WRITE_16 => {
                let (lba, blocks) = rw_extent(op, cdb)?;
                check_range(lba, blocks, capacity)?;
                Ok(Classification::data(lba, blocks, geometry.block_size, DataDirection::Write))
            }

            ScsiOp::SYNCHRONIZE_CACHE | ScsiOp::SYNCHRONIZE_CACHE_16 => {
                let (lba, blocks) = rw_extent(op, cdb)?;
                // Zero blocks means everything from `lba` to the end.
                let blocks = match blocks {
                    0 => capacity.saturating_sub(lba),
                    n => n,
                };
                check_range(lba, blocks, capacity)?;
                Ok(Classification::ranged(lba, blocks))
            }

            ScsiOp::VERIFY_10 | ScsiOp::VERIFY_16 => {
                if cdb.get(1).is_some_and(|b| b & 0x06 != 0) {
                    // Byte-by-byte compare needs a data-out buffer.
                    return Err(SenseReason::InvalidCdbField);
                }
                let (lba, blocks) = rw_extent(op, cdb)?;
                check_range(lba, blocks, capacity)?;
                Ok(Classification::ranged(lba, blocks))
            }

            _ => Err(SenseReason::UnsupportedOpcode),
        }
    }
}
