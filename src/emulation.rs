//! Responses the engine produces itself.
//!
//! [`StandardResponses`] maps failure classes to status and sense data.
//! [`InquiryEmulation`] and [`ReadCapacityEmulation`] answer the control
//! commands that describe the device, standing in for the backend.

use crate::interfaces::{
    CommandOutcome, Execution, Response, ResponseBuilder, StartError, StorageBackend,
};
use crate::model::{FailureCause, SenseReason, TaskHandle, TaskOutcome};
use crate::scsi::{
    AdditionalSenseCode, SenseData, SenseKey, SCSI_SENSEQ_CAPACITY_DATA_CHANGED,
    SCSI_SENSEQ_SPACE_ALLOCATION_FAILED_WRITE_PROTECT,
};
use crate::sequencer::{INQUIRY_DATA_LEN, READ_CAPACITY_DATA_LEN};

/// Sense data reported for `reason`.
pub fn sense_for(reason: SenseReason) -> SenseData {
    use AdditionalSenseCode as Asc;

    match reason {
        SenseReason::LogicalUnitCommunicationFailure => {
            SenseData::new(SenseKey::HARDWARE_ERROR, Asc::LUN_COMMUNICATION, 0)
        }
        SenseReason::CapacityDataChanged => SenseData::new(
            SenseKey::UNIT_ATTENTION,
            Asc::PARAMETERS_CHANGED,
            SCSI_SENSEQ_CAPACITY_DATA_CHANGED,
        ),
        SenseReason::SpaceAllocationFailed => SenseData::new(
            SenseKey::DATA_PROTECT,
            Asc::WRITE_PROTECT,
            SCSI_SENSEQ_SPACE_ALLOCATION_FAILED_WRITE_PROTECT,
        ),
        SenseReason::LogicalUnitFailure => {
            SenseData::new(SenseKey::HARDWARE_ERROR, Asc::INTERNAL_TARGET_FAILURE, 0)
        }
        SenseReason::LogicalUnitNotSupported => {
            SenseData::new(SenseKey::ILLEGAL_REQUEST, Asc::INVALID_LUN, 0)
        }
        SenseReason::InvalidCdbField => {
            SenseData::new(SenseKey::ILLEGAL_REQUEST, Asc::INVALID_CDB, 0)
        }
        SenseReason::UnsupportedOpcode => {
            SenseData::new(SenseKey::ILLEGAL_REQUEST, Asc::ILLEGAL_COMMAND, 0)
        }
        SenseReason::LbaOutOfRange => {
            SenseData::new(SenseKey::ILLEGAL_REQUEST, Asc::ILLEGAL_BLOCK, 0)
        }
    }
}

/// Default failure classification and sense mapping.
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardResponses;

impl ResponseBuilder for StandardResponses {
    fn classify(&self, cause: &FailureCause) -> SenseReason {
        match cause {
            FailureCause::Transport(_) | FailureCause::Abandoned => {
                SenseReason::LogicalUnitCommunicationFailure
            }
            FailureCause::CapacityChanged => SenseReason::CapacityDataChanged,
            FailureCause::NoSpace => SenseReason::SpaceAllocationFailed,
            FailureCause::Io(_) | FailureCause::NotStarted(_) => SenseReason::LogicalUnitFailure,
        }
    }

    fn build_response(&self, outcome: &CommandOutcome) -> Response {
        match outcome {
            CommandOutcome::Good => Response::good(),
            CommandOutcome::Sense(sense) => Response::check_condition(*sense),
            CommandOutcome::CheckCondition(reason) => Response::check_condition(sense_for(*reason)),
            CommandOutcome::Aborted => Response::task_aborted(),
        }
    }
}

/// Fills `task`'s buffer with at most `data.len()` bytes and completes it.
fn answer(task: TaskHandle, data: &[u8]) -> Result<Execution, StartError> {
    let len = task.task().byte_len().min(data.len());
    task.task().buffer().copy_from(&data[..len]);
    Ok(Execution::Complete(task, TaskOutcome::good()))
}

/// Standard INQUIRY data for a direct-access block device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InquiryEmulation {
    pub vendor: String,
    pub product: String,
    pub revision: String,
}

impl Default for InquiryEmulation {
    fn default() -> Self {
        Self {
            vendor: "TGTENG".to_string(),
            product: "Virtual Disk".to_string(),
            revision: "0001".to_string(),
        }
    }
}

/// Space-padded, truncated ASCII field.
fn ascii_field(dst: &mut [u8], value: &str) {
    dst.fill(b' ');
    for (d, s) in dst.iter_mut().zip(value.bytes().filter(u8::is_ascii)) {
        *d = s;
    }
}

impl InquiryEmulation {
    pub fn data(&self) -> [u8; INQUIRY_DATA_LEN] {
        let mut data = [0u8; INQUIRY_DATA_LEN];
        // Peripheral qualifier 0, device type 0 (direct access).
        data[0] = 0x00;
        // SPC-4.
        data[2] = 0x06;
        // Response data format 2, HiSup.
        data[3] = 0x12;
        data[4] = (INQUIRY_DATA_LEN - 5) as u8;
        // CmdQue.
        data[7] = 0x02;
        ascii_field(&mut data[8..16], &self.vendor);
        ascii_field(&mut data[16..32], &self.product);
        ascii_field(&mut data[32..36], &self.revision);
        data
    }
}

impl StorageBackend for InquiryEmulation {
    fn name(&self) -> &str {
        "inquiry"
    }

    fn capacity_sectors(&self) -> u64 {
        0
    }

    fn execute(&self, task: TaskHandle) -> Result<Execution, StartError> {
        answer(task, &self.data())
    }
}

/// READ CAPACITY (10) parameter data, built from the issuing device.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadCapacityEmulation;

impl ReadCapacityEmulation {
    /// Last addressable LBA and block length, big-endian. Devices too large
    /// for 32 bits report `0xffff_ffff`.
    pub fn data(capacity_sectors: u64, block_size: u32) -> [u8; READ_CAPACITY_DATA_LEN] {
        let last = capacity_sectors.saturating_sub(1).min(u64::from(u32::MAX)) as u32;
        let mut data = [0u8; READ_CAPACITY_DATA_LEN];
        data[..4].copy_from_slice(&last.to_be_bytes());
        data[4..].copy_from_slice(&block_size.to_be_bytes());
        data
    }
}

impl StorageBackend for ReadCapacityEmulation {
    fn name(&self) -> &str {
        "read-capacity"
    }

    fn capacity_sectors(&self) -> u64 {
        0
    }

    fn execute(&self, task: TaskHandle) -> Result<Execution, StartError> {
        let geometry = task.command().device().geometry();
        answer(
            task,
            &Self::data(geometry.capacity_sectors, geometry.block_size),
        )
    }
}
