//! Task results reported by backends and the reasons a command ends in
//! CHECK CONDITION.

use crate::scsi::SenseData;

/// Why a task failed, as reported by the backend that ran it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FailureCause {
    #[error("backing store unreachable: {0}")]
    Transport(String),
    #[error("backing store capacity changed")]
    CapacityChanged,
    #[error("backing store out of space")]
    NoSpace,
    #[error("I/O error: {0}")]
    Io(String),
    #[error("task could not be started: {0}")]
    NotStarted(String),
    #[error("task handle dropped without a completion")]
    Abandoned,
}

/// What a backend reports for one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskOutcome {
    result: Result<(), FailureCause>,
    sense: Option<SenseData>,
}

impl TaskOutcome {
    pub fn good() -> Self {
        Self {
            result: Ok(()),
            sense: None,
        }
    }

    pub fn failed(cause: FailureCause) -> Self {
        Self {
            result: Err(cause),
            sense: None,
        }
    }

    /// Attach backend-generated sense data. It is forwarded verbatim and
    /// turns the command's status into CHECK CONDITION.
    pub fn with_sense(mut self, sense: SenseData) -> Self {
        self.sense = Some(sense);
        self
    }

    pub fn is_good(&self) -> bool {
        self.result.is_ok()
    }

    pub fn cause(&self) -> Option<&FailureCause> {
        self.result.as_ref().err()
    }

    pub fn sense(&self) -> Option<&SenseData> {
        self.sense.as_ref()
    }

    pub(crate) fn into_parts(self) -> (Result<(), FailureCause>, Option<SenseData>) {
        (self.result, self.sense)
    }
}

/// Conditions reported to the initiator as CHECK CONDITION.
///
/// The first four are the classes a backend failure is mapped to; the rest
/// come from command validation or device state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SenseReason {
    LogicalUnitCommunicationFailure,
    CapacityDataChanged,
    SpaceAllocationFailed,
    LogicalUnitFailure,
    LogicalUnitNotSupported,
    InvalidCdbField,
    UnsupportedOpcode,
    LbaOutOfRange,
}

impl SenseReason {
    /// Whether this reason is one of the backend failure classes.
    pub fn is_failure_class(self) -> bool {
        matches!(
            self,
            Self::LogicalUnitCommunicationFailure
                | Self::CapacityDataChanged
                | Self::SpaceAllocationFailed
                | Self::LogicalUnitFailure
        )
    }
}

/// Hint recorded on each command: does it continue where the previous
/// command on the device left off?
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccessPattern {
    #[default]
    Sequential,
    Random,
}
