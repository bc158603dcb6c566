//! Status and sense construction.

use crate::model::{FailureCause, SenseReason};
use crate::scsi::{ScsiStatus, SenseData};

/// What a finished command is reported as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    Good,
    /// Sense data supplied by the backend, forwarded verbatim.
    Sense(SenseData),
    CheckCondition(SenseReason),
    Aborted,
}

/// Status byte plus optional sense data, as handed to the frontend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: ScsiStatus,
    pub sense: Option<SenseData>,
}

impl Response {
    pub fn good() -> Self {
        Self {
            status: ScsiStatus::GOOD,
            sense: None,
        }
    }

    pub fn check_condition(sense: SenseData) -> Self {
        Self {
            status: ScsiStatus::CHECK_CONDITION,
            sense: Some(sense),
        }
    }

    pub fn task_aborted() -> Self {
        Self {
            status: ScsiStatus::TASK_ABORTED,
            sense: None,
        }
    }

    pub fn is_good(&self) -> bool {
        self.status == ScsiStatus::GOOD
    }
}

/// Maps failures to SCSI status and sense.
pub trait ResponseBuilder: Send + Sync {
    /// Pick the failure class for a backend-reported cause. Must return a
    /// reason for which [`SenseReason::is_failure_class`] holds.
    fn classify(&self, cause: &FailureCause) -> SenseReason;

    fn build_response(&self, outcome: &CommandOutcome) -> Response;
}
