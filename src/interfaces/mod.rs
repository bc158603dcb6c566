//! Abstract interfaces for target engine collaborators.
//!
//! These traits define the contracts for:
//! - Storage backends (task execution)
//! - Transport frontends (data-in, status and TMR delivery)
//! - Command sequencers (CDB classification)
//! - Response builders (failure classification and sense data)

pub mod backend;
pub mod frontend;
pub mod responses;
pub mod sequencer;

pub use backend::{BackendError, Execution, StartError, StorageBackend};
pub use frontend::{Frontend, FrontendError};
pub use responses::{CommandOutcome, Response, ResponseBuilder};
pub use sequencer::{Classification, CommandSequencer, DeviceGeometry};

use crate::device::DeviceId;
use crate::split::SplitError;

/// Errors returned synchronously from command submission. No status is
/// sent to the initiator for a command refused this way.
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("Unknown device {0}")]
    UnknownDevice(DeviceId),

    #[error("Device {0} is offline")]
    DeviceOffline(DeviceId),

    #[error("Buffer of {actual} bytes is shorter than the {expected} byte transfer")]
    BufferTooSmall { expected: usize, actual: usize },

    #[error("Task split failed")]
    Split(#[from] SplitError),
}
