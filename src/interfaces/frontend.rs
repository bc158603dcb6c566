//! Transport frontend interface.

use crate::abort::{TmrRequest, TmrResponse};
use crate::model::{Command, Disposition};

use super::Response;

/// Errors a frontend reports when handed data or status.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrontendError {
    /// Transient: the engine keeps the command and retries later.
    #[error("Frontend queue full")]
    QueueFull,

    /// The connection is gone. The engine stops delivering and releases.
    #[error("Frontend disconnected: {0}")]
    Disconnected(String),
}

/// Delivers results back to the initiator.
///
/// Callbacks are made with no engine locks held and may call back into the
/// engine. For one command they are made in order, each at most once per
/// successful delivery: `queue_data_in`, `queue_status`, `release`.
pub trait Frontend: Send + Sync {
    /// Send the command's read data.
    fn queue_data_in(&self, command: &Command) -> Result<(), FrontendError>;

    /// Send the terminal status.
    fn queue_status(&self, command: &Command, response: &Response) -> Result<(), FrontendError>;

    /// Send the response to a task management request.
    fn queue_tm_response(&self, request: &TmrRequest, response: TmrResponse);

    /// The engine is done with `command` and will not touch it again.
    fn release(&self, command: &Command, disposition: Disposition) {
        let _ = (command, disposition);
    }
}
