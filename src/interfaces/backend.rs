//! Storage backend interface.

use crate::model::{TaskHandle, TaskOutcome};

/// Reasons a backend could not start a task.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    #[error("Backend offline: {0}")]
    Offline(String),

    #[error("Backend out of resources: {0}")]
    OutOfResources(String),

    #[error("Unsupported task: {0}")]
    Unsupported(String),
}

/// A task the backend refused to start, handed back to the engine.
#[derive(Debug, thiserror::Error)]
#[error("Task could not be started: {source}")]
pub struct StartError {
    pub task: TaskHandle,
    #[source]
    pub source: BackendError,
}

impl StartError {
    pub fn new(task: TaskHandle, source: BackendError) -> Self {
        Self { task, source }
    }
}

/// Result of starting a task.
#[derive(Debug)]
pub enum Execution {
    /// The transfer finished during the call.
    Complete(TaskHandle, TaskOutcome),
    /// The backend kept the handle and reports later through
    /// [`TaskHandle::complete`].
    Pending,
}

/// Executes tasks against backing storage.
///
/// `execute` is called from the device's execution loop with no engine
/// locks held. It must not block for the length of the I/O: a backend that
/// needs to wait keeps the handle and returns [`Execution::Pending`].
///
/// Implementations:
/// - `MemoryBackend`: RAM disk, optionally offloading random I/O
/// - Emulation executors for commands answered by the engine itself
pub trait StorageBackend: Send + Sync {
    /// Human-readable name for logging.
    fn name(&self) -> &str;

    /// Number of addressable logical blocks.
    fn capacity_sectors(&self) -> u64;

    /// Start executing one task.
    fn execute(&self, task: TaskHandle) -> Result<Execution, StartError>;
}
