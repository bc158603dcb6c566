//! Target Engine - SCSI target command execution core
//!
//! Accepts decoded SCSI commands from a transport frontend, splits each one
//! into tasks bounded by the device's maximum transfer size, orders them
//! under SAM task attributes (SIMPLE, ORDERED, HEAD OF QUEUE), dispatches
//! them to a storage backend and folds the per-task results into exactly one
//! completion per command.
//!
//! Task management (ABORT TASK, LUN RESET) and frontend-initiated stops
//! are coordinated so that no command is released while a backend still
//! holds one of its tasks.

pub mod abort;
pub mod backend;
pub mod completion;
pub mod config;
pub mod device;
pub mod emulation;
pub mod engine;
pub mod exec;
pub mod interfaces;
pub mod model;
pub mod scheduler;
pub mod scsi;
pub mod sequencer;
pub mod split;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod utils;

pub use abort::{TmrFunction, TmrRequest, TmrResponse};
pub use completion::task_done;
pub use config::{DeviceConfig, EngineConfig, RetryConfig};
pub use device::{Device, DeviceStats};
pub use engine::{Engine, EngineError, QuiesceTarget};
pub use interfaces::{
    BackendError, CommandSequencer, Execution, Frontend, FrontendError, ResponseBuilder,
    StartError, StorageBackend, SubmitError,
};
pub use model::{
    CommandHandle, CommandRequest, DataBuffer, DataDirection, FailureCause, TaskAttribute,
    TaskHandle, TaskOutcome,
};
