//! Core data model: commands, tasks, buffers and outcomes.

mod buffer;
mod command;
mod outcome;
mod task;

#[cfg(test)]
mod tests;

use std::fmt;
use std::sync::Arc;

use uuid::Uuid;

use crate::interfaces::Frontend;

pub use buffer::{DataBuffer, Page, Segment};
pub use command::{
    Command, CommandHandle, CommandState, Disposition, Draining, Running, StopReason, Stopping,
};
pub(crate) use command::{CommandInner, CommandParts, FinishPlan};
pub use outcome::{AccessPattern, FailureCause, SenseReason, TaskOutcome};
pub use task::{Task, TaskHandle, TaskState};

/// Logical unit number as seen by the initiator.
pub type Lun = u64;

/// Engine-assigned command identity. Unique for the engine's lifetime;
/// initiator tags are only unique per nexus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CommandId(Uuid);

impl CommandId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CommandId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DataDirection {
    #[default]
    None,
    /// Device to initiator.
    Read,
    /// Initiator to device.
    Write,
    Bidirectional,
}

impl DataDirection {
    pub fn is_read(self) -> bool {
        matches!(self, Self::Read | Self::Bidirectional)
    }

    pub fn is_write(self) -> bool {
        matches!(self, Self::Write | Self::Bidirectional)
    }
}

/// SAM task attribute. Untagged commands are treated as `Simple`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TaskAttribute {
    #[default]
    Simple,
    Ordered,
    HeadOfQueue,
}

/// Data commands are split by the device's maximum transfer size;
/// control commands carry at most one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Data,
    Control,
}

/// A decoded command as handed over by a frontend.
pub struct CommandRequest {
    pub lun: Lun,
    pub tag: u64,
    pub cdb: Vec<u8>,
    pub attribute: TaskAttribute,
    pub buffer: DataBuffer,
    pub frontend: Arc<dyn Frontend>,
}

impl CommandRequest {
    pub fn new(lun: Lun, tag: u64, cdb: impl Into<Vec<u8>>, frontend: Arc<dyn Frontend>) -> Self {
        Self {
            lun,
            tag,
            cdb: cdb.into(),
            attribute: TaskAttribute::Simple,
            buffer: DataBuffer::empty(),
            frontend,
        }
    }

    pub fn with_attribute(mut self, attribute: TaskAttribute) -> Self {
        self.attribute = attribute;
        self
    }

    pub fn with_buffer(mut self, buffer: DataBuffer) -> Self {
        self.buffer = buffer;
        self
    }
}

impl fmt::Debug for CommandRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandRequest")
            .field("lun", &self.lun)
            .field("tag", &self.tag)
            .field("cdb", &self.cdb)
            .field("attribute", &self.attribute)
            .field("buffer_len", &self.buffer.len())
            .finish_non_exhaustive()
    }
}
