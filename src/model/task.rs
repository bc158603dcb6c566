//! Tasks: the unit of work handed to a storage backend.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use tracing::error;

use super::buffer::DataBuffer;
use super::command::Command;
use super::outcome::{AccessPattern, FailureCause, TaskOutcome};
use super::DataDirection;
use crate::completion;

/// Immutable description of one transfer-bounded slice of a command.
#[derive(Debug, Clone)]
pub struct Task {
    pub(crate) index: usize,
    pub(crate) lba: u64,
    pub(crate) sectors: u64,
    pub(crate) byte_offset: usize,
    pub(crate) byte_len: usize,
    pub(crate) direction: DataDirection,
    pub(crate) buffer: DataBuffer,
}

impl Task {
    /// Position within the parent command.
    pub fn index(&self) -> usize {
        self.index
    }

    /// First logical block this task covers.
    pub fn lba(&self) -> u64 {
        self.lba
    }

    /// Length in logical blocks. For a control task this is the range it
    /// addresses, if any; no data moves.
    pub fn sectors(&self) -> u64 {
        self.sectors
    }

    /// Offset of this task's data within the command's buffer.
    pub fn byte_offset(&self) -> usize {
        self.byte_offset
    }

    pub fn byte_len(&self) -> usize {
        self.byte_len
    }

    pub fn direction(&self) -> DataDirection {
        self.direction
    }

    pub fn buffer(&self) -> &DataBuffer {
        &self.buffer
    }
}

/// Per-task lifecycle.
///
/// ```text
/// Dormant -> Queued -> Active -> StopRequested -> Done
///    |          |        \_______________________/^
///    \__________\____________> Skipped
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Waiting for the command to be admitted by the scheduler.
    Dormant,
    /// On the device's ready list.
    Queued,
    /// Handed to a backend.
    Active,
    /// Handed to a backend; a stop was requested since.
    StopRequested,
    /// The backend reported.
    Done { ok: bool },
    /// Pulled before dispatch. The backend never saw it.
    Skipped,
}

impl TaskState {
    #[track_caller]
    pub(crate) fn enqueue(&mut self) {
        match self {
            Self::Dormant => *self = Self::Queued,
            other => panic!("task enqueued from {other:?}"),
        }
    }

    #[track_caller]
    pub(crate) fn dispatch(&mut self) {
        match self {
            Self::Queued => *self = Self::Active,
            other => panic!("task dispatched from {other:?}"),
        }
    }

    /// Flag an in-flight task. Returns whether it was in flight.
    pub(crate) fn request_stop(&mut self) -> bool {
        if *self == Self::Active {
            *self = Self::StopRequested;
        }
        *self == Self::StopRequested
    }

    #[track_caller]
    pub(crate) fn finish(&mut self, ok: bool) {
        match self {
            Self::Active | Self::StopRequested => *self = Self::Done { ok },
            other => panic!("task completed from {other:?}"),
        }
    }

    #[track_caller]
    pub(crate) fn skip(&mut self) {
        match self {
            Self::Dormant | Self::Queued => *self = Self::Skipped,
            other => panic!("task skipped from {other:?}"),
        }
    }

    pub fn is_in_flight(self) -> bool {
        matches!(self, Self::Active | Self::StopRequested)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done { .. } | Self::Skipped)
    }
}

/// Ownership token for one dispatched task.
///
/// The backend receives exactly one handle per dispatched task and reports
/// back by consuming it with [`TaskHandle::complete`]. A handle dropped
/// without completing reports [`FailureCause::Abandoned`], so every
/// dispatched task is completed exactly once.
pub struct TaskHandle {
    command: Arc<Command>,
    index: usize,
    reported: bool,
}

impl TaskHandle {
    pub(crate) fn new(command: Arc<Command>, index: usize) -> Self {
        Self {
            command,
            index,
            reported: false,
        }
    }

    pub fn task(&self) -> &Task {
        &self.command.tasks()[self.index]
    }

    pub fn command(&self) -> &Command {
        &self.command
    }

    pub fn access_pattern(&self) -> AccessPattern {
        self.command.access_pattern()
    }

    /// Whether the command this task belongs to has been asked to stop.
    /// Backends may use it to cut long transfers short.
    pub fn stop_requested(&self) -> bool {
        self.command.stop_requested()
    }

    /// Report the task's result. Consumes the handle.
    pub fn complete(mut self, outcome: TaskOutcome) {
        self.reported = true;
        completion::complete_task(&self.command, self.index, outcome);
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        if self.reported {
            return;
        }
        self.reported = true;
        let unwinding = std::thread::panicking();
        error!(
            command = %self.command.id(),
            task = self.index,
            unwinding,
            "Task handle dropped without completion"
        );

        let report = || {
            completion::complete_task(
                &self.command,
                self.index,
                TaskOutcome::failed(FailureCause::Abandoned),
            )
        };
        if !unwinding {
            report();
            return;
        }
        // A panic escaping a destructor while unwinding aborts the process.
        if panic::catch_unwind(AssertUnwindSafe(report)).is_err() {
            error!(
                command = %self.command.id(),
                task = self.index,
                "Reporting abandoned task panicked during unwind"
            );
        }
    }
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("command", &self.command.id())
            .field("index", &self.index)
            .finish()
    }
}
