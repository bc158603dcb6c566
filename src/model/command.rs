//! Commands and their lifecycle.
//!
//! A [`Command`] owns its tasks. Everything mutable sits behind one
//! per-command lock ([`CommandInner`]). Two counters live outside it: the
//! outstanding-task count, whose transition to zero elects the single
//! finisher, and the watch channels that abort and stop paths wait on.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tokio::sync::watch;

use super::buffer::DataBuffer;
use super::outcome::{AccessPattern, FailureCause, SenseReason};
use super::task::{Task, TaskState};
use super::{CommandId, CommandKind, DataDirection, Lun, TaskAttribute};
use crate::device::{Device, DeviceId};
use crate::interfaces::{Frontend, Response, StorageBackend};
use crate::scsi::{ScsiOp, SenseData};

/// Shared handle to a submitted command.
pub type CommandHandle = Arc<Command>;

/// Why a command was asked to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StopReason {
    /// ABORT TASK or LUN RESET; the initiator sees TASK ABORTED.
    Abort,
    /// The frontend withdrew the command; no status is sent.
    Withdrawn,
    /// The LUN is going away; the initiator sees CHECK CONDITION.
    LunShutdown,
}

// =============================================================================
// Command state machine
// =============================================================================
//
// Each non-terminal variant carries a token whose consuming methods are the
// only way to reach the next state. Terminal variants carry no token, so
// nothing can leave them.

/// Token for a running command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Running {
    _sealed: (),
}

/// Token for a command with a pending stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stopping {
    reason: StopReason,
}

/// Token for a command whose stop is waiting for in-flight tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Draining {
    reason: StopReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandState {
    Active(Running),
    StopRequested(Stopping),
    Draining(Draining),
    Complete,
    Aborted,
    Stopped(StopReason),
}

impl Running {
    pub(crate) fn request_stop(self, reason: StopReason) -> Stopping {
        Stopping { reason }
    }

    pub(crate) fn complete(self) -> CommandState {
        CommandState::Complete
    }
}

impl Stopping {
    pub fn reason(&self) -> StopReason {
        self.reason
    }

    pub(crate) fn drain(self) -> Draining {
        Draining {
            reason: self.reason,
        }
    }

    pub(crate) fn abort(self) -> CommandState {
        CommandState::Aborted
    }
}

impl Draining {
    pub fn reason(&self) -> StopReason {
        self.reason
    }

    pub(crate) fn stop(self) -> CommandState {
        CommandState::Stopped(self.reason)
    }
}

impl CommandState {
    pub(crate) fn new() -> Self {
        Self::Active(Running { _sealed: () })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Aborted | Self::Stopped(_))
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        match self {
            Self::StopRequested(s) => Some(s.reason()),
            Self::Draining(d) => Some(d.reason()),
            Self::Stopped(reason) => Some(*reason),
            Self::Aborted => Some(StopReason::Abort),
            Self::Active(_) | Self::Complete => None,
        }
    }

    /// Move to the terminal state once every task has a disposition.
    ///
    /// # Panics
    /// If the state is already terminal.
    #[track_caller]
    pub(crate) fn settle(self) -> (CommandState, Disposition) {
        match self {
            Self::Active(running) => (running.complete(), Disposition::Completed),
            Self::StopRequested(stopping) => match stopping.reason() {
                StopReason::Abort => (stopping.abort(), Disposition::Aborted),
                reason => (stopping.drain().stop(), Disposition::Stopped(reason)),
            },
            Self::Draining(draining) => (draining.stop(), Disposition::Stopped(draining.reason())),
            terminal => panic!("command settled twice (already {terminal:?})"),
        }
    }
}

/// How a finished command is reported to the frontend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Completed,
    Aborted,
    Stopped(StopReason),
}

/// Finishing work decided once and replayed by queue-full retries.
#[derive(Debug, Clone)]
pub(crate) struct FinishPlan {
    pub(crate) disposition: Disposition,
    pub(crate) data_in: bool,
    pub(crate) response: Option<Response>,
}

#[derive(Debug, Default)]
pub(crate) struct FinishProgress {
    /// Sticky: set by the first caller of the finishing step.
    pub(crate) claimed: bool,
    pub(crate) plan: Option<FinishPlan>,
    pub(crate) data_in_sent: bool,
    pub(crate) status_sent: bool,
    pub(crate) queue_full_retries: u32,
}

#[derive(Debug)]
pub(crate) struct CommandInner {
    pub(crate) state: CommandState,
    pub(crate) tasks: Vec<TaskState>,
    pub(crate) in_flight: usize,
    /// First backend failure. Sticky: later failures do not replace it.
    pub(crate) failure: Option<FailureCause>,
    /// First sense data supplied by a backend.
    pub(crate) sense: Option<SenseData>,
    /// Set when the command was refused before any task was built.
    pub(crate) rejection: Option<SenseReason>,
    pub(crate) progress: FinishProgress,
    pub(crate) released: bool,
}

/// Everything needed to build a [`Command`].
pub(crate) struct CommandParts {
    pub(crate) lun: Lun,
    pub(crate) tag: u64,
    pub(crate) cdb: Box<[u8]>,
    pub(crate) attribute: TaskAttribute,
    pub(crate) lba: u64,
    pub(crate) sectors: u64,
    pub(crate) data_length: usize,
    pub(crate) direction: DataDirection,
    pub(crate) kind: CommandKind,
    pub(crate) tasks: Vec<Task>,
    pub(crate) buffer: DataBuffer,
    pub(crate) executor: Option<Arc<dyn StorageBackend>>,
    pub(crate) rejection: Option<SenseReason>,
    pub(crate) frontend: Arc<dyn Frontend>,
}

/// A SCSI command accepted by the engine.
pub struct Command {
    id: CommandId,
    lun: Lun,
    tag: u64,
    cdb: Box<[u8]>,
    attribute: TaskAttribute,
    lba: u64,
    sectors: u64,
    data_length: usize,
    direction: DataDirection,
    kind: CommandKind,
    ordered_id: u32,
    access: AccessPattern,
    tasks: Box<[Task]>,
    buffer: DataBuffer,
    executor: Option<Arc<dyn StorageBackend>>,
    device: Arc<Device>,
    frontend: Arc<dyn Frontend>,
    outstanding: AtomicUsize,
    inner: Mutex<CommandInner>,
    in_flight_tx: watch::Sender<usize>,
    released_tx: watch::Sender<bool>,
}

impl Command {
    pub(crate) fn new(
        parts: CommandParts,
        device: Arc<Device>,
        ordered_id: u32,
        access: AccessPattern,
    ) -> Arc<Self> {
        let task_count = parts.tasks.len();
        Arc::new(Self {
            id: CommandId::new(),
            lun: parts.lun,
            tag: parts.tag,
            cdb: parts.cdb,
            attribute: parts.attribute,
            lba: parts.lba,
            sectors: parts.sectors,
            data_length: parts.data_length,
            direction: parts.direction,
            kind: parts.kind,
            ordered_id,
            access,
            tasks: parts.tasks.into_boxed_slice(),
            buffer: parts.buffer,
            executor: parts.executor,
            device,
            frontend: parts.frontend,
            outstanding: AtomicUsize::new(task_count),
            inner: Mutex::new(CommandInner {
                state: CommandState::new(),
                tasks: vec![TaskState::Dormant; task_count],
                in_flight: 0,
                failure: None,
                sense: None,
                rejection: parts.rejection,
                progress: FinishProgress::default(),
                released: false,
            }),
            in_flight_tx: watch::Sender::new(0),
            released_tx: watch::Sender::new(false),
        })
    }

    pub fn id(&self) -> CommandId {
        self.id
    }

    pub fn lun(&self) -> Lun {
        self.lun
    }

    /// Initiator task tag.
    pub fn tag(&self) -> u64 {
        self.tag
    }

    pub fn cdb(&self) -> &[u8] {
        &self.cdb
    }

    pub fn opcode(&self) -> ScsiOp {
        ScsiOp(self.cdb.first().copied().unwrap_or_default())
    }

    pub fn attribute(&self) -> TaskAttribute {
        self.attribute
    }

    pub fn lba(&self) -> u64 {
        self.lba
    }

    pub fn sectors(&self) -> u64 {
        self.sectors
    }

    pub fn data_length(&self) -> usize {
        self.data_length
    }

    pub fn direction(&self) -> DataDirection {
        self.direction
    }

    pub fn kind(&self) -> CommandKind {
        self.kind
    }

    /// Position in the device's submission order.
    pub fn ordered_id(&self) -> u32 {
        self.ordered_id
    }

    pub fn access_pattern(&self) -> AccessPattern {
        self.access
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn buffer(&self) -> &DataBuffer {
        &self.buffer
    }

    pub fn device_id(&self) -> DeviceId {
        self.device.id()
    }

    pub fn state(&self) -> CommandState {
        self.inner.lock().state
    }

    pub fn task_states(&self) -> Vec<TaskState> {
        self.inner.lock().tasks.clone()
    }

    pub fn failure(&self) -> Option<FailureCause> {
        self.inner.lock().failure.clone()
    }

    pub fn stop_requested(&self) -> bool {
        matches!(
            self.inner.lock().state,
            CommandState::StopRequested(_) | CommandState::Draining(_)
        )
    }

    pub fn status_sent(&self) -> bool {
        self.inner.lock().progress.status_sent
    }

    pub fn is_released(&self) -> bool {
        *self.released_tx.borrow()
    }

    /// Tasks that have not reached a terminal state.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, CommandInner> {
        self.inner.lock()
    }

    pub(crate) fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub(crate) fn frontend(&self) -> &Arc<dyn Frontend> {
        &self.frontend
    }

    pub(crate) fn executor(&self) -> Option<&Arc<dyn StorageBackend>> {
        self.executor.as_ref()
    }

    /// Retire one task. Returns `true` for the caller that retired the last one.
    ///
    /// # Panics
    /// If more tasks are retired than the command owns.
    #[track_caller]
    pub(crate) fn retire_task(&self) -> bool {
        let previous = self.outstanding.fetch_sub(1, Ordering::AcqRel);
        assert!(previous > 0, "command {} retired more tasks than it owns", self.id);
        previous == 1
    }

    pub(crate) fn publish_in_flight(&self, count: usize) {
        self.in_flight_tx.send_replace(count);
    }

    pub(crate) fn publish_released(&self) {
        self.released_tx.send_replace(true);
    }

    /// Resolves once no task of this command is held by a backend.
    pub async fn wait_idle(&self) {
        let mut rx = self.in_flight_tx.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|count| *count == 0).await;
    }

    /// Resolves once the engine has released the command to the frontend.
    pub async fn wait_released(&self) {
        let mut rx = self.released_tx.subscribe();
        let _ = rx.wait_for(|released| *released).await;
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("id", &self.id)
            .field("lun", &self.lun)
            .field("tag", &self.tag)
            .field("opcode", &self.opcode())
            .field("attribute", &self.attribute)
            .field("tasks", &self.tasks.len())
            .finish_non_exhaustive()
    }
}
