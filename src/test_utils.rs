//! Test utilities and mock implementations.
//!
//! This module provides mock collaborators for driving the engine without a
//! real transport or backing store.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::abort::{TmrRequest, TmrResponse};
use crate::config::DeviceConfig;
use crate::device::{Device, DeviceId};
use crate::emulation::StandardResponses;
use crate::engine;
use crate::interfaces::{
    BackendError, Execution, Frontend, FrontendError, Response, StartError, StorageBackend,
    SubmitError,
};
use crate::model::{
    Command, CommandHandle, CommandRequest, DataBuffer, Disposition, Lun, TaskHandle, TaskOutcome,
};
use crate::scsi::ScsiOp;
use crate::sequencer::BasicSequencer;

/// Buffer handed to every command built by [`request`].
pub const TEST_BUFFER_LEN: usize = 64 * 1024;

/// Something the mock frontend was handed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrontendEvent {
    DataIn { tag: u64, data: Vec<u8> },
    Status { tag: u64, response: Response },
    Release {
        tag: u64,
        disposition: Disposition,
        /// Whether any task was still held by a backend at release.
        tasks_in_flight: bool,
    },
    TmResponse { tag: u64, response: TmrResponse },
}

#[derive(Default)]
struct Refusals {
    data_in: usize,
    status: usize,
    disconnected: bool,
}

/// Frontend that records every callback.
pub struct MockFrontend {
    events: Mutex<Vec<FrontendEvent>>,
    refusals: Mutex<Refusals>,
    releases: watch::Sender<usize>,
}

impl Default for MockFrontend {
    fn default() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            refusals: Mutex::new(Refusals::default()),
            releases: watch::Sender::new(0),
        }
    }
}

impl MockFrontend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Answer the next `n` status deliveries with a full queue.
    pub fn refuse_status(&self, n: usize) {
        self.refusals.lock().status = n;
    }

    /// Answer the next `n` data-in deliveries with a full queue.
    pub fn refuse_data_in(&self, n: usize) {
        self.refusals.lock().data_in = n;
    }

    /// Fail every delivery as if the connection dropped.
    pub fn disconnect(&self) {
        self.refusals.lock().disconnected = true;
    }

    pub fn events(&self) -> Vec<FrontendEvent> {
        self.events.lock().clone()
    }

    pub fn statuses(&self) -> Vec<(u64, Response)> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                FrontendEvent::Status { tag, response } => Some((*tag, response.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn status_for(&self, tag: u64) -> Option<Response> {
        self.statuses()
            .into_iter()
            .find(|(t, _)| *t == tag)
            .map(|(_, r)| r)
    }

    pub fn data_in_for(&self, tag: u64) -> Option<Vec<u8>> {
        self.events.lock().iter().find_map(|e| match e {
            FrontendEvent::DataIn { tag: t, data } if *t == tag => Some(data.clone()),
            _ => None,
        })
    }

    pub fn releases(&self) -> Vec<(u64, Disposition)> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                FrontendEvent::Release {
                    tag, disposition, ..
                } => Some((*tag, *disposition)),
                _ => None,
            })
            .collect()
    }

    /// Whether any command was released while a backend held one of its tasks.
    pub fn released_in_flight(&self) -> bool {
        self.events.lock().iter().any(|e| {
            matches!(
                e,
                FrontendEvent::Release {
                    tasks_in_flight: true,
                    ..
                }
            )
        })
    }

    pub fn tm_responses(&self) -> Vec<(u64, TmrResponse)> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                FrontendEvent::TmResponse { tag, response } => Some((*tag, *response)),
                _ => None,
            })
            .collect()
    }

    /// Resolves once at least `n` commands have been released.
    pub async fn wait_releases(&self, n: usize) {
        let mut rx = self.releases.subscribe();
        let _ = rx.wait_for(|count| *count >= n).await;
    }

    fn refuse(&self, pick: impl FnOnce(&mut Refusals) -> &mut usize) -> Result<(), FrontendError> {
        let mut refusals = self.refusals.lock();
        if refusals.disconnected {
            return Err(FrontendError::Disconnected("mock disconnected".to_string()));
        }
        let left = pick(&mut *refusals);
        if *left > 0 {
            *left -= 1;
            return Err(FrontendError::QueueFull);
        }
        Ok(())
    }
}

impl Frontend for MockFrontend {
    fn queue_data_in(&self, command: &Command) -> Result<(), FrontendError> {
        self.refuse(|r| &mut r.data_in)?;
        let mut data = command.buffer().to_vec();
        data.truncate(command.data_length());
        self.events.lock().push(FrontendEvent::DataIn {
            tag: command.tag(),
            data,
        });
        Ok(())
    }

    fn queue_status(&self, command: &Command, response: &Response) -> Result<(), FrontendError> {
        self.refuse(|r| &mut r.status)?;
        self.events.lock().push(FrontendEvent::Status {
            tag: command.tag(),
            response: response.clone(),
        });
        Ok(())
    }

    fn queue_tm_response(&self, request: &TmrRequest, response: TmrResponse) {
        self.events.lock().push(FrontendEvent::TmResponse {
            tag: request.tag,
            response,
        });
    }

    fn release(&self, command: &Command, disposition: Disposition) {
        let tasks_in_flight = command.task_states().iter().any(|s| s.is_in_flight());
        self.events.lock().push(FrontendEvent::Release {
            tag: command.tag(),
            disposition,
            tasks_in_flight,
        });
        self.releases.send_modify(|count| *count += 1);
    }
}

/// Backend that holds every task until the test completes it.
pub struct MockBackend {
    capacity: u64,
    immediate: bool,
    pending: Mutex<VecDeque<TaskHandle>>,
    dispatched: Mutex<Vec<(u64, usize)>>,
    dispatch_count: watch::Sender<usize>,
    start_error: Mutex<Option<BackendError>>,
}

impl MockBackend {
    pub const DEFAULT_CAPACITY: u64 = 1 << 20;

    /// Holds tasks until completed by the test.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::build(false))
    }

    /// Completes every task with GOOD during `execute`.
    pub fn immediate() -> Arc<Self> {
        Arc::new(Self::build(true))
    }

    /// Holding backend reporting `capacity` blocks.
    pub fn with_capacity(capacity: u64) -> Arc<Self> {
        Arc::new(Self {
            capacity,
            ..Self::build(false)
        })
    }

    fn build(immediate: bool) -> Self {
        Self {
            capacity: Self::DEFAULT_CAPACITY,
            immediate,
            pending: Mutex::new(VecDeque::new()),
            dispatched: Mutex::new(Vec::new()),
            dispatch_count: watch::Sender::new(0),
            start_error: Mutex::new(None),
        }
    }

    /// Refuse to start tasks with `error` until cleared.
    pub fn fail_start(&self, error: Option<BackendError>) {
        *self.start_error.lock() = error;
    }

    /// `(tag, task index)` of every task handed over, in dispatch order.
    pub fn dispatched(&self) -> Vec<(u64, usize)> {
        self.dispatched.lock().clone()
    }

    pub fn dispatched_tags(&self) -> Vec<u64> {
        let mut tags: Vec<u64> = Vec::new();
        for (tag, _) in self.dispatched.lock().iter() {
            if tags.last() != Some(tag) {
                tags.push(*tag);
            }
        }
        tags
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Resolves once at least `n` tasks have been handed over.
    pub async fn wait_dispatched(&self, n: usize) {
        let mut rx = self.dispatch_count.subscribe();
        let _ = rx.wait_for(|count| *count >= n).await;
    }

    /// Complete the oldest held task. Returns `false` if none was held.
    pub fn complete_next(&self, outcome: TaskOutcome) -> bool {
        let task = self.pending.lock().pop_front();
        match task {
            Some(task) => {
                task.complete(outcome);
                true
            }
            None => false,
        }
    }

    /// Complete every held task of the command tagged `tag`.
    pub fn complete_tag(&self, tag: u64, outcome: TaskOutcome) -> usize {
        let tasks: VecDeque<TaskHandle> = {
            let mut pending = self.pending.lock();
            let (matching, rest): (VecDeque<_>, VecDeque<_>) = pending
                .drain(..)
                .partition(|task| task.command().tag() == tag);
            *pending = rest;
            matching
        };
        let count = tasks.len();
        for task in tasks {
            task.complete(outcome.clone());
        }
        count
    }

    /// Complete every held task with GOOD.
    pub fn complete_all(&self) -> usize {
        let tasks: Vec<TaskHandle> = self.pending.lock().drain(..).collect();
        let count = tasks.len();
        for task in tasks {
            task.complete(TaskOutcome::good());
        }
        count
    }

    /// Take the oldest held task without completing it.
    pub fn take_next(&self) -> Option<TaskHandle> {
        self.pending.lock().pop_front()
    }
}

impl StorageBackend for MockBackend {
    fn name(&self) -> &str {
        "mock"
    }

    fn capacity_sectors(&self) -> u64 {
        self.capacity
    }

    fn execute(&self, task: TaskHandle) -> Result<Execution, StartError> {
        if let Some(error) = self.start_error.lock().clone() {
            return Err(StartError::new(task, error));
        }
        self.dispatched
            .lock()
            .push((task.command().tag(), task.task().index()));
        self.dispatch_count.send_modify(|count| *count += 1);

        if self.immediate {
            return Ok(Execution::Complete(task, TaskOutcome::good()));
        }
        self.pending.lock().push_back(task);
        Ok(Execution::Pending)
    }
}

/// A device with no worker tasks. Tests drive it with
/// [`exec::dispatch_ready`](crate::exec::dispatch_ready).
pub fn make_device(config: DeviceConfig, backend: Arc<dyn StorageBackend>) -> Arc<Device> {
    Device::new(DeviceId(0), config, backend, Arc::new(StandardResponses))
}

/// Request with a zeroed [`TEST_BUFFER_LEN`] byte buffer.
pub fn request(lun: Lun, tag: u64, cdb: Vec<u8>, frontend: &Arc<MockFrontend>) -> CommandRequest {
    CommandRequest::new(lun, tag, cdb, Arc::clone(frontend) as Arc<dyn Frontend>)
        .with_buffer(DataBuffer::zeroed(TEST_BUFFER_LEN, 4096))
}

/// Submit through the reference sequencer.
pub fn submit(device: &Arc<Device>, request: CommandRequest) -> Result<CommandHandle, SubmitError> {
    engine::submit(device, &BasicSequencer::new(), request)
}

pub fn read10(lba: u32, blocks: u16) -> Vec<u8> {
    rw10(ScsiOp::READ_10, lba, blocks)
}

pub fn write10(lba: u32, blocks: u16) -> Vec<u8> {
    rw10(ScsiOp::WRITE_10, lba, blocks)
}

fn rw10(op: ScsiOp, lba: u32, blocks: u16) -> Vec<u8> {
    let mut cdb = vec![0u8; 10];
    cdb[0] = op.0;
    cdb[2..6].copy_from_slice(&lba.to_be_bytes());
    cdb[7..9].copy_from_slice(&blocks.to_be_bytes());
    cdb
}

/// SYNCHRONIZE CACHE (10); zero blocks flushes through the last block.
pub fn synchronize_cache10(lba: u32, blocks: u16) -> Vec<u8> {
    rw10(ScsiOp::SYNCHRONIZE_CACHE, lba, blocks)
}

pub fn test_unit_ready() -> Vec<u8> {
    vec![ScsiOp::TEST_UNIT_READY.0, 0, 0, 0, 0, 0]
}

pub fn inquiry(allocation: u16) -> Vec<u8> {
    let mut cdb = vec![ScsiOp::INQUIRY.0, 0, 0, 0, 0, 0];
    cdb[3..5].copy_from_slice(&allocation.to_be_bytes());
    cdb
}

pub fn read_capacity10() -> Vec<u8> {
    let mut cdb = vec![0u8; 10];
    cdb[0] = ScsiOp::READ_CAPACITY.0;
    cdb
}
