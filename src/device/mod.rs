//! Devices: per-LUN-backend execution state.
//!
//! Each device owns one lock over its scheduling state ([`DeviceQueue`]):
//! the task attribute scheduler, the ready list and the registry of
//! commands it has accepted. Lock order is device before command; no lock
//! is held across an await or a collaborator callback.

mod stats;

#[cfg(test)]
mod tests;

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, info};

use crate::config::DeviceConfig;
use crate::interfaces::{DeviceGeometry, ResponseBuilder, StorageBackend, SubmitError};
use crate::model::{AccessPattern, Command, CommandId, CommandKind, CommandParts, Lun};
use crate::scheduler::{Admission, TaskAttrScheduler};

pub use stats::DeviceStats;
pub(crate) use stats::DeviceCounters;

/// Engine-assigned device identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(pub u32);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dev{}", self.0)
    }
}

/// One task waiting on the ready list.
pub(crate) struct ReadyTask {
    pub(crate) command: Arc<Command>,
    pub(crate) index: usize,
}

/// A command whose data-in or status delivery hit a full frontend queue.
pub(crate) struct RetryEntry {
    pub(crate) command: Arc<Command>,
    pub(crate) queued_at: Instant,
}

struct DeviceQueue {
    scheduler: TaskAttrScheduler<Arc<Command>>,
    ready: VecDeque<ReadyTask>,
    commands: HashMap<CommandId, Arc<Command>>,
    next_ordered_id: u32,
    current_ordered_id: u32,
    last_extent_end: Option<u64>,
}

impl DeviceQueue {
    /// Move every task of an admitted command onto the ready list.
    fn enqueue(&mut self, command: Arc<Command>, at_head: bool) {
        let count = {
            let mut inner = command.lock();
            for state in inner.tasks.iter_mut() {
                state.enqueue();
            }
            inner.tasks.len()
        };
        if at_head {
            for index in (0..count).rev() {
                self.ready.push_front(ReadyTask {
                    command: Arc::clone(&command),
                    index,
                });
            }
        } else {
            for index in 0..count {
                self.ready.push_back(ReadyTask {
                    command: Arc::clone(&command),
                    index,
                });
            }
        }
    }
}

/// A logical device: backend, limits and scheduling state.
pub struct Device {
    id: DeviceId,
    config: DeviceConfig,
    backend: Arc<dyn StorageBackend>,
    responses: Arc<dyn ResponseBuilder>,
    queue: Mutex<DeviceQueue>,
    wake: Notify,
    retries: Mutex<VecDeque<RetryEntry>>,
    retry_wake: Notify,
    write_protect: AtomicBool,
    online: AtomicBool,
    counters: DeviceCounters,
}

impl Device {
    pub fn new(
        id: DeviceId,
        config: DeviceConfig,
        backend: Arc<dyn StorageBackend>,
        responses: Arc<dyn ResponseBuilder>,
    ) -> Arc<Self> {
        info!(
            device = %id,
            name = %config.name,
            backend = backend.name(),
            max_sectors = config.max_sectors,
            emulate_task_attr = config.emulate_task_attr,
            "Device attached"
        );
        Arc::new(Self {
            id,
            write_protect: AtomicBool::new(config.write_protect),
            queue: Mutex::new(DeviceQueue {
                scheduler: TaskAttrScheduler::new(config.emulate_task_attr),
                ready: VecDeque::new(),
                commands: HashMap::new(),
                next_ordered_id: 0,
                current_ordered_id: 0,
                last_extent_end: None,
            }),
            config,
            backend,
            responses,
            wake: Notify::new(),
            retries: Mutex::new(VecDeque::new()),
            retry_wake: Notify::new(),
            online: AtomicBool::new(true),
            counters: DeviceCounters::default(),
        })
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn geometry(&self) -> DeviceGeometry {
        DeviceGeometry {
            block_size: self.config.block_size,
            capacity_sectors: self.backend.capacity_sectors(),
        }
    }

    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    pub fn responses(&self) -> &Arc<dyn ResponseBuilder> {
        &self.responses
    }

    pub fn is_write_protected(&self) -> bool {
        self.write_protect.load(Ordering::Acquire)
    }

    pub fn set_write_protect(&self, on: bool) {
        info!(device = %self.id, write_protect = on, "Write protect changed");
        self.write_protect.store(on, Ordering::Release);
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    /// Flipped under the queue lock so no admission straddles the change:
    /// once this returns `false`, every accepted command is registered.
    pub(crate) fn set_online(&self, online: bool) {
        let _queue = self.queue.lock();
        self.online.store(online, Ordering::Release);
    }

    pub fn stats(&self) -> DeviceStats {
        self.counters.snapshot()
    }

    pub(crate) fn counters(&self) -> &DeviceCounters {
        &self.counters
    }

    /// Count of finished commands, wrapping. Advances once per completion.
    pub fn current_ordered_id(&self) -> u32 {
        self.queue.lock().current_ordered_id
    }

    pub fn ready_len(&self) -> usize {
        self.queue.lock().ready.len()
    }

    /// Commands parked by the task attribute scheduler.
    pub fn waiting_len(&self) -> usize {
        self.queue.lock().scheduler.waiting_len()
    }

    /// Commands accepted and not yet released.
    pub fn command_count(&self) -> usize {
        self.queue.lock().commands.len()
    }

    /// Commands on `lun` not yet released, oldest first.
    pub fn commands_for_lun(&self, lun: Lun) -> Vec<Arc<Command>> {
        let mut commands: Vec<_> = self
            .queue
            .lock()
            .commands
            .values()
            .filter(|c| c.lun() == lun)
            .cloned()
            .collect();
        commands.sort_by_key(|c| c.ordered_id());
        commands
    }

    /// LUNs with at least one unreleased command.
    pub fn active_luns(&self) -> Vec<Lun> {
        let mut luns: Vec<Lun> = self.queue.lock().commands.values().map(|c| c.lun()).collect();
        luns.sort_unstable();
        luns.dedup();
        luns
    }

    /// Find an unreleased command by initiator tag.
    pub fn find_by_tag(&self, lun: Lun, tag: u64) -> Option<Arc<Command>> {
        self.queue
            .lock()
            .commands
            .values()
            .filter(|c| c.lun() == lun && c.tag() == tag)
            .min_by_key(|c| c.ordered_id())
            .cloned()
    }

    /// Build and register a command, then offer it to the scheduler.
    ///
    /// Commands with no tasks are registered but never queued; the caller
    /// finishes them directly. Refused once the device is offline.
    pub(crate) fn admit(self: &Arc<Self>, parts: CommandParts) -> Result<Arc<Command>, SubmitError> {
        let mut queue = self.queue.lock();
        if !self.is_online() {
            return Err(SubmitError::DeviceOffline(self.id));
        }

        let ordered_id = queue.next_ordered_id;
        queue.next_ordered_id = queue.next_ordered_id.wrapping_add(1);

        let access = match parts.kind {
            CommandKind::Data if parts.sectors > 0 => {
                let access = match queue.last_extent_end {
                    Some(end) if end != parts.lba => AccessPattern::Random,
                    _ => AccessPattern::Sequential,
                };
                queue.last_extent_end = Some(parts.lba + parts.sectors);
                access
            }
            _ => AccessPattern::Sequential,
        };

        let attribute = parts.attribute;
        let has_tasks = !parts.tasks.is_empty();
        let command = Command::new(parts, Arc::clone(self), ordered_id, access);
        queue.commands.insert(command.id(), Arc::clone(&command));
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);

        if !has_tasks {
            return Ok(command);
        }

        let admitted = match queue
            .scheduler
            .admit(command.id(), attribute, Arc::clone(&command))
        {
            Admission::Now { item, at_head } => {
                queue.enqueue(item, at_head);
                true
            }
            Admission::Deferred => false,
        };
        drop(queue);

        if admitted {
            self.wake.notify_one();
        }
        Ok(command)
    }

    /// Pop the next task to dispatch.
    pub(crate) fn next_ready(&self) -> Option<ReadyTask> {
        self.queue.lock().ready.pop_front()
    }

    /// Scheduler bookkeeping for a command whose tasks all reached a
    /// terminal state. Admits whatever it unblocked.
    pub(crate) fn command_finished(&self, command: &Command) {
        let mut queue = self.queue.lock();
        let admitted = queue.scheduler.complete(command.id());
        queue.current_ordered_id = queue.current_ordered_id.wrapping_add(1);
        let woke = !admitted.is_empty();
        for next in admitted {
            debug!(device = %self.id, command = %next.id(), "Admitting deferred command");
            queue.enqueue(next, false);
        }
        drop(queue);

        if woke {
            self.wake.notify_one();
        }
    }

    /// Take a stopping command's undispatched tasks off the device.
    ///
    /// Returns the indices of the tasks removed; the caller retires them.
    pub(crate) fn pull_queued(&self, command: &Arc<Command>) -> Vec<usize> {
        let mut queue = self.queue.lock();

        if queue.scheduler.cancel(command.id()).is_some() {
            let admitted = queue.scheduler.drain();
            let woke = !admitted.is_empty();
            for next in admitted {
                queue.enqueue(next, false);
            }
            drop(queue);
            if woke {
                self.wake.notify_one();
            }
            return (0..command.tasks().len()).collect();
        }

        let mut pulled = Vec::new();
        queue.ready.retain(|ready| {
            if Arc::ptr_eq(&ready.command, command) {
                pulled.push(ready.index);
                false
            } else {
                true
            }
        });
        pulled
    }

    pub(crate) fn unregister(&self, id: CommandId) {
        self.queue.lock().commands.remove(&id);
    }

    pub(crate) fn wake(&self) -> &Notify {
        &self.wake
    }

    pub(crate) fn retry_wake(&self) -> &Notify {
        &self.retry_wake
    }

    /// Park a command for queue-full redelivery.
    pub(crate) fn defer_retry(&self, command: Arc<Command>) {
        self.retries.lock().push_back(RetryEntry {
            command,
            queued_at: Instant::now(),
        });
        self.counters.queue_full.fetch_add(1, Ordering::Relaxed);
        self.retry_wake.notify_one();
    }

    /// Splice out everything waiting for redelivery.
    pub(crate) fn take_retries(&self) -> VecDeque<RetryEntry> {
        std::mem::take(&mut *self.retries.lock())
    }

    /// Commands waiting for queue-full redelivery.
    pub fn retry_pending(&self) -> usize {
        self.retries.lock().len()
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.id)
            .field("name", &self.config.name)
            .field("backend", &self.backend.name())
            .finish_non_exhaustive()
    }
}
