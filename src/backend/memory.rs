//! In-memory block device.
//!
//! Sequential tasks are served inline from the execution loop. Random
//! tasks are moved to tokio's blocking pool when a runtime is available,
//! so one slow seek-heavy command does not hold up the rest of the list.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tracing::{debug, trace};

use crate::interfaces::{BackendError, Execution, StartError, StorageBackend};
use crate::model::{AccessPattern, FailureCause, Task, TaskHandle, TaskOutcome};

struct Store {
    block_size: u32,
    bytes: Mutex<Vec<u8>>,
    offline: Mutex<Option<String>>,
    failure: Mutex<Option<FailureCause>>,
}

impl Store {
    fn transfer(&self, task: &Task) -> TaskOutcome {
        if let Some(cause) = self.failure.lock().clone() {
            return TaskOutcome::failed(cause);
        }

        let block_size = u64::from(self.block_size);
        let mut bytes = self.bytes.lock();
        let capacity = bytes.len() as u64 / block_size;
        let in_range = task
            .lba()
            .checked_add(task.sectors())
            .is_some_and(|end| end <= capacity);
        if !in_range {
            return TaskOutcome::failed(FailureCause::Io(format!(
                "blocks {}+{} beyond capacity {}",
                task.lba(),
                task.sectors(),
                capacity
            )));
        }

        let start = (task.lba() * block_size) as usize;
        let len = task.byte_len().min(task.sectors() as usize * self.block_size as usize);
        let range = start..start + len;

        if task.direction().is_write() {
            let mut data = task.buffer().to_vec();
            data.truncate(len);
            bytes[start..start + data.len()].copy_from_slice(&data);
        } else if task.direction().is_read() {
            task.buffer().copy_from(&bytes[range]);
        }
        trace!(lba = task.lba(), sectors = task.sectors(), len, "Memory transfer");
        TaskOutcome::good()
    }
}

/// RAM-backed storage.
#[derive(Clone)]
pub struct MemoryBackend {
    name: String,
    store: Arc<Store>,
    offload_random: bool,
}

impl MemoryBackend {
    /// Zero-filled device of `capacity_sectors` blocks.
    pub fn new(name: impl Into<String>, block_size: u32, capacity_sectors: u64) -> Self {
        let len = (capacity_sectors * u64::from(block_size)) as usize;
        Self {
            name: name.into(),
            store: Arc::new(Store {
                block_size,
                bytes: Mutex::new(vec![0; len]),
                offline: Mutex::new(None),
                failure: Mutex::new(None),
            }),
            offload_random: true,
        }
    }

    /// Serve every task inline, whatever its access pattern.
    pub fn without_offload(mut self) -> Self {
        self.offload_random = false;
        self
    }

    pub fn block_size(&self) -> u32 {
        self.store.block_size
    }

    /// Copy of `sectors` blocks starting at `lba`.
    pub fn read_blocks(&self, lba: u64, sectors: u64) -> Vec<u8> {
        let block_size = self.store.block_size as usize;
        let start = lba as usize * block_size;
        let bytes = self.store.bytes.lock();
        bytes[start..start + sectors as usize * block_size].to_vec()
    }

    /// Overwrite storage starting at block `lba`.
    pub fn write_blocks(&self, lba: u64, data: &[u8]) {
        let start = lba as usize * self.store.block_size as usize;
        self.store.bytes.lock()[start..start + data.len()].copy_from_slice(data);
    }

    /// Refuse to start tasks until cleared.
    pub fn set_offline(&self, reason: Option<&str>) {
        *self.store.offline.lock() = reason.map(str::to_string);
    }

    /// Fail every task with `cause` until cleared.
    pub fn inject_failure(&self, cause: Option<FailureCause>) {
        *self.store.failure.lock() = cause;
    }
}

impl StorageBackend for MemoryBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn capacity_sectors(&self) -> u64 {
        self.store.bytes.lock().len() as u64 / u64::from(self.store.block_size)
    }

    fn execute(&self, task: TaskHandle) -> Result<Execution, StartError> {
        if let Some(reason) = self.store.offline.lock().clone() {
            return Err(StartError::new(task, BackendError::Offline(reason)));
        }

        if self.offload_random && task.access_pattern() == AccessPattern::Random {
            if let Ok(runtime) = Handle::try_current() {
                debug!(backend = %self.name, lba = task.task().lba(), "Offloading random task");
                let store = Arc::clone(&self.store);
                runtime.spawn_blocking(move || {
                    let outcome = store.transfer(task.task());
                    task.complete(outcome);
                });
                return Ok(Execution::Pending);
            }
        }

        let outcome = self.store.transfer(task.task());
        Ok(Execution::Complete(task, outcome))
    }
}

impl std::fmt::Debug for MemoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBackend")
            .field("name", &self.name)
            .field("block_size", &self.store.block_size)
            .field("offload_random", &self.offload_random)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DataBuffer, DataDirection};

    fn task(lba: u64, sectors: u64, direction: DataDirection, buffer: DataBuffer) -> Task {
        Task {
            index: 0,
            lba,
            sectors,
            byte_offset: 0,
            byte_len: buffer.len(),
            direction,
            buffer,
        }
    }

    #[test]
    fn test_write_then_read() {
        let backend = MemoryBackend::new("ram", 8, 16);
        assert_eq!(backend.capacity_sectors(), 16);

        let data: Vec<u8> = (0..16).collect();
        let write = task(2, 2, DataDirection::Write, DataBuffer::from_bytes(&data, 5));
        assert!(backend.store.transfer(&write).is_good());
        assert_eq!(backend.read_blocks(2, 2), data);

        let read = task(2, 2, DataDirection::Read, DataBuffer::zeroed(16, 3));
        assert!(backend.store.transfer(&read).is_good());
        assert_eq!(read.buffer().to_vec(), data);
    }

    #[test]
    fn test_out_of_range_is_io_failure() {
        let backend = MemoryBackend::new("ram", 8, 4);
        let read = task(3, 2, DataDirection::Read, DataBuffer::zeroed(16, 16));
        let outcome = backend.store.transfer(&read);
        assert!(matches!(outcome.cause(), Some(FailureCause::Io(_))));
    }

    #[test]
    fn test_injected_failure() {
        let backend = MemoryBackend::new("ram", 8, 4);
        backend.inject_failure(Some(FailureCause::NoSpace));
        let write = task(0, 1, DataDirection::Write, DataBuffer::zeroed(8, 8));
        assert_eq!(backend.store.transfer(&write).cause(), Some(&FailureCause::NoSpace));

        backend.inject_failure(None);
        assert!(backend.store.transfer(&write).is_good());
    }

    #[test]
    fn test_verify_touches_nothing() {
        let backend = MemoryBackend::new("ram", 8, 4);
        backend.write_blocks(0, &[1; 32]);
        let verify = task(0, 4, DataDirection::None, DataBuffer::empty());
        assert!(backend.store.transfer(&verify).is_good());
        assert_eq!(backend.read_blocks(0, 4), vec![1; 32]);
    }
}
