//! Per-device counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time copy of a device's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceStats {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub aborted: u64,
    pub stopped: u64,
    pub queue_full: u64,
    pub start_failures: u64,
    pub write_protect_skips: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
}

#[derive(Debug, Default)]
pub(crate) struct DeviceCounters {
    pub(crate) submitted: AtomicU64,
    pub(crate) completed: AtomicU64,
    pub(crate) failed: AtomicU64,
    pub(crate) aborted: AtomicU64,
    pub(crate) stopped: AtomicU64,
    pub(crate) queue_full: AtomicU64,
    pub(crate) start_failures: AtomicU64,
    pub(crate) write_protect_skips: AtomicU64,
    pub(crate) bytes_read: AtomicU64,
    pub(crate) bytes_written: AtomicU64,
}

impl DeviceCounters {
    pub(crate) fn snapshot(&self) -> DeviceStats {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        DeviceStats {
            submitted: load(&self.submitted),
            completed: load(&self.completed),
            failed: load(&self.failed),
            aborted: load(&self.aborted),
            stopped: load(&self.stopped),
            queue_full: load(&self.queue_full),
            start_failures: load(&self.start_failures),
            write_protect_skips: load(&self.write_protect_skips),
            bytes_read: load(&self.bytes_read),
            bytes_written: load(&self.bytes_written),
        }
    }
}
