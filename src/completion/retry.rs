//! Queue-full redelivery sweep.
//!
//! Commands whose data-in or status hit a full frontend queue sit on their
//! device's retry list. The sweep task wakes when something is parked (or
//! any command on the device completes), waits out a backoff delay, splices
//! the whole list and resumes each command's delivery.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info};

use crate::config::RetryConfig;
use crate::device::Device;
use crate::utils::retry::QueueFullBackoff;

use super::resume_delivery;

/// Run the retry sweep for `device` until cancelled.
pub(crate) async fn run(device: Arc<Device>, config: RetryConfig, mut cancel: watch::Receiver<bool>) {
    let mut backoff = QueueFullBackoff::new(config);

    loop {
        tokio::select! {
            _ = device.retry_wake().notified() => {}
            changed = cancel.changed() => {
                if changed.is_err() || *cancel.borrow() {
                    break;
                }
            }
        }

        if device.retry_pending() == 0 {
            continue;
        }

        let delay = backoff.next_delay();
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            changed = cancel.changed() => {
                if changed.is_err() || *cancel.borrow() {
                    break;
                }
            }
        }

        sweep(&device);
        if device.retry_pending() == 0 {
            backoff.reset();
        }
    }

    info!(device = %device.id(), "Retry sweep stopped");
}

/// Resume delivery of every parked command once. Returns how many were
/// retried. Commands that hit a full queue again are parked again.
pub fn sweep(device: &Device) -> usize {
    let entries = device.take_retries();
    let count = entries.len();
    for entry in entries {
        debug!(
            device = %device.id(),
            command = %entry.command.id(),
            parked_ms = entry.queued_at.elapsed().as_millis() as u64,
            "Retrying delivery"
        );
        resume_delivery(&entry.command);
    }
    count
}
