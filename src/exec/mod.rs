//! Per-device execution loop.
//!
//! Pops tasks off the device's ready list in order and hands each to its
//! executor: the command's emulation executor when it has one, the device
//! backend otherwise. The loop sleeps on the device's wake signal when the
//! list is empty and exits when its cancellation channel flips to `true`.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, error, info, trace, warn};

use crate::completion;
use crate::device::{Device, ReadyTask};
use crate::interfaces::{Execution, StartError};
use crate::model::{CommandState, FailureCause, TaskHandle, TaskOutcome};

#[cfg(test)]
mod tests;

/// Run the execution loop for `device` until cancelled.
pub(crate) async fn run(device: Arc<Device>, mut cancel: watch::Receiver<bool>) {
    info!(device = %device.id(), name = %device.name(), "Execution loop started");

    loop {
        dispatch_ready(&device);

        tokio::select! {
            _ = device.wake().notified() => {}
            changed = cancel.changed() => {
                if changed.is_err() || *cancel.borrow() {
                    break;
                }
            }
        }
    }

    info!(device = %device.id(), "Execution loop stopped");
}

/// Dispatch every task currently on the ready list. Returns how many were
/// taken off it.
pub fn dispatch_ready(device: &Arc<Device>) -> usize {
    let mut taken = 0;
    while let Some(ready) = device.next_ready() {
        dispatch(device, ready);
        taken += 1;
    }
    taken
}

fn dispatch(device: &Arc<Device>, ready: ReadyTask) {
    let ReadyTask { command, index } = ready;

    let sent = {
        let mut inner = command.lock();
        if matches!(inner.state, CommandState::Active(_)) {
            inner.tasks[index].dispatch();
            inner.in_flight += 1;
            command.publish_in_flight(inner.in_flight);
            true
        } else {
            false
        }
    };
    if !sent {
        trace!(command = %command.id(), task = index, "Stop requested, task skipped");
        completion::skip_task(&command, index);
        return;
    }

    let task = &command.tasks()[index];
    if task.direction().is_write() && device.is_write_protected() {
        warn!(
            device = %device.id(),
            command = %command.id(),
            lba = task.lba(),
            "Write to write-protected device completed without backend"
        );
        device
            .counters()
            .write_protect_skips
            .fetch_add(1, Ordering::Relaxed);
        completion::complete_task(&command, index, TaskOutcome::good());
        return;
    }

    let executor = Arc::clone(command.executor().unwrap_or_else(|| device.backend()));
    debug!(
        device = %device.id(),
        command = %command.id(),
        task = index,
        lba = task.lba(),
        sectors = task.sectors(),
        executor = executor.name(),
        "Dispatching task"
    );

    match executor.execute(TaskHandle::new(Arc::clone(&command), index)) {
        Ok(Execution::Complete(handle, outcome)) => handle.complete(outcome),
        Ok(Execution::Pending) => {}
        Err(StartError { task, source }) => {
            error!(
                device = %device.id(),
                command = %command.id(),
                task = index,
                error = %source,
                "Backend could not start task"
            );
            device
                .counters()
                .start_failures
                .fetch_add(1, Ordering::Relaxed);
            for pulled in device.pull_queued(&command) {
                completion::skip_task(&command, pulled);
            }
            task.complete(TaskOutcome::failed(FailureCause::NotStarted(
                source.to_string(),
            )));
        }
    }
}
