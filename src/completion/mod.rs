//! Completion pipeline.
//!
//! Every task ends exactly once, either completed by its backend or
//! skipped before dispatch. The caller that retires a command's last task
//! runs the finishing step: settle the command state, let the scheduler
//! admit whatever was waiting on it, then deliver data-in and status to the
//! frontend and release the command.
//!
//! Delivery is resumable. A frontend reporting a full queue parks the
//! command on the device's retry list; the retry sweep picks it up where it
//! stopped, never sending data-in or status twice.

pub mod retry;


use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::interfaces::{CommandOutcome, FrontendError};
use crate::model::{
    Command, Disposition, FinishPlan, SenseReason, StopReason, TaskHandle, TaskOutcome,
};
use crate::utils::retry::is_retryable;

/// Report a backend result for a dispatched task.
pub fn task_done(task: TaskHandle, outcome: TaskOutcome) {
    task.complete(outcome);
}

/// Record a dispatched task's result and retire it.
pub(crate) fn complete_task(command: &Arc<Command>, index: usize, outcome: TaskOutcome) {
    let (result, sense) = outcome.into_parts();
    {
        let mut inner = command.lock();
        inner.tasks[index].finish(result.is_ok());
        inner.in_flight = inner
            .in_flight
            .checked_sub(1)
            .unwrap_or_else(|| panic!("in-flight underflow on command {}", command.id()));
        command.publish_in_flight(inner.in_flight);

        if let Some(sense) = sense {
            inner.sense.get_or_insert(sense);
        }
        if let Err(cause) = result {
            debug!(command = %command.id(), task = index, %cause, "Task failed");
            inner.failure.get_or_insert(cause);
        }
    }

    if command.retire_task() {
        finish(command);
    }
}

/// Retire a task that never reached a backend.
pub(crate) fn skip_task(command: &Arc<Command>, index: usize) {
    command.lock().tasks[index].skip();
    if command.retire_task() {
        finish(command);
    }
}

/// Every task has a disposition: settle the command and start delivery.
pub(crate) fn finish(command: &Arc<Command>) {
    let disposition = {
        let mut inner = command.lock();
        let (state, disposition) = inner.state.settle();
        inner.state = state;
        disposition
    };

    let device = command.device();
    device.command_finished(command);
    if device.retry_pending() > 0 {
        device.retry_wake().notify_one();
    }

    debug!(
        device = %device.id(),
        command = %command.id(),
        tag = command.tag(),
        ?disposition,
        "Command finished"
    );
    deliver(command, disposition);
}

/// The finishing step. Runs at most once per command: later callers see
/// the claim and return.
pub(crate) fn deliver(command: &Arc<Command>, disposition: Disposition) {
    let (rejection, failure, sense) = {
        let mut inner = command.lock();
        if inner.progress.claimed || inner.progress.status_sent {
            return;
        }
        inner.progress.claimed = true;
        (inner.rejection, inner.failure.clone(), inner.sense)
    };

    let responses = command.device().responses();
    let counters = command.device().counters();
    let plan = match disposition {
        Disposition::Completed => {
            // Backend sense is more specific than a classified failure.
            let outcome = if let Some(reason) = rejection {
                CommandOutcome::CheckCondition(reason)
            } else if let Some(sense) = sense {
                CommandOutcome::Sense(sense)
            } else if let Some(cause) = &failure {
                CommandOutcome::CheckCondition(responses.classify(cause))
            } else {
                CommandOutcome::Good
            };
            let good = outcome == CommandOutcome::Good;
            if good {
                counters.completed.fetch_add(1, Ordering::Relaxed);
            } else {
                counters.failed.fetch_add(1, Ordering::Relaxed);
            }
            FinishPlan {
                disposition,
                data_in: good && command.direction().is_read() && command.data_length() > 0,
                response: Some(responses.build_response(&outcome)),
            }
        }
        Disposition::Aborted | Disposition::Stopped(StopReason::Abort) => {
            counters.aborted.fetch_add(1, Ordering::Relaxed);
            FinishPlan {
                disposition,
                data_in: false,
                response: Some(responses.build_response(&CommandOutcome::Aborted)),
            }
        }
        Disposition::Stopped(StopReason::LunShutdown) => {
            counters.stopped.fetch_add(1, Ordering::Relaxed);
            FinishPlan {
                disposition,
                data_in: false,
                response: Some(responses.build_response(&CommandOutcome::CheckCondition(
                    SenseReason::LogicalUnitNotSupported,
                ))),
            }
        }
        Disposition::Stopped(StopReason::Withdrawn) => {
            counters.stopped.fetch_add(1, Ordering::Relaxed);
            FinishPlan {
                disposition,
                data_in: false,
                response: None,
            }
        }
    };

    command.lock().progress.plan = Some(plan);
    resume_delivery(command);
}

enum Delivery {
    Sent,
    Parked,
    Abandoned,
}

/// Carry a claimed command's delivery forward from where it stopped.
pub(crate) fn resume_delivery(command: &Arc<Command>) {
    let (plan, data_in_sent, status_sent) = {
        let inner = command.lock();
        let Some(plan) = inner.progress.plan.clone() else {
            panic!("delivery resumed on unclaimed command {}", command.id());
        };
        (plan, inner.progress.data_in_sent, inner.progress.status_sent)
    };
    let frontend = command.frontend();
    let counters = command.device().counters();

    if plan.data_in && !data_in_sent {
        match attempt(command, frontend.queue_data_in(command)) {
            Delivery::Sent => {
                command.lock().progress.data_in_sent = true;
                counters
                    .bytes_read
                    .fetch_add(command.data_length() as u64, Ordering::Relaxed);
            }
            Delivery::Parked => return,
            Delivery::Abandoned => {
                release(command, plan.disposition);
                return;
            }
        }
    }

    if let Some(response) = &plan.response {
        if !status_sent {
            match attempt(command, frontend.queue_status(command, response)) {
                Delivery::Sent => {
                    command.lock().progress.status_sent = true;
                    if response.is_good() && command.direction().is_write() {
                        counters
                            .bytes_written
                            .fetch_add(command.data_length() as u64, Ordering::Relaxed);
                    }
                    trace!(command = %command.id(), status = ?response.status, "Status sent");
                }
                Delivery::Parked => return,
                Delivery::Abandoned => {}
            }
        }
    }

    release(command, plan.disposition);
}

fn attempt(command: &Arc<Command>, result: Result<(), FrontendError>) -> Delivery {
    match result {
        Ok(()) => Delivery::Sent,
        Err(err) if is_retryable(&err) => {
            let retries = {
                let mut inner = command.lock();
                inner.progress.queue_full_retries += 1;
                inner.progress.queue_full_retries
            };
            warn!(
                command = %command.id(),
                tag = command.tag(),
                retries,
                "Frontend queue full, delivery parked"
            );
            command.device().defer_retry(Arc::clone(command));
            Delivery::Parked
        }
        Err(err) => {
            warn!(command = %command.id(), error = %err, "Frontend gone, dropping delivery");
            Delivery::Abandoned
        }
    }
}

/// Hand the command back to the frontend. Happens once, after every task
/// has a terminal disposition.
///
/// # Panics
/// On a second release of the same command.
fn release(command: &Arc<Command>, disposition: Disposition) {
    {
        let mut inner = command.lock();
        assert!(!inner.released, "command {} released twice", command.id());
        inner.released = true;
    }
    command.device().unregister(command.id());
    command.frontend().release(command, disposition);
    command.publish_released();
    trace!(command = %command.id(), "Command released");
}
