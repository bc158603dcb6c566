//! Cancellation, task management and quiescence.
//!
//! Stopping a command is three steps: flag it (no new task of it is
//! dispatched after the flag is visible), pull its undispatched tasks off
//! the device, then wait until the backend has returned every task it still
//! holds and the completion pipeline has released the command. Nothing here
//! forces a backend to finish early.

#[cfg(test)]
mod tests;

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::completion;
use crate::device::Device;
use crate::model::{Command, CommandState, Lun, StopReason};

/// Task management functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TmrFunction {
    /// Abort the command carrying this initiator task tag.
    AbortTask { tag: u64 },
    AbortTaskSet,
    ClearAca,
    ClearTaskSet,
    LunReset,
    TargetWarmReset,
    TargetColdReset,
}

/// A task management request addressed to one LUN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TmrRequest {
    /// Tag of the TMR itself.
    pub tag: u64,
    pub lun: Lun,
    pub function: TmrFunction,
}

impl TmrRequest {
    pub fn abort_task(lun: Lun, tag: u64, referenced_tag: u64) -> Self {
        Self {
            tag,
            lun,
            function: TmrFunction::AbortTask {
                tag: referenced_tag,
            },
        }
    }

    pub fn lun_reset(lun: Lun, tag: u64) -> Self {
        Self {
            tag,
            lun,
            function: TmrFunction::LunReset,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TmrResponse {
    FunctionComplete,
    TaskDoesNotExist,
    FunctionNotSupported,
    FunctionRejected,
}

/// What flagging a command found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopRequest {
    /// This call set the flag.
    Requested,
    /// An earlier stop is in progress.
    AlreadyStopping,
    /// Terminal, but delivery has not finished.
    Finishing,
    /// Released.
    Finished,
}

fn request_stop(command: &Command, reason: StopReason) -> StopRequest {
    let mut inner = command.lock();
    let state = inner.state;
    match state {
        CommandState::Active(running) => {
            inner.state = CommandState::StopRequested(running.request_stop(reason));
            for state in inner.tasks.iter_mut() {
                state.request_stop();
            }
            StopRequest::Requested
        }
        CommandState::StopRequested(_) | CommandState::Draining(_) => StopRequest::AlreadyStopping,
        _ if inner.released => StopRequest::Finished,
        _ => StopRequest::Finishing,
    }
}

fn begin_draining(command: &Command) {
    let mut inner = command.lock();
    let state = inner.state;
    if let CommandState::StopRequested(stopping) = state {
        inner.state = CommandState::Draining(stopping.drain());
    }
}

/// Retire every task of `command` that has not reached a backend.
fn pull(command: &Arc<Command>) -> usize {
    let pulled = command.device().pull_queued(command);
    for &index in &pulled {
        completion::skip_task(command, index);
    }
    pulled.len()
}

/// Flag `command` and pull its undispatched tasks without waiting.
fn begin_stop(command: &Arc<Command>, reason: StopReason) -> StopRequest {
    let request = request_stop(command, reason);
    if request == StopRequest::Requested {
        if reason != StopReason::Abort {
            begin_draining(command);
        }
        let pulled = pull(command);
        debug!(command = %command.id(), tag = command.tag(), ?reason, pulled, "Stop requested");
    }
    request
}

/// Wait out a stop started by [`begin_stop`].
async fn finish_stop(command: &Command, request: StopRequest) {
    match request {
        StopRequest::Requested => {
            command.wait_idle().await;
            command.wait_released().await;
        }
        StopRequest::AlreadyStopping | StopRequest::Finishing => command.wait_released().await,
        StopRequest::Finished => {}
    }
}

fn abort_response(request: StopRequest) -> TmrResponse {
    match request {
        StopRequest::Requested | StopRequest::AlreadyStopping => TmrResponse::FunctionComplete,
        StopRequest::Finishing | StopRequest::Finished => TmrResponse::TaskDoesNotExist,
    }
}

/// Abort one command (ABORT TASK).
///
/// Answers `FunctionComplete` once the command is released with TASK
/// ABORTED, or `TaskDoesNotExist` when it had already finished. A second
/// abort of a command being aborted waits for the first and sends nothing.
#[tracing::instrument(name = "abort.command", skip_all, fields(command = %command.id(), tag = command.tag()))]
pub async fn abort_command(command: &Arc<Command>) -> TmrResponse {
    let request = begin_stop(command, StopReason::Abort);
    finish_stop(command, request).await;
    if request == StopRequest::Requested {
        info!("Command aborted");
    }
    abort_response(request)
}

/// Stop one command and wait until it is released.
///
/// Returns `true` if the command was still owned by the engine on entry,
/// `false` if it had already been released.
#[tracing::instrument(name = "abort.stop", skip_all, fields(command = %command.id(), ?reason))]
pub async fn stop_command(command: &Arc<Command>, reason: StopReason) -> bool {
    let request = begin_stop(command, reason);
    finish_stop(command, request).await;
    request != StopRequest::Finished
}

/// Stop every command on `lun` until none is left. Returns how many
/// commands were stopped.
///
/// Each round flags every command on the LUN before waiting on any, so a
/// waiting command cannot be admitted and dispatched behind the one being
/// waited on.
#[tracing::instrument(name = "abort.lun", skip(device), fields(device = %device.id()))]
pub async fn quiesce_lun(device: &Arc<Device>, lun: Lun, reason: StopReason) -> usize {
    let mut stopped = 0;
    loop {
        let commands = device.commands_for_lun(lun);
        if commands.is_empty() {
            break;
        }
        let requests: Vec<StopRequest> = commands
            .iter()
            .map(|command| begin_stop(command, reason))
            .collect();
        for (command, request) in commands.iter().zip(requests) {
            finish_stop(command, request).await;
            let owned = match reason {
                StopReason::Abort => abort_response(request) == TmrResponse::FunctionComplete,
                _ => request != StopRequest::Finished,
            };
            if owned {
                stopped += 1;
            }
        }
        tokio::task::yield_now().await;
    }
    info!(lun, stopped, "LUN quiesced");
    stopped
}

/// Execute a task management request against `device`.
#[tracing::instrument(name = "abort.tmr", skip_all, fields(device = %device.id(), lun = request.lun, function = ?request.function))]
pub async fn handle_tmr(device: &Arc<Device>, request: &TmrRequest) -> TmrResponse {
    let response = match request.function {
        TmrFunction::AbortTask { tag } => match device.find_by_tag(request.lun, tag) {
            Some(command) => abort_command(&command).await,
            None => {
                debug!(referenced_tag = tag, "No command with tag");
                TmrResponse::TaskDoesNotExist
            }
        },
        TmrFunction::LunReset => {
            quiesce_lun(device, request.lun, StopReason::Abort).await;
            TmrResponse::FunctionComplete
        }
        TmrFunction::AbortTaskSet | TmrFunction::ClearAca | TmrFunction::ClearTaskSet => {
            warn!("Task management function not supported");
            TmrResponse::FunctionNotSupported
        }
        TmrFunction::TargetWarmReset | TmrFunction::TargetColdReset => {
            warn!("Target reset rejected");
            TmrResponse::FunctionRejected
        }
    };
    info!(?response, "Task management request done");
    response
}
