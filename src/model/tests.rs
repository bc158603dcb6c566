//! Tests for command and task state transitions.

use super::*;

#[test]
fn test_active_settles_to_complete() {
    let (state, disposition) = CommandState::new().settle();
    assert_eq!(state, CommandState::Complete);
    assert_eq!(disposition, Disposition::Completed);
}

#[test]
fn test_abort_settles_to_aborted() {
    let CommandState::Active(running) = CommandState::new() else {
        unreachable!()
    };
    let state = CommandState::StopRequested(running.request_stop(StopReason::Abort));
    assert_eq!(state.stop_reason(), Some(StopReason::Abort));
    let (state, disposition) = state.settle();
    assert_eq!(state, CommandState::Aborted);
    assert_eq!(disposition, Disposition::Aborted);
}

#[test]
fn test_withdrawn_passes_through_draining() {
    let CommandState::Active(running) = CommandState::new() else {
        unreachable!()
    };
    let draining = running.request_stop(StopReason::Withdrawn).drain();
    let (state, disposition) = CommandState::Draining(draining).settle();
    assert_eq!(state, CommandState::Stopped(StopReason::Withdrawn));
    assert_eq!(disposition, Disposition::Stopped(StopReason::Withdrawn));
    assert!(state.is_terminal());
}

#[test]
#[should_panic(expected = "settled twice")]
fn test_terminal_state_cannot_settle_again() {
    let _ = CommandState::Complete.settle();
}

#[test]
fn test_task_state_happy_path() {
    let mut state = TaskState::Dormant;
    state.enqueue();
    state.dispatch();
    assert!(state.is_in_flight());
    assert!(state.request_stop());
    assert_eq!(state, TaskState::StopRequested);
    state.finish(false);
    assert_eq!(state, TaskState::Done { ok: false });
    assert!(state.is_terminal());
}

#[test]
fn test_request_stop_ignores_queued_task() {
    let mut state = TaskState::Queued;
    assert!(!state.request_stop());
    assert_eq!(state, TaskState::Queued);
    state.skip();
    assert_eq!(state, TaskState::Skipped);
}

#[test]
#[should_panic(expected = "task completed from")]
fn test_task_completed_twice_panics() {
    let mut state = TaskState::Active;
    state.finish(true);
    state.finish(true);
}

#[test]
#[should_panic(expected = "task skipped from")]
fn test_in_flight_task_cannot_be_skipped() {
    let mut state = TaskState::Active;
    state.skip();
}

#[test]
fn test_direction_predicates() {
    assert!(DataDirection::Read.is_read());
    assert!(!DataDirection::Read.is_write());
    assert!(DataDirection::Bidirectional.is_read());
    assert!(DataDirection::Bidirectional.is_write());
    assert!(!DataDirection::None.is_read());
}

#[test]
fn test_task_outcome_sense_and_cause() {
    let outcome = TaskOutcome::failed(FailureCause::NoSpace);
    assert!(!outcome.is_good());
    assert_eq!(outcome.cause(), Some(&FailureCause::NoSpace));
    assert!(TaskOutcome::good().sense().is_none());
}
