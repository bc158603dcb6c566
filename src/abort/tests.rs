//! Tests for aborts, stops and task management.

use std::time::Duration;

use super::*;
use crate::config::DeviceConfig;
use crate::exec::dispatch_ready;
use crate::interfaces::StorageBackend;
use crate::model::{Disposition, TaskAttribute, TaskOutcome};
use crate::scsi::{ScsiStatus, SenseKey};
use crate::test_utils::{
    make_device, read10, request, submit, write10, MockBackend, MockFrontend,
};

fn device(backend: &Arc<MockBackend>) -> Arc<Device> {
    let config = DeviceConfig {
        max_sectors: 4,
        ..DeviceConfig::named("test")
    };
    make_device(config, Arc::clone(backend) as Arc<dyn StorageBackend>)
}

async fn until(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("condition not reached");
}

#[tokio::test]
async fn test_abort_waits_for_backend() {
    let backend = MockBackend::new();
    let device = device(&backend);
    let frontend = MockFrontend::new();

    let command = submit(&device, request(0, 1, read10(0, 8), &frontend)).unwrap();
    dispatch_ready(&device);
    assert_eq!(backend.pending_len(), 2);

    let aborting = Arc::clone(&command);
    let abort = tokio::spawn(async move { abort_command(&aborting).await });
    until(|| command.stop_requested()).await;

    tokio::task::yield_now().await;
    assert!(!abort.is_finished());
    assert!(frontend.releases().is_empty());

    backend.complete_next(TaskOutcome::good());
    tokio::task::yield_now().await;
    assert!(frontend.releases().is_empty());

    backend.complete_next(TaskOutcome::good());
    assert_eq!(abort.await.unwrap(), TmrResponse::FunctionComplete);

    assert_eq!(frontend.status_for(1).unwrap().status, ScsiStatus::TASK_ABORTED);
    assert!(frontend.data_in_for(1).is_none());
    assert_eq!(frontend.releases(), vec![(1, Disposition::Aborted)]);
    assert!(!frontend.released_in_flight());
    assert_eq!(device.stats().aborted, 1);
}

#[tokio::test]
async fn test_abort_of_queued_command_pulls_tasks() {
    let backend = MockBackend::new();
    let device = device(&backend);
    let frontend = MockFrontend::new();

    let command = submit(&device, request(0, 1, read10(0, 8), &frontend)).unwrap();
    assert_eq!(device.ready_len(), 2);

    assert_eq!(abort_command(&command).await, TmrResponse::FunctionComplete);
    assert_eq!(device.ready_len(), 0);
    assert!(backend.dispatched().is_empty());
    assert_eq!(frontend.status_for(1).unwrap().status, ScsiStatus::TASK_ABORTED);
}

#[tokio::test]
async fn test_abort_of_waiting_command_unblocks_followers() {
    let backend = MockBackend::new();
    let device = device(&backend);
    let frontend = MockFrontend::new();

    submit(&device, request(0, 1, read10(0, 4), &frontend)).unwrap();
    let ordered = submit(
        &device,
        request(0, 2, write10(0, 4), &frontend).with_attribute(TaskAttribute::Ordered),
    )
    .unwrap();
    submit(&device, request(0, 3, read10(0, 4), &frontend)).unwrap();
    dispatch_ready(&device);
    assert_eq!(device.waiting_len(), 2);

    assert_eq!(abort_command(&ordered).await, TmrResponse::FunctionComplete);
    assert_eq!(device.waiting_len(), 0);

    dispatch_ready(&device);
    assert_eq!(backend.dispatched_tags(), vec![1, 3]);
    backend.complete_all();
    assert!(frontend.status_for(1).unwrap().is_good());
    assert_eq!(frontend.status_for(2).unwrap().status, ScsiStatus::TASK_ABORTED);
    assert!(frontend.status_for(3).unwrap().is_good());
}

#[tokio::test]
async fn test_second_abort_sends_nothing_extra() {
    let backend = MockBackend::new();
    let device = device(&backend);
    let frontend = MockFrontend::new();

    let command = submit(&device, request(0, 1, read10(0, 4), &frontend)).unwrap();
    dispatch_ready(&device);

    let first = tokio::spawn({
        let command = Arc::clone(&command);
        async move { abort_command(&command).await }
    });
    until(|| command.stop_requested()).await;
    let second = tokio::spawn({
        let command = Arc::clone(&command);
        async move { abort_command(&command).await }
    });
    tokio::task::yield_now().await;

    backend.complete_all();
    assert_eq!(first.await.unwrap(), TmrResponse::FunctionComplete);
    assert_eq!(second.await.unwrap(), TmrResponse::FunctionComplete);
    assert_eq!(frontend.statuses().len(), 1);
    assert_eq!(frontend.releases().len(), 1);

    assert_eq!(abort_command(&command).await, TmrResponse::TaskDoesNotExist);
    assert_eq!(frontend.statuses().len(), 1);
}

#[tokio::test]
async fn test_abort_after_completion_reports_missing_task() {
    let backend = MockBackend::immediate();
    let device = device(&backend);
    let frontend = MockFrontend::new();

    let command = submit(&device, request(0, 1, read10(0, 1), &frontend)).unwrap();
    dispatch_ready(&device);
    assert!(command.is_released());

    assert_eq!(abort_command(&command).await, TmrResponse::TaskDoesNotExist);
    assert!(frontend.status_for(1).unwrap().is_good());
}

#[tokio::test]
async fn test_withdrawn_command_gets_no_status() {
    let backend = MockBackend::new();
    let device = device(&backend);
    let frontend = MockFrontend::new();

    let command = submit(&device, request(0, 1, read10(0, 8), &frontend)).unwrap();
    dispatch_ready(&device);

    let stop = tokio::spawn({
        let command = Arc::clone(&command);
        async move { stop_command(&command, StopReason::Withdrawn).await }
    });
    until(|| command.stop_requested()).await;
    assert_eq!(command.state().stop_reason(), Some(StopReason::Withdrawn));

    backend.complete_all();
    assert!(stop.await.unwrap());
    assert!(frontend.statuses().is_empty());
    assert_eq!(
        frontend.releases(),
        vec![(1, Disposition::Stopped(StopReason::Withdrawn))]
    );
    assert_eq!(device.stats().stopped, 1);

    assert!(!stop_command(&command, StopReason::Withdrawn).await);
}

#[tokio::test]
async fn test_lun_shutdown_stops_only_that_lun() {
    let backend = MockBackend::new();
    let device = device(&backend);
    let frontend = MockFrontend::new();

    submit(&device, request(2, 1, read10(0, 4), &frontend)).unwrap();
    submit(&device, request(2, 2, read10(8, 4), &frontend)).unwrap();
    submit(&device, request(5, 3, read10(16, 4), &frontend)).unwrap();
    dispatch_ready(&device);

    let quiesce = tokio::spawn({
        let device = Arc::clone(&device);
        async move { quiesce_lun(&device, 2, StopReason::LunShutdown).await }
    });
    until(|| device.find_by_tag(2, 1).is_some_and(|c| c.stop_requested())).await;
    backend.complete_tag(1, TaskOutcome::good());
    until(|| device.find_by_tag(2, 2).is_some_and(|c| c.stop_requested())).await;
    backend.complete_tag(2, TaskOutcome::good());

    assert_eq!(quiesce.await.unwrap(), 2);
    for tag in [1, 2] {
        let sense = frontend.status_for(tag).unwrap().sense.unwrap();
        assert_eq!(sense.sense_key, SenseKey::ILLEGAL_REQUEST);
        assert_eq!(sense.additional_sense_code.0, 0x25);
    }
    assert!(frontend.status_for(3).is_none());
    assert_eq!(device.commands_for_lun(5).len(), 1);

    backend.complete_all();
    assert!(frontend.status_for(3).unwrap().is_good());
}

#[tokio::test]
async fn test_lun_reset_aborts_running_and_waiting() {
    let backend = MockBackend::new();
    let device = device(&backend);
    let frontend = MockFrontend::new();

    submit(&device, request(0, 1, read10(0, 4), &frontend)).unwrap();
    submit(
        &device,
        request(0, 2, write10(0, 4), &frontend).with_attribute(TaskAttribute::Ordered),
    )
    .unwrap();
    dispatch_ready(&device);

    let reset = tokio::spawn({
        let device = Arc::clone(&device);
        async move { handle_tmr(&device, &TmrRequest::lun_reset(0, 100)).await }
    });
    until(|| device.find_by_tag(0, 1).is_some_and(|c| c.stop_requested())).await;
    backend.complete_all();

    assert_eq!(reset.await.unwrap(), TmrResponse::FunctionComplete);
    assert_eq!(frontend.status_for(1).unwrap().status, ScsiStatus::TASK_ABORTED);
    assert_eq!(frontend.status_for(2).unwrap().status, ScsiStatus::TASK_ABORTED);
    assert_eq!(backend.dispatched_tags(), vec![1]);
    assert_eq!(device.command_count(), 0);
}

#[tokio::test]
async fn test_tmr_responses() {
    let backend = MockBackend::new();
    let device = device(&backend);

    let missing = TmrRequest::abort_task(0, 50, 999);
    assert_eq!(handle_tmr(&device, &missing).await, TmrResponse::TaskDoesNotExist);

    for function in [
        TmrFunction::AbortTaskSet,
        TmrFunction::ClearAca,
        TmrFunction::ClearTaskSet,
    ] {
        let request = TmrRequest {
            tag: 51,
            lun: 0,
            function,
        };
        assert_eq!(
            handle_tmr(&device, &request).await,
            TmrResponse::FunctionNotSupported
        );
    }

    for function in [TmrFunction::TargetWarmReset, TmrFunction::TargetColdReset] {
        let request = TmrRequest {
            tag: 52,
            lun: 0,
            function,
        };
        assert_eq!(handle_tmr(&device, &request).await, TmrResponse::FunctionRejected);
    }

    assert_eq!(
        handle_tmr(&device, &TmrRequest::lun_reset(0, 53)).await,
        TmrResponse::FunctionComplete
    );
}

#[tokio::test]
async fn test_abort_task_by_tag() {
    let backend = MockBackend::new();
    let device = device(&backend);
    let frontend = MockFrontend::new();

    submit(&device, request(1, 42, read10(0, 4), &frontend)).unwrap();

    let request = TmrRequest::abort_task(1, 7, 42);
    assert_eq!(handle_tmr(&device, &request).await, TmrResponse::FunctionComplete);
    assert_eq!(frontend.status_for(42).unwrap().status, ScsiStatus::TASK_ABORTED);
}
