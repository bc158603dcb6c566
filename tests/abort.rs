//! Task management and quiescence against commands held in flight.

mod common;

use std::collections::HashMap;
use std::sync::Arc;

use common::{manual_setup, released, until, within};
use target_engine::abort::abort_command;
use target_engine::model::{Disposition, StopReason};
use target_engine::scsi::ScsiStatus;
use target_engine::test_utils::{
    make_device, read10, request, submit, write10, MockBackend, MockFrontend,
};
use target_engine::{
    exec, DeviceConfig, QuiesceTarget, StorageBackend, TaskAttribute, TaskOutcome, TmrRequest,
    TmrResponse,
};
use tokio_test::{assert_pending, assert_ready_eq, task};

#[test]
fn test_abort_is_pending_until_backend_returns() {
    let backend = MockBackend::new();
    let device = make_device(
        DeviceConfig {
            max_sectors: 2,
            ..DeviceConfig::named("manual")
        },
        Arc::clone(&backend) as Arc<dyn StorageBackend>,
    );
    let frontend = MockFrontend::new();

    let command = submit(&device, request(0, 1, read10(0, 6), &frontend)).unwrap();
    exec::dispatch_ready(&device);
    assert_eq!(backend.pending_len(), 3);

    let mut abort = task::spawn(abort_command(&command));
    assert_pending!(abort.poll());
    assert!(command.stop_requested());

    backend.complete_next(TaskOutcome::good());
    backend.complete_next(TaskOutcome::good());
    assert_pending!(abort.poll());
    assert!(frontend.releases().is_empty());

    backend.complete_next(TaskOutcome::good());
    assert!(abort.is_woken());
    assert_ready_eq!(abort.poll(), TmrResponse::FunctionComplete);

    assert_eq!(frontend.status_for(1).unwrap().status, ScsiStatus::TASK_ABORTED);
    assert_eq!(frontend.releases(), vec![(1, Disposition::Aborted)]);
    assert!(!frontend.released_in_flight());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_aborts_racing_completions() {
    let (engine, device, backend) = manual_setup(4);
    let frontend = MockFrontend::new();
    const COMMANDS: u64 = 32;

    for tag in 0..COMMANDS {
        engine
            .submit(device.id(), request(0, tag, read10(tag as u32 * 8, 8), &frontend))
            .unwrap();
    }
    within(backend.wait_dispatched(2 * COMMANDS as usize)).await;

    let completer = {
        let backend = Arc::clone(&backend);
        tokio::task::spawn_blocking(move || {
            let mut done = 0;
            while done < 2 * COMMANDS as usize {
                if backend.complete_next(TaskOutcome::good()) {
                    done += 1;
                } else {
                    std::thread::yield_now();
                }
            }
        })
    };

    let mut aborts = Vec::new();
    for tag in (0..COMMANDS).filter(|t| t % 2 == 0) {
        let abort = engine
            .submit_tmr(device.id(), TmrRequest::abort_task(0, 1000 + tag, tag), frontend.clone())
            .unwrap();
        aborts.push((tag, abort));
    }

    let mut answers = HashMap::new();
    for (tag, abort) in aborts {
        answers.insert(tag, within(abort).await.unwrap());
    }
    within(completer).await.unwrap();
    released(&frontend, COMMANDS as usize).await;

    let statuses = frontend.statuses();
    assert_eq!(statuses.len(), COMMANDS as usize);
    assert_eq!(frontend.releases().len(), COMMANDS as usize);
    assert!(!frontend.released_in_flight());

    for (tag, response) in statuses {
        match answers.get(&tag) {
            Some(TmrResponse::FunctionComplete) => {
                assert_eq!(response.status, ScsiStatus::TASK_ABORTED, "tag {tag}");
            }
            Some(TmrResponse::TaskDoesNotExist) | None => {
                assert!(response.is_good(), "tag {tag}");
            }
            Some(other) => panic!("unexpected answer {other:?} for tag {tag}"),
        }
    }
    assert_eq!(frontend.tm_responses().len(), answers.len());
    assert_eq!(device.command_count(), 0);
    engine.shutdown().await;
}

#[tokio::test]
async fn test_lun_reset_clears_ordered_queue() {
    let (engine, device, backend) = manual_setup(8);
    let frontend = MockFrontend::new();

    engine
        .submit(device.id(), request(1, 1, write10(0, 8), &frontend))
        .unwrap();
    for tag in 2..6 {
        engine
            .submit(
                device.id(),
                request(1, tag, write10(0, 8), &frontend).with_attribute(TaskAttribute::Ordered),
            )
            .unwrap();
    }
    engine
        .submit(device.id(), request(2, 9, read10(64, 8), &frontend))
        .unwrap();
    within(backend.wait_dispatched(1)).await;
    assert_eq!(device.waiting_len(), 5);

    let reset = engine
        .submit_tmr(device.id(), TmrRequest::lun_reset(1, 500), frontend.clone())
        .unwrap();
    until(|| device.find_by_tag(1, 1).is_some_and(|c| c.stop_requested())).await;
    backend.complete_tag(1, TaskOutcome::good());

    assert_eq!(within(reset).await.unwrap(), TmrResponse::FunctionComplete);
    for tag in 1..6 {
        assert_eq!(
            frontend.status_for(tag).unwrap().status,
            ScsiStatus::TASK_ABORTED,
            "tag {tag}"
        );
    }
    assert_eq!(frontend.tm_responses(), vec![(500, TmrResponse::FunctionComplete)]);

    within(backend.wait_dispatched(2)).await;
    assert_eq!(backend.dispatched_tags(), vec![1, 9]);
    backend.complete_all();
    released(&frontend, 6).await;
    assert!(frontend.status_for(9).unwrap().is_good());
    engine.shutdown().await;
}

#[tokio::test]
async fn test_lun_quiesce_while_frontend_queue_is_full() {
    let (engine, device, backend) = manual_setup(8);
    let frontend = MockFrontend::new();
    frontend.refuse_status(3);

    engine
        .submit(device.id(), request(4, 1, read10(0, 8), &frontend))
        .unwrap();
    within(backend.wait_dispatched(1)).await;

    let quiesce = tokio::spawn({
        let engine = Arc::clone(&engine);
        let device = device.id();
        async move {
            engine
                .wait_quiescent(QuiesceTarget::Lun { device, lun: 4 })
                .await
        }
    });
    until(|| device.find_by_tag(4, 1).is_some_and(|c| c.stop_requested())).await;
    backend.complete_all();

    assert!(within(quiesce).await.unwrap());
    let sense = frontend.status_for(1).unwrap().sense.unwrap();
    assert_eq!(sense.additional_sense_code.0, 0x25);
    assert_eq!(frontend.statuses().len(), 1);
    assert_eq!(
        frontend.releases(),
        vec![(1, Disposition::Stopped(StopReason::LunShutdown))]
    );
    assert_eq!(device.stats().queue_full, 3);
    engine.shutdown().await;
}
