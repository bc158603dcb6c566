//! Tests for device admission, ordering and bookkeeping.

use super::*;
use crate::exec::dispatch_ready;
use crate::model::{AccessPattern, TaskAttribute, TaskOutcome};
use crate::test_utils::{make_device, read10, request, submit, write10, MockBackend, MockFrontend};

fn small_device(backend: &Arc<MockBackend>) -> Arc<Device> {
    let config = DeviceConfig {
        max_sectors: 8,
        ..DeviceConfig::named("test")
    };
    make_device(config, Arc::clone(backend) as Arc<dyn StorageBackend>)
}

#[test]
fn test_ordered_id_and_access_pattern() {
    let backend = MockBackend::new();
    let device = small_device(&backend);
    let frontend = MockFrontend::new();

    let a = submit(&device, request(0, 1, read10(0, 8), &frontend)).unwrap();
    let b = submit(&device, request(0, 2, read10(8, 8), &frontend)).unwrap();
    let c = submit(&device, request(0, 3, write10(100, 4), &frontend)).unwrap();

    assert_eq!((a.ordered_id(), b.ordered_id(), c.ordered_id()), (0, 1, 2));
    assert_eq!(a.access_pattern(), AccessPattern::Sequential);
    assert_eq!(b.access_pattern(), AccessPattern::Sequential);
    assert_eq!(c.access_pattern(), AccessPattern::Random);
    assert_eq!(device.stats().submitted, 3);
}

#[test]
fn test_ordered_command_waits_for_earlier_simple() {
    let backend = MockBackend::new();
    let device = small_device(&backend);
    let frontend = MockFrontend::new();

    submit(&device, request(0, 1, read10(0, 8), &frontend)).unwrap();
    submit(
        &device,
        request(0, 2, write10(0, 8), &frontend).with_attribute(TaskAttribute::Ordered),
    )
    .unwrap();
    submit(&device, request(0, 3, read10(0, 8), &frontend)).unwrap();

    dispatch_ready(&device);
    assert_eq!(backend.dispatched_tags(), vec![1]);
    assert_eq!(device.waiting_len(), 2);

    assert_eq!(backend.complete_tag(1, TaskOutcome::good()), 1);
    dispatch_ready(&device);
    assert_eq!(backend.dispatched_tags(), vec![1, 2]);
    assert_eq!(device.waiting_len(), 1);

    backend.complete_tag(2, TaskOutcome::good());
    dispatch_ready(&device);
    assert_eq!(backend.dispatched_tags(), vec![1, 2, 3]);
    assert_eq!(device.waiting_len(), 0);

    backend.complete_all();
    assert_eq!(device.command_count(), 0);
    assert_eq!(device.current_ordered_id(), 3);
}

#[test]
fn test_head_of_queue_jumps_ready_list() {
    let backend = MockBackend::new();
    let device = small_device(&backend);
    let frontend = MockFrontend::new();

    submit(&device, request(0, 1, read10(0, 24), &frontend)).unwrap();
    submit(
        &device,
        request(0, 2, read10(64, 16), &frontend).with_attribute(TaskAttribute::HeadOfQueue),
    )
    .unwrap();
    assert_eq!(device.ready_len(), 5);

    dispatch_ready(&device);
    assert_eq!(
        backend.dispatched(),
        vec![(2, 0), (2, 1), (1, 0), (1, 1), (1, 2)]
    );
}

#[test]
fn test_head_of_queue_ignores_running_ordered() {
    let backend = MockBackend::new();
    let device = small_device(&backend);
    let frontend = MockFrontend::new();

    submit(
        &device,
        request(0, 1, write10(0, 8), &frontend).with_attribute(TaskAttribute::Ordered),
    )
    .unwrap();
    dispatch_ready(&device);
    submit(
        &device,
        request(0, 2, read10(0, 8), &frontend).with_attribute(TaskAttribute::HeadOfQueue),
    )
    .unwrap();
    dispatch_ready(&device);

    assert_eq!(backend.dispatched_tags(), vec![1, 2]);
    assert_eq!(device.waiting_len(), 0);
}

#[test]
fn test_without_emulation_everything_runs() {
    let backend = MockBackend::new();
    let config = DeviceConfig {
        emulate_task_attr: false,
        ..DeviceConfig::named("plain")
    };
    let device = make_device(config, Arc::clone(&backend) as Arc<dyn StorageBackend>);
    let frontend = MockFrontend::new();

    submit(&device, request(0, 1, read10(0, 1), &frontend)).unwrap();
    submit(
        &device,
        request(0, 2, write10(0, 1), &frontend).with_attribute(TaskAttribute::Ordered),
    )
    .unwrap();
    submit(
        &device,
        request(0, 3, read10(0, 1), &frontend).with_attribute(TaskAttribute::HeadOfQueue),
    )
    .unwrap();

    dispatch_ready(&device);
    assert_eq!(backend.dispatched_tags(), vec![1, 2, 3]);
    assert_eq!(device.waiting_len(), 0);
}

#[test]
fn test_registry_lookups() {
    let backend = MockBackend::new();
    let device = small_device(&backend);
    let frontend = MockFrontend::new();

    let a = submit(&device, request(0, 7, read10(0, 1), &frontend)).unwrap();
    let b = submit(&device, request(3, 7, read10(0, 1), &frontend)).unwrap();
    submit(&device, request(3, 8, read10(0, 1), &frontend)).unwrap();

    assert_eq!(device.command_count(), 3);
    assert_eq!(device.active_luns(), vec![0, 3]);
    assert_eq!(device.commands_for_lun(3).len(), 2);
    assert_eq!(device.find_by_tag(0, 7).unwrap().id(), a.id());
    assert_eq!(device.find_by_tag(3, 7).unwrap().id(), b.id());
    assert!(device.find_by_tag(1, 7).is_none());

    dispatch_ready(&device);
    backend.complete_all();
    assert_eq!(device.command_count(), 0);
    assert!(device.active_luns().is_empty());
    assert!(device.find_by_tag(0, 7).is_none());
}

#[test]
fn test_offline_device_refuses_submission() {
    let backend = MockBackend::new();
    let device = small_device(&backend);
    let frontend = MockFrontend::new();

    device.set_online(false);
    let err = submit(&device, request(0, 1, read10(0, 1), &frontend)).unwrap_err();
    assert!(matches!(err, crate::interfaces::SubmitError::DeviceOffline(_)));
    assert_eq!(device.stats().submitted, 0);
}

#[test]
fn test_admit_rechecks_online_under_queue_lock() {
    let backend = MockBackend::new();
    let device = small_device(&backend);
    let frontend = MockFrontend::new();

    // The submit path checked `is_online` before the device went offline.
    assert!(device.is_online());
    device.set_online(false);

    let parts = CommandParts {
        lun: 0,
        tag: 1,
        cdb: read10(0, 1).into_boxed_slice(),
        attribute: TaskAttribute::Simple,
        lba: 0,
        sectors: 0,
        data_length: 0,
        direction: crate::model::DataDirection::None,
        kind: CommandKind::Control,
        tasks: Vec::new(),
        buffer: crate::model::DataBuffer::empty(),
        executor: None,
        rejection: None,
        frontend,
    };
    let err = device.admit(parts).unwrap_err();
    assert!(matches!(err, SubmitError::DeviceOffline(id) if id == device.id()));
    assert_eq!(device.command_count(), 0);
    assert_eq!(device.stats().submitted, 0);
    assert!(backend.dispatched().is_empty());
}
