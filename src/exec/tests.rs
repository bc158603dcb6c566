//! Tests for task dispatch.

use super::*;
use crate::config::DeviceConfig;
use crate::interfaces::{BackendError, StorageBackend};
use crate::model::Disposition;
use crate::scsi::{ScsiStatus, SenseKey};
use crate::sequencer::INQUIRY_DATA_LEN;
use crate::test_utils::{
    inquiry, make_device, read10, read_capacity10, request, submit, test_unit_ready, write10,
    MockBackend, MockFrontend,
};

fn device_with(backend: &Arc<MockBackend>, config: DeviceConfig) -> Arc<Device> {
    make_device(config, Arc::clone(backend) as Arc<dyn StorageBackend>)
}

#[test]
fn test_write_protected_write_skips_backend() {
    let backend = MockBackend::new();
    let device = device_with(
        &backend,
        DeviceConfig {
            write_protect: true,
            ..DeviceConfig::named("ro")
        },
    );
    let frontend = MockFrontend::new();

    submit(&device, request(0, 1, write10(0, 4), &frontend)).unwrap();
    submit(&device, request(0, 2, read10(0, 4), &frontend)).unwrap();
    dispatch_ready(&device);

    assert_eq!(backend.dispatched_tags(), vec![2]);
    assert!(frontend.status_for(1).unwrap().is_good());
    assert_eq!(device.stats().write_protect_skips, 1);
}

#[test]
fn test_start_failure_drains_command() {
    let backend = MockBackend::new();
    let device = device_with(
        &backend,
        DeviceConfig {
            max_sectors: 2,
            ..DeviceConfig::named("flaky")
        },
    );
    let frontend = MockFrontend::new();
    backend.fail_start(Some(BackendError::Offline("unplugged".into())));

    let command = submit(&device, request(0, 1, read10(0, 6), &frontend)).unwrap();
    assert_eq!(command.tasks().len(), 3);
    assert_eq!(dispatch_ready(&device), 1);

    let response = frontend.status_for(1).unwrap();
    assert_eq!(response.status, ScsiStatus::CHECK_CONDITION);
    let sense = response.sense.unwrap();
    assert_eq!(sense.sense_key, SenseKey::HARDWARE_ERROR);
    assert_eq!(sense.additional_sense_code.0, 0x44);

    assert!(backend.dispatched().is_empty());
    assert!(frontend.data_in_for(1).is_none());
    assert_eq!(device.ready_len(), 0);
    assert_eq!(device.stats().start_failures, 1);
    assert_eq!(frontend.releases(), vec![(1, Disposition::Completed)]);
}

#[test]
fn test_start_failure_leaves_other_commands_alone() {
    let backend = MockBackend::new();
    let device = device_with(&backend, DeviceConfig::named("flaky"));
    let frontend = MockFrontend::new();

    backend.fail_start(Some(BackendError::OutOfResources("no slots".into())));
    submit(&device, request(0, 1, read10(0, 1), &frontend)).unwrap();
    dispatch_ready(&device);

    backend.fail_start(None);
    submit(&device, request(0, 2, read10(0, 1), &frontend)).unwrap();
    dispatch_ready(&device);
    backend.complete_all();

    assert!(!frontend.status_for(1).unwrap().is_good());
    assert!(frontend.status_for(2).unwrap().is_good());
}

#[test]
fn test_inquiry_is_emulated() {
    let backend = MockBackend::new();
    let device = device_with(&backend, DeviceConfig::named("disk"));
    let frontend = MockFrontend::new();

    submit(&device, request(0, 1, inquiry(255), &frontend)).unwrap();
    dispatch_ready(&device);

    assert!(backend.dispatched().is_empty());
    let data = frontend.data_in_for(1).unwrap();
    assert_eq!(data.len(), INQUIRY_DATA_LEN);
    assert_eq!(&data[8..14], b"TGTENG");
    assert!(frontend.status_for(1).unwrap().is_good());
}

#[test]
fn test_read_capacity_reports_device_geometry() {
    let backend = MockBackend::new();
    let device = device_with(&backend, DeviceConfig::named("disk"));
    let frontend = MockFrontend::new();

    submit(&device, request(0, 1, read_capacity10(), &frontend)).unwrap();
    dispatch_ready(&device);

    let data = frontend.data_in_for(1).unwrap();
    let last = (MockBackend::DEFAULT_CAPACITY - 1) as u32;
    assert_eq!(&data[..4], &last.to_be_bytes());
    assert_eq!(&data[4..], &512u32.to_be_bytes());
}

#[test]
fn test_zero_length_command_completes_without_dispatch() {
    let backend = MockBackend::new();
    let device = device_with(&backend, DeviceConfig::named("disk"));
    let frontend = MockFrontend::new();

    let command = submit(&device, request(0, 1, test_unit_ready(), &frontend)).unwrap();
    assert!(command.tasks().is_empty());
    assert!(command.is_released());
    assert_eq!(dispatch_ready(&device), 0);
    assert!(frontend.status_for(1).unwrap().is_good());
}
