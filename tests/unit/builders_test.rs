//! Tests for builder modules

use prometheus_device_scheduler::builders::build_scheduler;
use prometheus_device_scheduler::config::SchedulerConfig;
use prometheus_device_scheduler::core::{DeviceKind, SchedulerError};

#[test]
fn test_build_scheduler_defaults() {
    let scheduler = build_scheduler(&SchedulerConfig::new().with_worker_count(2)).unwrap();
    assert!(!scheduler.is_running());
    assert_eq!(scheduler.devices().list_devices().len(), 1);
    assert_eq!(scheduler.stats().total_submitted, 0);
}

#[test]
fn test_build_scheduler_with_devices() {
    let cfg = SchedulerConfig::new()
        .with_worker_count(1)
        .with_device(0, DeviceKind::Cuda, "cuda:0", 1 << 30)
        .with_device(1, DeviceKind::OpenCl, "ocl:0", 1 << 28);
    let scheduler = build_scheduler(&cfg).unwrap();

    let kinds: Vec<DeviceKind> = scheduler.devices().list_devices().iter().map(|d| d.kind).collect();
    assert_eq!(kinds, vec![DeviceKind::Cuda, DeviceKind::OpenCl]);
    scheduler.start().unwrap();
    assert!(scheduler.is_running());
    scheduler.stop();
    assert!(!scheduler.is_running());
}

#[test]
fn test_build_scheduler_invalid() {
    let cfg = SchedulerConfig::new().with_worker_count(0);
    assert!(matches!(build_scheduler(&cfg).err(), Some(SchedulerError::InvalidTask(_))));
}
