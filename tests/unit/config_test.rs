//! Tests for configuration validation

use prometheus_device_scheduler::config::SchedulerConfig;
use prometheus_device_scheduler::core::{DeviceKind, Strategy};

#[test]
fn test_scheduler_config_validation() {
    let valid = SchedulerConfig::new()
        .with_worker_count(4)
        .with_max_queue_depth(50)
        .with_device(0, DeviceKind::Cuda, "cuda:0", 1 << 30);
    assert!(valid.validate().is_ok());
}

#[test]
fn test_scheduler_config_invalid_queue_depth() {
    let invalid = SchedulerConfig::new().with_max_queue_depth(0);
    assert!(invalid.validate().is_err());
}

#[test]
fn test_scheduler_config_invalid_stack() {
    let invalid = SchedulerConfig::new().with_thread_stack_size(1024);
    assert!(invalid.validate().unwrap_err().contains("thread_stack_size"));
}

#[test]
fn test_scheduler_config_zero_memory_device() {
    let invalid = SchedulerConfig::new().with_device(2, DeviceKind::Metal, "metal:0", 0);
    assert!(invalid.validate().unwrap_err().contains("zero memory"));
}

#[test]
fn test_scheduler_config_from_json() {
    let json = r#"{
        "worker_count": 2,
        "max_queue_depth": 100,
        "default_strategy": "data_parallel",
        "devices": [
            { "id": 0, "kind": "cuda", "name": "cuda:0", "memory_total_bytes": 1073741824 },
            { "id": 1, "kind": "cuda", "name": "cuda:1", "memory_total_bytes": 1073741824 }
        ]
    }"#;

    let cfg = SchedulerConfig::from_json_str(json).unwrap();
    assert_eq!(cfg.worker_count, 2);
    assert_eq!(cfg.default_strategy, Some(Strategy::DataParallel));
    assert_eq!(cfg.devices.len(), 2);
    // Unspecified fields keep their defaults.
    assert_eq!(cfg.retention_limit, SchedulerConfig::default().retention_limit);
}

#[test]
fn test_scheduler_config_from_json_invalid() {
    assert!(SchedulerConfig::from_json_str("{ not json").unwrap_err().starts_with("parse error"));
    assert!(SchedulerConfig::from_json_str(r#"{"worker_count": 0}"#).is_err());
    assert!(SchedulerConfig::from_json_str(r#"{"default_strategy": "sharded"}"#).is_err());
}
