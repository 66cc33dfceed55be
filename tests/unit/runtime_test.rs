//! Tests for the JSON-facing API helpers

use std::sync::Arc;
use std::time::Duration;

use prometheus_device_scheduler::builders::build_scheduler;
use prometheus_device_scheduler::config::SchedulerConfig;
use prometheus_device_scheduler::core::{Metadata, ProcessorError, SchedulerError, TaskStatus};
use prometheus_device_scheduler::runtime::{health, submit_task, task_status, TaskStatusResponse, TaskSubmission};
use serde_json::{json, Value};

fn double(input: Value, _meta: &Metadata) -> Result<Value, ProcessorError> {
    let n = input.as_i64().ok_or("expected integer")?;
    Ok(json!(n * 2))
}

#[test]
fn test_submission_from_json() {
    let req: TaskSubmission = serde_json::from_value(json!({
        "name": "double",
        "processor": "double",
        "priority": 3,
        "input": 21,
        "strategy": "single_device"
    }))
    .unwrap();
    assert_eq!(req.priority, 3);
    assert!(req.task_id.is_none());
    assert_eq!(req.memory_estimate, 0);
}

#[test]
fn test_submit_and_poll_status() {
    let scheduler = build_scheduler(&SchedulerConfig::new().with_worker_count(1)).unwrap();
    scheduler.register_processor("double", Arc::new(double));
    scheduler.start().unwrap();

    let req = TaskSubmission {
        task_id: Some("api-1".into()),
        name: "double".into(),
        processor: "double".into(),
        input: json!(21),
        ..TaskSubmission::default()
    };
    let accepted = submit_task(&scheduler, req).unwrap();
    assert_eq!(accepted.task_id, "api-1");

    scheduler.wait("api-1", Duration::from_secs(5)).unwrap();
    let done: TaskStatusResponse = task_status(&scheduler, "api-1").unwrap();
    assert_eq!(done.status, TaskStatus::Completed);
    assert_eq!(done.result, Some(json!(42)));
    assert!((done.progress - 1.0).abs() < f64::EPSILON);
    assert!(done.reason.is_none());
    assert_eq!(done.devices.len(), 1);
    scheduler.stop();
}

#[test]
fn test_unknown_processor_rejected() {
    let scheduler = build_scheduler(&SchedulerConfig::new().with_worker_count(1)).unwrap();
    let req = TaskSubmission {
        name: "ghost".into(),
        processor: "missing".into(),
        ..TaskSubmission::default()
    };
    assert!(matches!(submit_task(&scheduler, req), Err(SchedulerError::InvalidTask(_))));
    assert!(matches!(task_status(&scheduler, "nope"), Err(SchedulerError::TaskNotFound(_))));
}

#[test]
fn test_health_reflects_lifecycle() {
    let scheduler = build_scheduler(&SchedulerConfig::new().with_worker_count(1)).unwrap();
    assert!(!health(&scheduler).ok);

    scheduler.start().unwrap();
    let running = health(&scheduler);
    assert!(running.ok);
    assert_eq!(running.available_devices, 1);

    scheduler.devices().set_available(0, false);
    assert!(!health(&scheduler).ok);
    scheduler.stop();
}
