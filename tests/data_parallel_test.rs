//! Integration tests for data-parallel dispatch through the scheduler.
//!
//! - Results come back in input order whichever chunk finishes first
//! - A failing chunk fails the whole task
//! - Chunks land on distinct devices and release their reservations

use std::collections::HashSet;
use std::time::Duration;

use prometheus_device_scheduler::builders::build_scheduler;
use prometheus_device_scheduler::config::SchedulerConfig;
use prometheus_device_scheduler::core::{
    DeviceKind, Metadata, ProcessorError, Scheduler, SchedulerError, Strategy, Task, TaskStatus,
};
use serde_json::{json, Value};

const WAIT: Duration = Duration::from_secs(10);

fn two_gpu_scheduler() -> Scheduler {
    let scheduler = build_scheduler(
        &SchedulerConfig::new()
            .with_worker_count(2)
            .with_device(0, DeviceKind::Cuda, "cuda:0", 1 << 30)
            .with_device(1, DeviceKind::Cuda, "cuda:1", 1 << 30),
    )
    .unwrap();
    scheduler.start().unwrap();
    scheduler
}

/// Uppercases every string; the first chunk is slowed down so it finishes last.
fn shout(input: Value, meta: &Metadata) -> Result<Value, ProcessorError> {
    if meta.get("chunk_index") == Some(&json!(0)) {
        std::thread::sleep(Duration::from_millis(100));
    }
    let items = input.as_array().ok_or("expected array")?;
    Ok(Value::Array(
        items
            .iter()
            .map(|v| json!(v.as_str().unwrap_or_default().to_uppercase()))
            .collect(),
    ))
}

#[test]
fn test_results_keep_input_order() {
    let scheduler = two_gpu_scheduler();
    let id = scheduler
        .submit(
            Task::new("shout")
                .with_strategy(Strategy::DataParallel)
                .with_memory_estimate(1 << 20)
                .with_input(json!(["a", "b", "c", "d"]))
                .with_processor(shout),
        )
        .unwrap();

    let done = scheduler.wait(&id, WAIT).unwrap();
    assert_eq!(done.status, TaskStatus::Completed);
    assert_eq!(done.result, Some(json!(["A", "B", "C", "D"])));
    assert_eq!(done.strategy, Strategy::DataParallel);

    let devices: HashSet<u32> = done.devices.iter().copied().collect();
    assert_eq!(devices.len(), 2, "chunks should run on distinct devices");
    for device in 0..2 {
        assert_eq!(scheduler.ledger().usage(device).unwrap().reservation_count, 0);
    }
    scheduler.stop();
    println!("=== test_results_keep_input_order PASSED ===");
}

#[test]
fn test_scalar_chunk_results_are_appended() {
    let scheduler = two_gpu_scheduler();
    let id = scheduler
        .submit(
            Task::new("count")
                .with_metadata("strategy", json!("data_parallel"))
                .with_input(json!([1, 2, 3]))
                .with_processor(|input: Value, _meta: &Metadata| -> Result<Value, ProcessorError> {
                    Ok(json!(input.as_array().map_or(0, Vec::len)))
                }),
        )
        .unwrap();

    let done = scheduler.wait(&id, WAIT).unwrap();
    // Three items over two devices: chunks of two and one.
    assert_eq!(done.result, Some(json!([2, 1])));
    scheduler.stop();
}

#[test]
fn test_failing_chunk_fails_task() {
    let scheduler = two_gpu_scheduler();
    let id = scheduler
        .submit(
            Task::new("partial")
                .with_strategy(Strategy::DataParallel)
                .with_input(json!([1, 2, 3, 4]))
                .with_processor(|input: Value, meta: &Metadata| -> Result<Value, ProcessorError> {
                    if meta["chunk_index"] == json!(1) {
                        return Err(ProcessorError::new("corrupt frame"));
                    }
                    Ok(input)
                }),
        )
        .unwrap();

    let done = scheduler.wait(&id, WAIT).unwrap();
    assert_eq!(done.status, TaskStatus::Failed);
    assert!(done.result.is_none());
    assert_eq!(done.error, Some(SchedulerError::Processor("corrupt frame".into())));
    scheduler.stop();
}

#[test]
fn test_default_strategy_from_config() {
    let scheduler = build_scheduler(
        &SchedulerConfig::new()
            .with_worker_count(1)
            .with_default_strategy(Strategy::DataParallel)
            .with_device(0, DeviceKind::Cuda, "cuda:0", 1 << 30)
            .with_device(1, DeviceKind::Metal, "metal:0", 1 << 30),
    )
    .unwrap();

    let err = scheduler
        .submit(Task::new("scalar").with_input(json!(3)).with_processor(shout))
        .unwrap_err();
    assert!(matches!(err, SchedulerError::InvalidTask(_)));

    let id = scheduler
        .submit(
            Task::new("override")
                .with_strategy(Strategy::SingleDevice)
                .with_input(json!(3))
                .with_processor(|input: Value, _meta: &Metadata| -> Result<Value, ProcessorError> { Ok(input) }),
        )
        .unwrap();
    assert_eq!(scheduler.status(&id).unwrap().strategy, Strategy::SingleDevice);
}

#[test]
fn test_data_parallel_default_on_one_device_runs_single() {
    let scheduler = build_scheduler(
        &SchedulerConfig::new()
            .with_worker_count(1)
            .with_default_strategy(Strategy::DataParallel)
            .with_device(0, DeviceKind::Cuda, "cuda:0", 1 << 30),
    )
    .unwrap();
    scheduler.start().unwrap();
    let count = |input: Value, _meta: &Metadata| -> Result<Value, ProcessorError> {
        Ok(json!(input.as_array().map_or(0, Vec::len)))
    };

    // Scalar input is accepted under the degraded default.
    let scalar = scheduler
        .submit(Task::new("scalar").with_input(json!(3)).with_processor(
            |input: Value, _meta: &Metadata| -> Result<Value, ProcessorError> { Ok(input) },
        ))
        .unwrap();
    let done = scheduler.wait(&scalar, WAIT).unwrap();
    assert_eq!(done.strategy, Strategy::SingleDevice);
    assert_eq!(done.result, Some(json!(3)));

    // Array input reaches the processor whole, result unwrapped.
    let whole = scheduler
        .submit(Task::new("count").with_input(json!([1, 2, 3])).with_processor(count))
        .unwrap();
    let done = scheduler.wait(&whole, WAIT).unwrap();
    assert_eq!(done.status, TaskStatus::Completed);
    assert_eq!(done.strategy, Strategy::SingleDevice);
    assert_eq!(done.result, Some(json!(3)));
    assert_eq!(done.devices, vec![0]);
    scheduler.stop();
    println!("=== test_data_parallel_default_on_one_device_runs_single PASSED ===");
}

#[test]
fn test_host_cpu_fallback_ignores_data_parallel_default() {
    let scheduler = build_scheduler(
        &SchedulerConfig::new()
            .with_worker_count(1)
            .with_default_strategy(Strategy::DataParallel),
    )
    .unwrap();
    scheduler.start().unwrap();

    let id = scheduler
        .submit(Task::new("scalar").with_input(json!("clip.mp4")).with_processor(shout_scalar))
        .unwrap();
    let done = scheduler.wait(&id, WAIT).unwrap();
    assert_eq!(done.strategy, Strategy::SingleDevice);
    assert_eq!(done.result, Some(json!("CLIP.MP4")));
    scheduler.stop();
}

#[test]
fn test_explicit_data_parallel_after_device_loss_runs_whole() {
    let scheduler = two_gpu_scheduler();
    scheduler.devices().set_available(1, false);

    let id = scheduler
        .submit(
            Task::new("explicit")
                .with_strategy(Strategy::DataParallel)
                .with_input(json!(["x", "y"]))
                .with_processor(shout),
        )
        .unwrap();
    let done = scheduler.wait(&id, WAIT).unwrap();
    assert_eq!(done.strategy, Strategy::DataParallel);
    assert_eq!(done.result, Some(json!(["X", "Y"])));
    assert_eq!(done.devices, vec![0]);
    scheduler.stop();
}

fn shout_scalar(input: Value, _meta: &Metadata) -> Result<Value, ProcessorError> {
    Ok(json!(input.as_str().unwrap_or_default().to_uppercase()))
}
