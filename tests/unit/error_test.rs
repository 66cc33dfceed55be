//! Tests for error types

use prometheus_device_scheduler::core::SchedulerError;

#[test]
fn test_queue_full_error() {
    let err = SchedulerError::QueueFull("max queue depth 10 reached".to_string());
    assert_eq!(format!("{err}"), "queue full: max queue depth 10 reached");
}

#[test]
fn test_no_device_error() {
    let err = SchedulerError::NoDeviceAvailable { required_bytes: 2048 };
    assert_eq!(format!("{err}"), "no device available with 2048 free bytes");
}

#[test]
fn test_allocation_denied_error() {
    let err = SchedulerError::AllocationDenied { device_id: 3, requested_bytes: 512 };
    assert_eq!(format!("{err}"), "allocation denied on device 3: 512 bytes");
}

#[test]
fn test_shutting_down_error() {
    assert_eq!(SchedulerError::ShuttingDown.to_string(), "scheduler is shutting down");
    assert!(!SchedulerError::ShuttingDown.is_recoverable());
}

#[test]
fn test_error_json_round_trip() {
    let err = SchedulerError::TaskNotFound("t-9".into());
    let json = serde_json::to_string(&err).unwrap();
    let back: SchedulerError = serde_json::from_str(&json).unwrap();
    assert_eq!(back, err);
}

#[test]
fn test_anyhow_interop() {
    fn fallible() -> prometheus_device_scheduler::core::AppResult<()> {
        let timed_out: Result<(), SchedulerError> = Err(SchedulerError::Timeout);
        timed_out?;
        Ok(())
    }
    let err = fallible().unwrap_err();
    assert_eq!(err.downcast_ref::<SchedulerError>(), Some(&SchedulerError::Timeout));
}
