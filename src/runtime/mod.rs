//! API surface and runtime adapters.

pub mod api;
#[cfg(feature = "tokio-runtime")]
pub mod monitor;

pub use api::{Health, TaskStatusResponse, TaskSubmission, health, submit_task, task_status};
#[cfg(feature = "tokio-runtime")]
pub use monitor::{DeviceSample, MonitorHandle, TelemetryProbe, apply_samples, spawn_telemetry_monitor};
