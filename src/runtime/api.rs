//! API-facing request/response models.
//!
//! Serializable counterparts of [`Task`] and [`TaskSnapshot`] for callers
//! that speak JSON, e.g. an HTTP or IPC front-end. Submissions reference a
//! processor registered on the scheduler by name.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::{
    DeviceId, Metadata, Scheduler, SchedulerError, SchedulerStats, Strategy, Task, TaskId, TaskSnapshot,
    TaskStatus,
};

/// Task submission payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskSubmission {
    /// Task identifier; generated when absent.
    pub task_id: Option<TaskId>,
    /// Display name.
    pub name: String,
    /// Registered processor name.
    pub processor: String,
    /// Priority; higher runs first.
    pub priority: i32,
    /// Processor input.
    pub input: Value,
    /// Free-form metadata.
    pub metadata: Metadata,
    /// Strategy override.
    pub strategy: Option<Strategy>,
    /// Device to try first.
    pub preferred_device: Option<DeviceId>,
    /// Bytes to reserve while running.
    pub memory_estimate: u64,
}

impl TaskSubmission {
    /// Convert into a [`Task`] bound to the named processor.
    #[must_use]
    pub fn into_task(self) -> Task {
        let mut task = Task::new(self.name)
            .with_processor_name(self.processor)
            .with_priority(self.priority)
            .with_input(self.input)
            .with_memory_estimate(self.memory_estimate);
        task.metadata = self.metadata;
        if let Some(id) = self.task_id {
            task = task.with_id(id);
        }
        if let Some(strategy) = self.strategy {
            task = task.with_strategy(strategy);
        }
        if let Some(device) = self.preferred_device {
            task = task.with_preferred_device(device);
        }
        task
    }
}

/// Task status response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatusResponse {
    /// Task identifier.
    pub task_id: TaskId,
    /// Current status.
    pub status: TaskStatus,
    /// Failure reason for failed tasks.
    pub reason: Option<String>,
    /// Result for completed tasks.
    pub result: Option<Value>,
    /// Devices the task ran on.
    pub devices: Vec<DeviceId>,
    /// Completion fraction in `[0, 1]`.
    pub progress: f64,
}

impl From<TaskSnapshot> for TaskStatusResponse {
    fn from(snapshot: TaskSnapshot) -> Self {
        Self {
            task_id: snapshot.id,
            status: snapshot.status,
            reason: snapshot.error.map(|e| e.to_string()),
            result: snapshot.result,
            devices: snapshot.devices,
            progress: snapshot.progress,
        }
    }
}

/// Health response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Health {
    /// Workers running and at least one device available.
    pub ok: bool,
    /// Devices accepting work.
    pub available_devices: usize,
    /// Tasks waiting to run.
    pub pending: usize,
    /// Tasks executing.
    pub running: usize,
}

/// Submit a task described by a submission payload.
///
/// # Errors
///
/// Whatever [`Scheduler::submit`] rejects.
pub fn submit_task(scheduler: &Scheduler, req: TaskSubmission) -> Result<TaskStatusResponse, SchedulerError> {
    let id = scheduler.submit(req.into_task())?;
    scheduler
        .status(&id)
        .map(TaskStatusResponse::from)
        .ok_or(SchedulerError::TaskNotFound(id))
}

/// Status of a task.
///
/// # Errors
///
/// `TaskNotFound` for unknown or trimmed ids.
pub fn task_status(scheduler: &Scheduler, task_id: &str) -> Result<TaskStatusResponse, SchedulerError> {
    scheduler
        .status(task_id)
        .map(TaskStatusResponse::from)
        .ok_or_else(|| SchedulerError::TaskNotFound(task_id.to_owned()))
}

/// Scheduler statistics.
#[must_use]
pub fn stats(scheduler: &Scheduler) -> SchedulerStats {
    scheduler.stats()
}

/// Return a health payload.
#[must_use]
pub fn health(scheduler: &Scheduler) -> Health {
    let stats = scheduler.stats();
    let available_devices = scheduler.devices().available_count();
    Health {
        ok: scheduler.is_running() && available_devices > 0,
        available_devices,
        pending: stats.pending,
        running: stats.running,
    }
}
