//! Task description, lifecycle states, and the snapshot the registry serves.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::device::DeviceId;
use crate::core::processor::{Metadata, Processor, ProcessorError, ProcessorRef};
use crate::core::strategy::Strategy;
use crate::core::SchedulerError;
use crate::util::clock;

/// Task identifier.
pub type TaskId = String;

/// Callback fired once when a task reaches a terminal state.
pub type CompletionCallback = Arc<dyn Fn(&TaskSnapshot) + Send + Sync>;

/// Lifecycle state of a task.
///
/// `Pending -> Running -> {Completed | Failed}` and `Pending -> Cancelled`.
/// The last three are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Queued, not yet picked up by a worker.
    Pending,
    /// Owned by a worker and executing.
    Running,
    /// Processor returned a result.
    Completed,
    /// Dispatch or processor failed.
    Failed,
    /// Cancelled before it started.
    Cancelled,
}

impl TaskStatus {
    /// Whether no further transition is possible.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// A unit of work submitted to the scheduler.
///
/// Built with [`Task::new`] and the `with_*` setters:
///
/// ```rust,ignore
/// let task = Task::new("upscale-clip-7")
///     .with_priority(5)
///     .with_memory_estimate(2 << 30)
///     .with_input(json!(["frame-0", "frame-1"]))
///     .with_processor(|input, _meta| Ok(input));
/// ```
#[derive(Clone, Default)]
pub struct Task {
    /// Unique id; generated at submission when empty.
    pub id: TaskId,
    /// Display name.
    pub name: String,
    /// Higher values are served first.
    pub priority: i32,
    /// Inline processor.
    pub processor: Option<ProcessorRef>,
    /// Name of a registered processor, used when `processor` is unset.
    pub processor_name: Option<String>,
    /// Opaque input handed to the processor.
    pub input: Value,
    /// Free-form metadata, also read for the `strategy` override.
    pub metadata: Metadata,
    /// Device to try first.
    pub preferred_device: Option<DeviceId>,
    /// Bytes to reserve on the executing device.
    pub memory_estimate: u64,
    /// Fired once when the task reaches a terminal state.
    pub on_complete: Option<CompletionCallback>,
}

impl Task {
    /// Create a task with a name and default settings.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Set an explicit id.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<TaskId>) -> Self {
        self.id = id.into();
        self
    }

    /// Set the priority.
    #[must_use]
    pub const fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Use a closure as the processor.
    #[must_use]
    pub fn with_processor<F>(mut self, processor: F) -> Self
    where
        F: Fn(Value, &Metadata) -> Result<Value, ProcessorError> + Send + Sync + 'static,
    {
        self.processor = Some(Arc::new(processor));
        self
    }

    /// Use a shared processor.
    #[must_use]
    pub fn with_processor_ref(mut self, processor: ProcessorRef) -> Self {
        self.processor = Some(processor);
        self
    }

    /// Use a processor registered under `name`.
    #[must_use]
    pub fn with_processor_name(mut self, name: impl Into<String>) -> Self {
        self.processor_name = Some(name.into());
        self
    }

    /// Set the input.
    #[must_use]
    pub fn with_input(mut self, input: Value) -> Self {
        self.input = input;
        self
    }

    /// Insert one metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Override the dispatch strategy for this task.
    #[must_use]
    pub fn with_strategy(self, strategy: Strategy) -> Self {
        self.with_metadata(
            crate::core::processor::meta_keys::STRATEGY,
            Value::from(strategy.as_str()),
        )
    }

    /// Prefer a device when it is available and has room.
    #[must_use]
    pub const fn with_preferred_device(mut self, device: DeviceId) -> Self {
        self.preferred_device = Some(device);
        self
    }

    /// Bytes to reserve while running.
    #[must_use]
    pub const fn with_memory_estimate(mut self, bytes: u64) -> Self {
        self.memory_estimate = bytes;
        self
    }

    /// Callback fired once on the terminal transition.
    #[must_use]
    pub fn on_complete<F>(mut self, callback: F) -> Self
    where
        F: Fn(&TaskSnapshot) + Send + Sync + 'static,
    {
        self.on_complete = Some(Arc::new(callback));
        self
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("has_processor", &self.processor.is_some())
            .field("processor_name", &self.processor_name)
            .field("preferred_device", &self.preferred_device)
            .field("memory_estimate", &self.memory_estimate)
            .finish_non_exhaustive()
    }
}

/// Everything a dispatch strategy needs to run one task.
pub struct DispatchJob {
    /// Owning task id.
    pub task_id: TaskId,
    /// Work to run.
    pub processor: ProcessorRef,
    /// Processor input.
    pub input: Value,
    /// Processor metadata, before device keys are injected.
    pub metadata: Metadata,
    /// Device to try first.
    pub preferred_device: Option<DeviceId>,
    /// Bytes to reserve.
    pub memory_estimate: u64,
}

impl DispatchJob {
    /// Run the processor behind a panic boundary.
    ///
    /// A processor error or panic becomes [`SchedulerError::Processor`].
    pub(crate) fn invoke(
        processor: &dyn Processor,
        input: Value,
        metadata: &Metadata,
    ) -> Result<Value, SchedulerError> {
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            processor.process(input, metadata)
        }));
        match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(SchedulerError::Processor(e.to_string())),
            Err(panic) => Err(SchedulerError::Processor(panic_message(panic.as_ref()))),
        }
    }
}

/// Human-readable message from a panic payload.
pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .map_or_else(|| "processor panicked".to_string(), |msg| format!("processor panicked: {msg}"))
}

/// Point-in-time view of a task's lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    /// Task id.
    pub id: TaskId,
    /// Display name.
    pub name: String,
    /// Priority.
    pub priority: i32,
    /// Current state.
    pub status: TaskStatus,
    /// Strategy the task was resolved to at submission.
    pub strategy: Strategy,
    /// Submission time, ms since epoch.
    pub created_at_ms: u64,
    /// When a worker started it.
    pub started_at_ms: Option<u64>,
    /// When it reached a terminal state.
    pub ended_at_ms: Option<u64>,
    /// Devices the execution was bound to.
    pub devices: Vec<DeviceId>,
    /// Failure cause for `Failed` tasks.
    pub error: Option<SchedulerError>,
    /// Processor result for `Completed` tasks.
    pub result: Option<Value>,
    /// A cancel arrived while the task was running.
    pub cancel_requested: bool,
    /// Latest reported completion fraction in `[0, 1]`.
    #[serde(default)]
    pub progress: f64,
}

impl TaskSnapshot {
    /// Fresh `Pending` snapshot.
    pub(crate) fn pending(id: TaskId, name: String, priority: i32, strategy: Strategy) -> Self {
        Self {
            id,
            name,
            priority,
            status: TaskStatus::Pending,
            strategy,
            created_at_ms: clock::now_ms(),
            started_at_ms: None,
            ended_at_ms: None,
            devices: Vec::new(),
            error: None,
            result: None,
            cancel_requested: false,
            progress: 0.0,
        }
    }

    /// Seconds from submission to the terminal transition.
    #[must_use]
    pub fn latency_secs(&self) -> Option<f64> {
        self.ended_at_ms
            .map(|end| clock::elapsed_secs(self.created_at_ms, end))
    }
}
