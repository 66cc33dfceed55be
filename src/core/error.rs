//! Error types for scheduler operations.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::device::DeviceId;

/// Errors produced by scheduler components.
///
/// `NoDeviceAvailable`, `AllocationDenied` and `Processor` are recorded on the
/// failing task and surfaced through its snapshot. `InvalidTask`, `QueueFull`
/// and `ShuttingDown` are returned synchronously from submission.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum SchedulerError {
    /// No available device satisfied the selection constraints.
    #[error("no device available with {required_bytes} free bytes")]
    NoDeviceAvailable {
        /// Bytes the task asked for.
        required_bytes: u64,
    },
    /// The memory ledger refused the reservation even after one eviction pass.
    #[error("allocation denied on device {device_id}: {requested_bytes} bytes")]
    AllocationDenied {
        /// Device the reservation targeted.
        device_id: DeviceId,
        /// Bytes requested.
        requested_bytes: u64,
    },
    /// The task's own processor failed or panicked.
    #[error("processor error: {0}")]
    Processor(String),
    /// Malformed submission, rejected before enqueue.
    #[error("invalid task: {0}")]
    InvalidTask(String),
    /// Queue is at its configured depth.
    #[error("queue full: {0}")]
    QueueFull(String),
    /// The scheduler is stopping and accepts no new work.
    #[error("scheduler is shutting down")]
    ShuttingDown,
    /// A wait did not observe a terminal state in time.
    #[error("operation timed out")]
    Timeout,
    /// No task with this id is known.
    #[error("task not found: {0}")]
    TaskNotFound(String),
    /// Internal failure (thread spawn, runtime join, ...).
    #[error("internal error: {0}")]
    Internal(String),
}

impl SchedulerError {
    /// Whether a caller may reasonably retry the same task later.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::NoDeviceAvailable { .. } | Self::AllocationDenied { .. } | Self::QueueFull(_)
        )
    }
}

/// Application-facing result using anyhow for higher-level contexts.
pub type AppResult<T> = Result<T, anyhow::Error>;
