//! Task lifecycle audit trail.
//!
//! The scheduler emits one [`AuditEvent`] per lifecycle transition to an
//! optional [`AuditSink`]. Sinks must not block; they are called from
//! submitters and worker threads.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use crossbeam_channel::Sender;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::task::TaskSnapshot;
use crate::util::clock::now_ms;

/// Lifecycle transition being recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    /// Accepted and queued.
    Submitted,
    /// Picked up by a worker.
    Started,
    /// Finished with a result.
    Completed,
    /// Finished with an error.
    Failed,
    /// Cancelled before it ran.
    Cancelled,
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Submitted => "submitted",
            Self::Started => "started",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Audit event structure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Event identifier.
    pub event_id: String,
    /// Related task identifier.
    pub task_id: String,
    /// Transition recorded.
    pub action: AuditAction,
    /// Timestamp milliseconds.
    pub created_at_ms: u64,
    /// Additional context, e.g. the error of a failed task.
    pub detail: Option<String>,
}

/// Destination for audit events.
pub trait AuditSink: Send + Sync {
    /// Record an audit event.
    fn record(&self, event: AuditEvent);
}

/// Bounded in-memory sink; clones share one buffer.
#[derive(Clone)]
pub struct InMemoryAuditSink {
    events: Arc<Mutex<VecDeque<AuditEvent>>>,
    max_events: usize,
}

impl InMemoryAuditSink {
    /// Create a sink keeping the newest `max_events` events.
    #[must_use]
    pub fn new(max_events: usize) -> Self {
        Self {
            events: Arc::new(Mutex::new(VecDeque::with_capacity(max_events.min(1024)))),
            max_events,
        }
    }

    /// Snapshot of stored events, oldest first.
    #[must_use]
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().iter().cloned().collect()
    }

    /// Stored events for one task, oldest first.
    #[must_use]
    pub fn events_for(&self, task_id: &str) -> Vec<AuditEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.task_id == task_id)
            .cloned()
            .collect()
    }
}

impl AuditSink for InMemoryAuditSink {
    fn record(&self, event: AuditEvent) {
        let mut events = self.events.lock();
        if events.len() >= self.max_events {
            events.pop_front();
        }
        events.push_back(event);
    }
}

/// Forwards events to a channel; events are dropped when the receiver is gone or full.
pub struct ChannelAuditSink {
    tx: Sender<AuditEvent>,
}

impl ChannelAuditSink {
    /// Wrap a sender.
    #[must_use]
    pub const fn new(tx: Sender<AuditEvent>) -> Self {
        Self { tx }
    }
}

impl AuditSink for ChannelAuditSink {
    fn record(&self, event: AuditEvent) {
        let _ = self.tx.try_send(event);
    }
}

/// Build an event for a task transition.
pub fn build_audit_event(
    task_id: impl Into<String>,
    action: AuditAction,
    detail: Option<String>,
) -> AuditEvent {
    AuditEvent {
        event_id: Uuid::new_v4().to_string(),
        task_id: task_id.into(),
        action,
        created_at_ms: now_ms(),
        detail,
    }
}

/// Build the event matching a terminal snapshot.
#[must_use]
pub fn terminal_event(snapshot: &TaskSnapshot) -> Option<AuditEvent> {
    use crate::core::task::TaskStatus;

    let action = match snapshot.status {
        TaskStatus::Completed => AuditAction::Completed,
        TaskStatus::Failed => AuditAction::Failed,
        TaskStatus::Cancelled => AuditAction::Cancelled,
        TaskStatus::Pending | TaskStatus::Running => return None,
    };
    let detail = snapshot.error.as_ref().map(ToString::to_string);
    Some(build_audit_event(snapshot.id.clone(), action, detail))
}
