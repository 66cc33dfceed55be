//! Authoritative task lifecycle store.
//!
//! Every status transition goes through here, so concurrent cancels and
//! worker starts are arbitrated by a single lock. Terminal snapshots are kept
//! up to a retention limit; aggregate totals survive trimming.
//!
//! Completion callbacks are held here too. Whichever caller performs the
//! terminal transition takes the callback, so it fires once even if the
//! snapshot itself has already been trimmed.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::core::device::DeviceId;
use crate::core::progress::ProgressSink;
use crate::core::task::{CompletionCallback, TaskId, TaskSnapshot, TaskStatus};
use crate::core::SchedulerError;
use crate::util::clock;

/// How a running task ended.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    /// Processor returned a result.
    Completed {
        /// The result.
        result: Value,
        /// Devices the execution used.
        devices: Vec<DeviceId>,
    },
    /// Dispatch or processing failed.
    Failed {
        /// Failure cause.
        error: SchedulerError,
        /// Devices the execution used, if any were bound.
        devices: Vec<DeviceId>,
    },
}

/// Result of a cancel request.
#[derive(Debug, Clone, PartialEq)]
pub enum CancelOutcome {
    /// The task was pending and is now cancelled.
    Cancelled(TaskSnapshot),
    /// The task is running; the request was recorded but it will run to completion.
    RequestedWhileRunning,
    /// The task had already finished.
    AlreadyTerminal(TaskStatus),
    /// No such task.
    NotFound,
}

/// Lifetime counters, unaffected by retention trimming.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryTotals {
    /// Tasks accepted.
    pub submitted: u64,
    /// Tasks completed.
    pub completed: u64,
    /// Tasks failed.
    pub failed: u64,
    /// Tasks cancelled.
    pub cancelled: u64,
    /// Sum of submission-to-completion latency over completed tasks, ms.
    pub completed_latency_ms: u64,
}

#[derive(Default)]
struct RegistryState {
    tasks: HashMap<TaskId, TaskSnapshot>,
    callbacks: HashMap<TaskId, CompletionCallback>,
    terminal_order: VecDeque<TaskId>,
    totals: RegistryTotals,
    pending: usize,
    running: usize,
}

impl RegistryState {
    fn retire(&mut self, id: &str, retention_limit: usize) {
        self.terminal_order.push_back(id.to_owned());
        while self.terminal_order.len() > retention_limit {
            if let Some(oldest) = self.terminal_order.pop_front() {
                self.tasks.remove(&oldest);
            }
        }
    }
}

/// Thread-safe map of task id to lifecycle snapshot.
pub struct TaskRegistry {
    state: RwLock<RegistryState>,
    retention_limit: usize,
    generation: Mutex<u64>,
    changed: Condvar,
}

impl TaskRegistry {
    /// Registry keeping at most `retention_limit` terminal snapshots.
    #[must_use]
    pub fn new(retention_limit: usize) -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
            retention_limit: retention_limit.max(1),
            generation: Mutex::new(0),
            changed: Condvar::new(),
        }
    }

    fn notify(&self) {
        let mut generation = self.generation.lock();
        *generation = generation.wrapping_add(1);
        self.changed.notify_all();
    }

    /// Record a new `Pending` task.
    ///
    /// # Errors
    ///
    /// `InvalidTask` if the id is already known.
    pub fn insert(&self, snapshot: TaskSnapshot) -> Result<(), SchedulerError> {
        self.insert_with_callback(snapshot, None)
    }

    /// Record a new `Pending` task together with its completion callback.
    ///
    /// # Errors
    ///
    /// `InvalidTask` if the id is already known.
    pub fn insert_with_callback(
        &self,
        snapshot: TaskSnapshot,
        on_complete: Option<CompletionCallback>,
    ) -> Result<(), SchedulerError> {
        let mut state = self.state.write();
        if state.tasks.contains_key(&snapshot.id) {
            return Err(SchedulerError::InvalidTask(format!(
                "duplicate task id `{}`",
                snapshot.id
            )));
        }
        state.totals.submitted += 1;
        state.pending += 1;
        if let Some(callback) = on_complete {
            state.callbacks.insert(snapshot.id.clone(), callback);
        }
        state.tasks.insert(snapshot.id.clone(), snapshot);
        Ok(())
    }

    /// Undo an [`TaskRegistry::insert`] whose enqueue failed.
    pub fn discard(&self, id: &str) {
        let mut state = self.state.write();
        if state
            .tasks
            .get(id)
            .is_some_and(|s| s.status == TaskStatus::Pending)
        {
            state.tasks.remove(id);
            state.callbacks.remove(id);
            state.totals.submitted -= 1;
            state.pending -= 1;
        }
    }

    /// Current snapshot of a task.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<TaskSnapshot> {
        self.state.read().tasks.get(id).cloned()
    }

    /// Move a task from `Pending` to `Running`.
    ///
    /// Returns `false` if the task is not pending, e.g. it was cancelled
    /// after being dequeued.
    pub fn try_start(&self, id: &str) -> bool {
        let started = {
            let mut state = self.state.write();
            let started = match state.tasks.get_mut(id) {
                Some(task) if task.status == TaskStatus::Pending => {
                    task.status = TaskStatus::Running;
                    task.started_at_ms = Some(clock::now_ms());
                    true
                }
                _ => false,
            };
            if started {
                state.pending -= 1;
                state.running += 1;
            }
            started
        };
        if started {
            self.notify();
        }
        started
    }

    /// Record the end of a running task and return its terminal snapshot.
    ///
    /// Returns `None` if the task is not running.
    pub fn finish(&self, id: &str, outcome: TaskOutcome) -> Option<TaskSnapshot> {
        let snapshot = {
            let mut state = self.state.write();
            let task = state.tasks.get_mut(id).filter(|t| t.status == TaskStatus::Running)?;
            let now = clock::now_ms();
            task.ended_at_ms = Some(now);
            let completed = match outcome {
                TaskOutcome::Completed { result, devices } => {
                    task.status = TaskStatus::Completed;
                    task.result = Some(result);
                    task.progress = 1.0;
                    task.devices = devices;
                    true
                }
                TaskOutcome::Failed { error, devices } => {
                    task.status = TaskStatus::Failed;
                    task.error = Some(error);
                    task.devices = devices;
                    false
                }
            };
            let latency_ms = now.saturating_sub(task.created_at_ms);
            let snapshot = task.clone();

            state.running -= 1;
            if completed {
                state.totals.completed += 1;
                state.totals.completed_latency_ms += latency_ms;
            } else {
                state.totals.failed += 1;
            }
            state.retire(id, self.retention_limit);
            snapshot
        };
        debug!(task_id = %id, status = %snapshot.status, "task finished");
        self.notify();
        Some(snapshot)
    }

    /// Cancel a pending task, or flag a running one.
    pub fn cancel(&self, id: &str) -> CancelOutcome {
        let outcome = {
            let mut state = self.state.write();
            let Some(task) = state.tasks.get_mut(id) else {
                return CancelOutcome::NotFound;
            };
            match task.status {
                TaskStatus::Pending => {
                    task.status = TaskStatus::Cancelled;
                    task.ended_at_ms = Some(clock::now_ms());
                    let snapshot = task.clone();
                    state.pending -= 1;
                    state.totals.cancelled += 1;
                    state.retire(id, self.retention_limit);
                    CancelOutcome::Cancelled(snapshot)
                }
                TaskStatus::Running => {
                    task.cancel_requested = true;
                    CancelOutcome::RequestedWhileRunning
                }
                status => CancelOutcome::AlreadyTerminal(status),
            }
        };
        if matches!(outcome, CancelOutcome::Cancelled(_)) {
            self.notify();
        }
        outcome
    }

    /// Take the completion callback of a task that just reached a terminal state.
    ///
    /// Only the caller that performed the terminal transition should call this.
    pub(crate) fn take_callback(&self, id: &str) -> Option<CompletionCallback> {
        self.state.write().callbacks.remove(id)
    }

    /// Record the latest progress of a running task.
    ///
    /// Returns `false` if the task is not running or `fraction` is NaN.
    pub fn report_progress(&self, id: &str, fraction: f64) -> bool {
        if fraction.is_nan() {
            return false;
        }
        let mut state = self.state.write();
        match state.tasks.get_mut(id) {
            Some(task) if task.status == TaskStatus::Running => {
                task.progress = fraction.clamp(0.0, 1.0);
                true
            }
            _ => false,
        }
    }

    /// Ids of every pending or running task, oldest submission first.
    #[must_use]
    pub fn active_ids(&self) -> Vec<TaskId> {
        let state = self.state.read();
        let mut active: Vec<&TaskSnapshot> = state.tasks.values().filter(|t| !t.status.is_terminal()).collect();
        active.sort_by(|a, b| a.created_at_ms.cmp(&b.created_at_ms).then_with(|| a.id.cmp(&b.id)));
        active.into_iter().map(|t| t.id.clone()).collect()
    }

    /// Whether a cancel arrived while the task was running.
    #[must_use]
    pub fn is_cancel_requested(&self, id: &str) -> bool {
        self.state
            .read()
            .tasks
            .get(id)
            .is_some_and(|t| t.cancel_requested)
    }

    /// Drop every terminal snapshot. Returns how many were removed.
    pub fn purge_terminal(&self) -> usize {
        let mut state = self.state.write();
        let before = state.tasks.len();
        state.tasks.retain(|_, t| !t.status.is_terminal());
        state.terminal_order.clear();
        before - state.tasks.len()
    }

    /// Every retained snapshot, oldest submission first.
    #[must_use]
    pub fn snapshot_all(&self) -> Vec<TaskSnapshot> {
        let mut all: Vec<TaskSnapshot> = self.state.read().tasks.values().cloned().collect();
        all.sort_by(|a, b| a.created_at_ms.cmp(&b.created_at_ms).then_with(|| a.id.cmp(&b.id)));
        all
    }

    /// Lifetime totals.
    #[must_use]
    pub fn totals(&self) -> RegistryTotals {
        self.state.read().totals
    }

    /// Current `(pending, running)` counts.
    #[must_use]
    pub fn in_flight(&self) -> (usize, usize) {
        let state = self.state.read();
        (state.pending, state.running)
    }

    /// Block until a task is terminal or `timeout` elapses.
    ///
    /// # Errors
    ///
    /// `TaskNotFound` for unknown ids, `Timeout` if the task is still in flight.
    pub fn wait(&self, id: &str, timeout: Duration) -> Result<TaskSnapshot, SchedulerError> {
        let deadline = Instant::now() + timeout;
        let mut generation = self.generation.lock();
        loop {
            match self.get(id) {
                None => return Err(SchedulerError::TaskNotFound(id.to_owned())),
                Some(snapshot) if snapshot.status.is_terminal() => return Ok(snapshot),
                Some(_) => {}
            }
            if self.changed.wait_until(&mut generation, deadline).timed_out() {
                return match self.get(id) {
                    Some(snapshot) if snapshot.status.is_terminal() => Ok(snapshot),
                    Some(_) => Err(SchedulerError::Timeout),
                    None => Err(SchedulerError::TaskNotFound(id.to_owned())),
                };
            }
        }
    }
}

impl ProgressSink for TaskRegistry {
    fn update(&self, task_id: &str, fraction: f64) {
        self.report_progress(task_id, fraction);
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new(usize::MAX)
    }
}
