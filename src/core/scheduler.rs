//! The scheduler facade: admission, lifecycle, cancellation and stats.
//!
//! One `Scheduler` value owns every piece of scheduling state. There is no
//! global instance; share it behind an `Arc` if several components submit.
//!
//! ```rust,ignore
//! let scheduler = build_scheduler(&SchedulerConfig::new().with_worker_count(4))?;
//! scheduler.start()?;
//! let id = scheduler.submit(
//!     Task::new("resize")
//!         .with_input(json!([1, 2, 3]))
//!         .with_processor(|input, _meta| Ok(input)),
//! )?;
//! let done = scheduler.wait(&id, Duration::from_secs(30))?;
//! scheduler.stop();
//! ```

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::core::audit::{build_audit_event, terminal_event, AuditAction, AuditSink};
use crate::core::device::{DeviceId, DeviceRegistry};
use crate::core::ledger::MemoryLedger;
use crate::core::processor::{Metadata, ProcessorRef, ProcessorRegistry};
use crate::core::progress::{self, ProgressReporter, ProgressSink};
use crate::core::queue::TaskQueue;
use crate::core::registry::{CancelOutcome, TaskOutcome, TaskRegistry};
use crate::core::stats::SchedulerStats;
use crate::core::strategy::{resolve_strategy, DispatchContext, DispatchStrategy, Dispatcher, Strategy};
use crate::core::task::{DispatchJob, Task, TaskId, TaskSnapshot};
use crate::core::worker_pool::{TaskHandler, WorkerPool};
use crate::core::SchedulerError;
use crate::util::clock;

/// A task as it sits in the queue.
pub(crate) struct QueuedTask {
    id: TaskId,
    strategy: Strategy,
    processor: ProcessorRef,
    input: Value,
    metadata: Metadata,
    preferred_device: Option<DeviceId>,
    memory_estimate: u64,
}

/// State shared between the facade and the worker threads.
struct SchedulerCore {
    devices: Arc<DeviceRegistry>,
    queue: Arc<TaskQueue<QueuedTask>>,
    registry: Arc<TaskRegistry>,
    processors: ProcessorRegistry,
    dispatcher: RwLock<Dispatcher>,
    audit: RwLock<Option<Arc<dyn AuditSink>>>,
    default_strategy: Option<Strategy>,
    worker_count: usize,
    thread_stack_size: usize,
    started_at_ms: u64,
}

impl SchedulerCore {
    fn audit(&self, task_id: &str, action: AuditAction, detail: Option<String>) {
        if let Some(sink) = self.audit.read().as_ref() {
            sink.record(build_audit_event(task_id, action, detail));
        }
    }

    fn audit_terminal(&self, snapshot: &TaskSnapshot) {
        if let Some(sink) = self.audit.read().as_ref() {
            if let Some(event) = terminal_event(snapshot) {
                sink.record(event);
            }
        }
    }

    /// Record a terminal transition this caller performed and fire the task's
    /// completion callback, containing any panic it raises.
    fn settle(&self, snapshot: &TaskSnapshot) {
        self.audit_terminal(snapshot);
        let Some(callback) = self.registry.take_callback(&snapshot.id) else {
            return;
        };
        if catch_unwind(AssertUnwindSafe(|| callback(snapshot))).is_err() {
            warn!(task_id = %snapshot.id, "completion callback panicked");
        }
    }

    fn run(&self, worker_id: usize, task: QueuedTask) -> Option<TaskSnapshot> {
        let QueuedTask {
            id,
            strategy,
            processor,
            input,
            metadata,
            preferred_device,
            memory_estimate,
        } = task;
        self.audit(&id, AuditAction::Started, None);
        debug!(worker_id, task_id = %id, %strategy, "task started");

        let sink: Arc<dyn ProgressSink> = self.registry.clone();
        let _progress = progress::enter(ProgressReporter::new(id.clone(), sink));

        let implementation = self.dispatcher.read().get(strategy);
        let outcome = match implementation {
            Some(implementation) => {
                let ctx = DispatchContext { devices: &self.devices };
                let job = DispatchJob {
                    task_id: id.clone(),
                    processor,
                    input,
                    metadata,
                    preferred_device,
                    memory_estimate,
                };
                implementation.dispatch(&ctx, job)
            }
            None => Err(SchedulerError::Internal(format!("no implementation for {strategy}"))),
        };

        let outcome = match outcome {
            Ok(dispatched) => TaskOutcome::Completed {
                devices: dispatched.plan.device_ids(),
                result: dispatched.result,
            },
            Err(error) => {
                warn!(worker_id, task_id = %id, error = %error, "task failed");
                TaskOutcome::Failed {
                    error,
                    devices: Vec::new(),
                }
            }
        };
        self.registry.finish(&id, outcome)
    }
}

impl TaskHandler<QueuedTask> for SchedulerCore {
    fn handle(&self, worker_id: usize, task: QueuedTask) {
        if !self.registry.try_start(&task.id) {
            // Cancelled after this worker dequeued it; the cancel path settled it.
            debug!(worker_id, task_id = %task.id, "skipping task cancelled before start");
            return;
        }
        if let Some(snapshot) = self.run(worker_id, task) {
            self.settle(&snapshot);
        }
    }
}

/// Task scheduler over a set of compute devices.
pub struct Scheduler {
    core: Arc<SchedulerCore>,
    pool: Mutex<Option<WorkerPool<QueuedTask>>>,
}

impl Scheduler {
    /// Create a stopped scheduler over `devices`.
    ///
    /// The configuration is not validated here; see
    /// [`crate::builders::build_scheduler`].
    #[must_use]
    pub fn new(config: &SchedulerConfig, devices: Arc<DeviceRegistry>) -> Self {
        let core = SchedulerCore {
            devices,
            queue: Arc::new(TaskQueue::new(config.max_queue_depth)),
            registry: Arc::new(TaskRegistry::new(config.retention_limit)),
            processors: ProcessorRegistry::new(),
            dispatcher: RwLock::new(Dispatcher::with_defaults()),
            audit: RwLock::new(None),
            default_strategy: config.default_strategy,
            worker_count: config.worker_count,
            thread_stack_size: config.thread_stack_size,
            started_at_ms: clock::now_ms(),
        };
        Self {
            core: Arc::new(core),
            pool: Mutex::new(None),
        }
    }

    /// Attach an audit sink for lifecycle events.
    #[must_use]
    pub fn with_audit_sink(self, sink: Arc<dyn AuditSink>) -> Self {
        *self.core.audit.write() = Some(sink);
        self
    }

    /// Start the worker pool. Idempotent while running.
    ///
    /// # Errors
    ///
    /// `ShuttingDown` after [`Scheduler::stop`], `Internal` if worker threads
    /// cannot be spawned.
    pub fn start(&self) -> Result<(), SchedulerError> {
        let mut pool = self.pool.lock();
        if pool.is_some() {
            return Ok(());
        }
        if self.core.queue.is_closed() {
            return Err(SchedulerError::ShuttingDown);
        }
        let handler: Arc<dyn TaskHandler<QueuedTask>> = self.core.clone();
        *pool = Some(WorkerPool::start(
            self.core.worker_count,
            self.core.thread_stack_size,
            Arc::clone(&self.core.queue),
            handler,
        )?);
        info!(
            worker_count = self.core.worker_count,
            devices = self.core.devices.list_devices().len(),
            "scheduler started"
        );
        Ok(())
    }

    /// Whether the worker pool is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.pool.lock().is_some() && !self.core.queue.is_closed()
    }

    /// Stop accepting work, run everything already queued, and join the workers.
    ///
    /// Tasks still queued when no pool was ever started are cancelled.
    pub fn stop(&self) {
        let pool = self.pool.lock().take();
        match pool {
            Some(pool) => pool.stop(),
            None => self.core.queue.close(),
        }
        for task in self.core.queue.drain() {
            if let CancelOutcome::Cancelled(snapshot) = self.core.registry.cancel(&task.id) {
                self.core.settle(&snapshot);
            }
        }
        info!("scheduler stopped");
    }

    /// Queue a task and return its id.
    ///
    /// An empty id is replaced with a fresh UUID. The strategy is resolved
    /// here from the `strategy` metadata key or the configured default; a
    /// data-parallel default runs single-device while at most one device is
    /// available.
    ///
    /// # Errors
    ///
    /// `InvalidTask` for duplicate ids, a missing or unknown processor, an
    /// unknown strategy, or data-parallel input that is not a non-empty array.
    /// `QueueFull` at capacity and `ShuttingDown` after stop.
    pub fn submit(&self, task: Task) -> Result<TaskId, SchedulerError> {
        let core = &self.core;
        if core.queue.is_closed() {
            return Err(SchedulerError::ShuttingDown);
        }
        let Task {
            id,
            name,
            priority,
            processor,
            processor_name,
            input,
            metadata,
            preferred_device,
            memory_estimate,
            on_complete,
        } = task;

        let id = if id.is_empty() { Uuid::new_v4().to_string() } else { id };
        let processor = match (processor, processor_name) {
            (Some(processor), _) => processor,
            (None, Some(name)) => core
                .processors
                .get(&name)
                .ok_or_else(|| SchedulerError::InvalidTask(format!("unknown processor `{name}`")))?,
            (None, None) => {
                return Err(SchedulerError::InvalidTask(format!("task `{id}` has no processor")))
            }
        };
        let strategy = resolve_strategy(&metadata, core.default_strategy, core.devices.available_count())?;
        if strategy == Strategy::DataParallel && !input.as_array().is_some_and(|items| !items.is_empty()) {
            return Err(SchedulerError::InvalidTask(
                "data-parallel input must be a non-empty array".into(),
            ));
        }

        let name = if name.is_empty() { id.clone() } else { name };
        core.registry
            .insert_with_callback(TaskSnapshot::pending(id.clone(), name, priority, strategy), on_complete)?;

        let queued = QueuedTask {
            id: id.clone(),
            strategy,
            processor,
            input,
            metadata,
            preferred_device,
            memory_estimate,
        };
        // Recorded before the push so a fast worker cannot log `Started` first.
        core.audit(&id, AuditAction::Submitted, None);
        if let Err(e) = core.queue.push(priority, queued) {
            core.registry.discard(&id);
            core.audit(&id, AuditAction::Failed, Some(e.to_string()));
            warn!(task_id = %id, error = %e, "task rejected at enqueue");
            return Err(e);
        }
        debug!(task_id = %id, priority, %strategy, "task submitted");
        Ok(id)
    }

    /// Current snapshot of a task.
    #[must_use]
    pub fn status(&self, id: &str) -> Option<TaskSnapshot> {
        self.core.registry.get(id)
    }

    /// Every retained task snapshot, oldest first.
    #[must_use]
    pub fn tasks(&self) -> Vec<TaskSnapshot> {
        self.core.registry.snapshot_all()
    }

    /// Cancel a task.
    ///
    /// A pending task becomes `Cancelled`, leaves the queue and never runs;
    /// returns `true`. A running task only gets `cancel_requested` set and
    /// runs to completion; returns `false`, as do terminal and unknown ids.
    pub fn cancel(&self, id: &str) -> bool {
        match self.core.registry.cancel(id) {
            CancelOutcome::Cancelled(snapshot) => {
                // A worker that already dequeued it will see it is no longer pending.
                drop(self.core.queue.remove(|t| t.id == id));
                self.core.settle(&snapshot);
                debug!(task_id = %id, "task cancelled");
                true
            }
            CancelOutcome::RequestedWhileRunning => {
                debug!(task_id = %id, "cancel requested for running task");
                false
            }
            CancelOutcome::AlreadyTerminal(_) | CancelOutcome::NotFound => false,
        }
    }

    /// Cancel every pending task and flag every running one.
    ///
    /// Each task goes through [`Scheduler::cancel`]. Returns how many pending
    /// tasks were cancelled.
    pub fn cancel_all(&self) -> usize {
        let active = self.core.registry.active_ids();
        let total = active.len();
        let cancelled = active.iter().filter(|id| self.cancel(id)).count();
        info!(cancelled, active = total, "cancel all requested");
        cancelled
    }

    /// Whether a cancel arrived while the task was running.
    #[must_use]
    pub fn is_cancel_requested(&self, id: &str) -> bool {
        self.core.registry.is_cancel_requested(id)
    }

    /// Block until a task is terminal.
    ///
    /// # Errors
    ///
    /// `TaskNotFound` or `Timeout`.
    pub fn wait(&self, id: &str, timeout: Duration) -> Result<TaskSnapshot, SchedulerError> {
        self.core.registry.wait(id, timeout)
    }

    /// Await a task reaching a terminal state without blocking the runtime.
    ///
    /// # Errors
    ///
    /// `TaskNotFound`, `Timeout`, or `Internal` if the blocking waiter fails.
    #[cfg(feature = "tokio-runtime")]
    pub async fn wait_async(&self, id: &str, timeout: Duration) -> Result<TaskSnapshot, SchedulerError> {
        let core = Arc::clone(&self.core);
        let id = id.to_owned();
        tokio::task::spawn_blocking(move || core.registry.wait(&id, timeout))
            .await
            .map_err(|e| SchedulerError::Internal(format!("wait task failed: {e}")))?
    }

    /// Aggregate statistics.
    #[must_use]
    pub fn stats(&self) -> SchedulerStats {
        let pool = self.pool.lock().as_ref().map(WorkerPool::stats);
        SchedulerStats::collect(
            &self.core.registry,
            &self.core.devices,
            self.core.started_at_ms,
            pool,
        )
    }

    /// Register a processor tasks can reference by name.
    pub fn register_processor(&self, name: impl Into<String>, processor: ProcessorRef) {
        self.core.processors.register(name, processor);
    }

    /// Names of registered processors.
    #[must_use]
    pub fn processor_names(&self) -> Vec<String> {
        self.core.processors.names()
    }

    /// Replace the implementation behind one strategy.
    pub fn register_strategy(&self, strategy: Arc<dyn DispatchStrategy>) {
        self.core.dispatcher.write().register(strategy);
    }

    /// The device registry.
    #[must_use]
    pub fn devices(&self) -> &Arc<DeviceRegistry> {
        &self.core.devices
    }

    /// The memory ledger.
    #[must_use]
    pub fn ledger(&self) -> &Arc<MemoryLedger> {
        self.core.devices.ledger()
    }

    /// Drop every terminal snapshot. Lifetime totals are unaffected.
    pub fn purge_terminal(&self) -> usize {
        self.core.registry.purge_terminal()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        // Workers detach and exit once the closed queue is empty.
        self.core.queue.close();
    }
}
