//! Fixed pool of named OS worker threads draining a [`TaskQueue`].
//!
//! Workers block on the queue condvar, never poll. Each dequeued item is
//! handed to a [`TaskHandler`] behind a panic boundary, so a misbehaving task
//! cannot take a worker down. Stopping closes the queue; workers finish what
//! is queued, then exit and are joined.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::core::queue::TaskQueue;
use crate::core::task::panic_message;
use crate::core::SchedulerError;

/// Executes one dequeued item on a worker thread.
pub trait TaskHandler<T>: Send + Sync {
    /// Handle an item. Panics are caught and counted by the pool.
    fn handle(&self, worker_id: usize, item: T);
}

/// Pool utilization snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    /// Number of worker threads.
    pub worker_count: usize,
    /// Workers currently inside a handler.
    pub busy_workers: u64,
    /// Items waiting in the queue.
    pub queued_tasks: usize,
    /// Items handled, including ones whose handler panicked.
    pub processed_tasks: u64,
    /// Handler invocations that panicked.
    pub handler_panics: u64,
}

/// Lock-free pool counters.
#[derive(Debug, Default)]
pub(crate) struct PoolCounters {
    pub busy_workers: AtomicU64,
    pub processed_tasks: AtomicU64,
    pub handler_panics: AtomicU64,
}

impl PoolCounters {
    /// Snapshot of the counters.
    pub fn snapshot(&self, worker_count: usize, queued_tasks: usize) -> PoolStats {
        PoolStats {
            worker_count,
            busy_workers: self.busy_workers.load(Ordering::Relaxed),
            queued_tasks,
            processed_tasks: self.processed_tasks.load(Ordering::Relaxed),
            handler_panics: self.handler_panics.load(Ordering::Relaxed),
        }
    }
}

/// Running worker threads bound to one queue.
pub struct WorkerPool<T: Send + 'static> {
    queue: Arc<TaskQueue<T>>,
    counters: Arc<PoolCounters>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    worker_count: usize,
    stopped: AtomicBool,
}

impl<T: Send + 'static> WorkerPool<T> {
    /// Spawn `worker_count` threads pulling from `queue`.
    ///
    /// # Errors
    ///
    /// `InvalidTask` for a zero worker count, `Internal` if a thread cannot be
    /// spawned. Threads spawned before a failure are stopped again.
    pub fn start(
        worker_count: usize,
        thread_stack_size: usize,
        queue: Arc<TaskQueue<T>>,
        handler: Arc<dyn TaskHandler<T>>,
    ) -> Result<Self, SchedulerError> {
        if worker_count == 0 {
            return Err(SchedulerError::InvalidTask("worker_count must be > 0".into()));
        }
        let pool = Self {
            queue,
            counters: Arc::new(PoolCounters::default()),
            workers: Mutex::new(Vec::with_capacity(worker_count)),
            worker_count,
            stopped: AtomicBool::new(false),
        };

        for worker_id in 0..worker_count {
            let queue = Arc::clone(&pool.queue);
            let handler = Arc::clone(&handler);
            let counters = Arc::clone(&pool.counters);
            let spawned = thread::Builder::new()
                .name(format!("sched-worker-{worker_id}"))
                .stack_size(thread_stack_size)
                .spawn(move || worker_loop(worker_id, &queue, handler.as_ref(), &counters));
            match spawned {
                Ok(handle) => pool.workers.lock().push(handle),
                Err(e) => {
                    pool.stop();
                    return Err(SchedulerError::Internal(format!(
                        "failed to spawn worker {worker_id}: {e}"
                    )));
                }
            }
        }

        info!(worker_count, "worker pool started");
        Ok(pool)
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        self.counters.snapshot(self.worker_count, self.queue.len())
    }

    /// Number of worker threads.
    #[must_use]
    pub const fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Close the queue, let workers drain it, and join them. Idempotent.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("stopping worker pool");
        self.queue.close();

        let workers: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        let joined = workers.len();
        for (worker_id, worker) in workers.into_iter().enumerate() {
            if worker.join().is_err() {
                warn!(worker_id, "worker thread panicked outside a handler");
            } else {
                debug!(worker_id, "worker joined");
            }
        }
        info!(worker_count = joined, "worker pool stopped");
    }
}

impl<T: Send + 'static> Drop for WorkerPool<T> {
    fn drop(&mut self) {
        // Signal only; joining here could block on long-running handlers.
        if !self.stopped.swap(true, Ordering::AcqRel) {
            self.queue.close();
            debug!("worker pool dropped without stop; workers detached");
        }
    }
}

fn worker_loop<T>(
    worker_id: usize,
    queue: &TaskQueue<T>,
    handler: &dyn TaskHandler<T>,
    counters: &PoolCounters,
) {
    debug!(worker_id, "worker started");
    while let Some(item) = queue.pop() {
        counters.busy_workers.fetch_add(1, Ordering::Relaxed);
        let outcome = catch_unwind(AssertUnwindSafe(|| handler.handle(worker_id, item)));
        counters.busy_workers.fetch_sub(1, Ordering::Relaxed);
        counters.processed_tasks.fetch_add(1, Ordering::Relaxed);
        if let Err(panic) = outcome {
            counters.handler_panics.fetch_add(1, Ordering::Relaxed);
            error!(worker_id, reason = %panic_message(panic.as_ref()), "task handler panicked");
        }
    }
    debug!(worker_id, "worker exiting");
}
