//! Progress reporting from inside a running processor.
//!
//! While a worker runs a task it installs a [`ProgressReporter`] for the
//! current thread, so processor code can call [`report_progress`] without
//! threading a handle through its signature. The latest fraction lands on
//! the task's snapshot. Processors that fan out to their own threads can take
//! [`current`] and move the clone along.

use std::cell::RefCell;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::core::task::TaskId;

/// Receives progress updates for a task.
pub trait ProgressSink: Send + Sync {
    /// Record `fraction` (already clamped to `[0, 1]`) for `task_id`.
    fn update(&self, task_id: &str, fraction: f64);
}

/// Handle that forwards progress for one task.
#[derive(Clone)]
pub struct ProgressReporter {
    task_id: TaskId,
    sink: Arc<dyn ProgressSink>,
}

impl ProgressReporter {
    /// Reporter for `task_id` writing into `sink`.
    pub fn new(task_id: impl Into<TaskId>, sink: Arc<dyn ProgressSink>) -> Self {
        Self {
            task_id: task_id.into(),
            sink,
        }
    }

    /// Task this reporter belongs to.
    #[must_use]
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Report completion as a fraction in `[0, 1]`. NaN is ignored.
    pub fn report(&self, fraction: f64) {
        if fraction.is_nan() {
            return;
        }
        self.sink.update(&self.task_id, fraction.clamp(0.0, 1.0));
    }
}

impl fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("task_id", &self.task_id)
            .finish_non_exhaustive()
    }
}

thread_local! {
    static CURRENT: RefCell<Option<ProgressReporter>> = const { RefCell::new(None) };
}

/// Reporter installed on this thread, if a task is running here.
#[must_use]
pub fn current() -> Option<ProgressReporter> {
    CURRENT.with(|slot| slot.borrow().clone())
}

/// Report progress for the task running on this thread.
///
/// Returns `false` when called outside a scheduled task.
pub fn report_progress(fraction: f64) -> bool {
    current().map(|reporter| reporter.report(fraction)).is_some()
}

/// Restores the previously installed reporter on drop.
#[must_use]
pub struct ProgressScope {
    previous: Option<ProgressReporter>,
}

/// Install `reporter` for the current thread until the returned scope drops.
pub fn enter(reporter: ProgressReporter) -> ProgressScope {
    let previous = CURRENT.with(|slot| slot.borrow_mut().replace(reporter));
    ProgressScope { previous }
}

impl Drop for ProgressScope {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT.with(|slot| *slot.borrow_mut() = previous);
    }
}

/// Averages per-chunk progress of a data-parallel run into its parent reporter.
pub(crate) struct ChunkedProgress {
    parent: ProgressReporter,
    fractions: Mutex<Vec<f64>>,
}

impl ChunkedProgress {
    pub(crate) fn new(parent: ProgressReporter, chunks: usize) -> Arc<Self> {
        Arc::new(Self {
            parent,
            fractions: Mutex::new(vec![0.0; chunks]),
        })
    }

    /// Reporter for one chunk.
    pub(crate) fn chunk_reporter(self: &Arc<Self>, index: usize) -> ProgressReporter {
        ProgressReporter::new(
            self.parent.task_id.clone(),
            Arc::new(ChunkSlot {
                shared: Arc::clone(self),
                index,
            }),
        )
    }

    #[allow(clippy::cast_precision_loss)]
    fn set(&self, index: usize, fraction: f64) {
        // Held across the report so the parent sees means in update order.
        let mut fractions = self.fractions.lock();
        if let Some(slot) = fractions.get_mut(index) {
            *slot = fraction;
        }
        if fractions.is_empty() {
            return;
        }
        let mean = fractions.iter().sum::<f64>() / fractions.len() as f64;
        self.parent.report(mean);
    }
}

struct ChunkSlot {
    shared: Arc<ChunkedProgress>,
    index: usize,
}

impl ProgressSink for ChunkSlot {
    fn update(&self, _task_id: &str, fraction: f64) {
        self.shared.set(self.index, fraction);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(String, f64)>>,
    }

    impl ProgressSink for Recorder {
        fn update(&self, task_id: &str, fraction: f64) {
            self.seen.lock().push((task_id.to_owned(), fraction));
        }
    }

    #[test]
    fn test_report_outside_task_is_noop() {
        assert!(current().is_none());
        assert!(!report_progress(0.5));
    }

    #[test]
    fn test_scope_installs_and_restores() {
        let recorder = Arc::new(Recorder::default());
        {
            let _scope = enter(ProgressReporter::new("outer", recorder.clone()));
            assert!(report_progress(0.25));
            {
                let _inner = enter(ProgressReporter::new("inner", recorder.clone()));
                assert!(report_progress(2.0));
            }
            assert_eq!(current().unwrap().task_id(), "outer");
            assert!(report_progress(f64::NAN));
        }
        assert!(current().is_none());

        let seen = recorder.seen.lock().clone();
        assert_eq!(seen, vec![("outer".to_string(), 0.25), ("inner".to_string(), 1.0)]);
    }

    #[test]
    fn test_chunked_progress_averages() {
        let recorder = Arc::new(Recorder::default());
        let chunks = ChunkedProgress::new(ProgressReporter::new("t", recorder.clone()), 4);
        chunks.chunk_reporter(0).report(1.0);
        chunks.chunk_reporter(3).report(0.5);

        let seen = recorder.seen.lock().clone();
        assert_eq!(seen, vec![("t".to_string(), 0.25), ("t".to_string(), 0.375)]);
    }
}
