//! Blocking priority queue shared between submitters and workers.
//!
//! Items are served highest priority first and FIFO within a priority. Workers
//! park on a condvar while the queue is empty; closing the queue wakes them so
//! they can drain what is left and exit.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use parking_lot::{Condvar, Mutex};

use crate::core::SchedulerError;

/// Heap entry ordered by priority, then by arrival.
struct Queued<T> {
    priority: i32,
    seq: u64,
    item: T,
}

impl<T> PartialEq for Queued<T> {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl<T> Eq for Queued<T> {}

impl<T> PartialOrd for Queued<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Queued<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher priority wins, then the earlier sequence number.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct QueueState<T> {
    heap: BinaryHeap<Queued<T>>,
    next_seq: u64,
    closed: bool,
}

/// Bounded, blocking priority queue.
pub struct TaskQueue<T> {
    max_depth: usize,
    state: Mutex<QueueState<T>>,
    available: Condvar,
}

impl<T> TaskQueue<T> {
    /// Create a queue holding at most `max_depth` items.
    #[must_use]
    pub fn new(max_depth: usize) -> Self {
        Self {
            max_depth,
            state: Mutex::new(QueueState {
                heap: BinaryHeap::with_capacity(max_depth.min(1024)),
                next_seq: 0,
                closed: false,
            }),
            available: Condvar::new(),
        }
    }

    /// Enqueue an item.
    ///
    /// # Errors
    ///
    /// `ShuttingDown` once the queue is closed, `QueueFull` at capacity.
    pub fn push(&self, priority: i32, item: T) -> Result<(), SchedulerError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(SchedulerError::ShuttingDown);
        }
        if state.heap.len() >= self.max_depth {
            return Err(SchedulerError::QueueFull(format!(
                "max queue depth {} reached",
                self.max_depth
            )));
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.heap.push(Queued { priority, seq, item });
        drop(state);
        self.available.notify_one();
        Ok(())
    }

    /// Block until an item is available.
    ///
    /// Returns `None` once the queue is closed and empty.
    pub fn pop(&self) -> Option<T> {
        let mut state = self.state.lock();
        loop {
            if let Some(entry) = state.heap.pop() {
                return Some(entry.item);
            }
            if state.closed {
                return None;
            }
            self.available.wait(&mut state);
        }
    }

    /// Take the next item without blocking.
    pub fn try_pop(&self) -> Option<T> {
        self.state.lock().heap.pop().map(|entry| entry.item)
    }

    /// Remove the first queued item matching `pred`, preserving the order of the rest.
    pub fn remove(&self, pred: impl Fn(&T) -> bool) -> Option<T> {
        let mut state = self.state.lock();
        if !state.heap.iter().any(|entry| pred(&entry.item)) {
            return None;
        }
        let mut removed = None;
        let kept: Vec<Queued<T>> = std::mem::take(&mut state.heap)
            .into_vec()
            .into_iter()
            .filter_map(|entry| {
                if removed.is_none() && pred(&entry.item) {
                    removed = Some(entry.item);
                    None
                } else {
                    Some(entry)
                }
            })
            .collect();
        state.heap = BinaryHeap::from(kept);
        removed
    }

    /// Refuse further pushes and wake every blocked `pop`.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.available.notify_all();
    }

    /// Whether [`TaskQueue::close`] has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Remove every queued item, in service order.
    pub fn drain(&self) -> Vec<T> {
        let mut state = self.state.lock();
        let mut items = Vec::with_capacity(state.heap.len());
        while let Some(entry) = state.heap.pop() {
            items.push(entry.item);
        }
        items
    }

    /// Number of queued items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().heap.len()
    }

    /// Whether nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Capacity.
    #[must_use]
    pub const fn max_depth(&self) -> usize {
        self.max_depth
    }
}
