//! The processor contract and the by-name processor catalog.
//!
//! A processor is the opaque unit of work a task carries: it receives the
//! task input plus metadata and returns a result or an error. Decoders,
//! inference kernels and encoders all plug in through this one interface.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, RecvTimeoutError};
use parking_lot::RwLock;
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

/// Task metadata passed to processors.
pub type Metadata = serde_json::Map<String, Value>;

/// Shared handle to a processor.
pub type ProcessorRef = Arc<dyn Processor>;

/// Metadata keys the scheduler reads or injects.
pub mod meta_keys {
    /// Per-task strategy override (`"single_device"`, `"data_parallel"`, `"model_parallel"`).
    pub const STRATEGY: &str = "strategy";
    /// Injected: id of the executing task.
    pub const TASK_ID: &str = "task_id";
    /// Injected: id of the device the call is bound to.
    pub const DEVICE_ID: &str = "device_id";
    /// Injected: backend family of the bound device.
    pub const DEVICE_KIND: &str = "device_kind";
    /// Injected for data-parallel chunks: zero-based chunk index.
    pub const CHUNK_INDEX: &str = "chunk_index";
    /// Injected for data-parallel chunks: number of chunks.
    pub const CHUNK_COUNT: &str = "chunk_count";
}

/// Error returned by a processor.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ProcessorError {
    message: String,
}

impl ProcessorError {
    /// Create an error with a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }

    /// The error message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<String> for ProcessorError {
    fn from(message: String) -> Self {
        Self { message }
    }
}

impl From<&str> for ProcessorError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

/// A unit of work executed on a device.
///
/// Any `Fn(Value, &Metadata) -> Result<Value, ProcessorError>` closure is a
/// processor. The scheduler never inspects `input` or the result, except that
/// data-parallel dispatch slices an array input.
pub trait Processor: Send + Sync {
    /// Run the work.
    ///
    /// # Errors
    ///
    /// Any failure of the work itself; it fails only the owning task.
    fn process(&self, input: Value, metadata: &Metadata) -> Result<Value, ProcessorError>;
}

impl<F> Processor for F
where
    F: Fn(Value, &Metadata) -> Result<Value, ProcessorError> + Send + Sync,
{
    fn process(&self, input: Value, metadata: &Metadata) -> Result<Value, ProcessorError> {
        self(input, metadata)
    }
}

/// Catalog of processors registered by operation name.
#[derive(Default)]
pub struct ProcessorRegistry {
    processors: RwLock<HashMap<String, ProcessorRef>>,
}

impl ProcessorRegistry {
    /// Create an empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a processor, replacing any previous one with the same name.
    pub fn register(&self, name: impl Into<String>, processor: ProcessorRef) {
        let name = name.into();
        if self.processors.write().insert(name.clone(), processor).is_some() {
            warn!(processor = %name, "processor replaced");
        }
    }

    /// Look a processor up by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<ProcessorRef> {
        self.processors.read().get(name).cloned()
    }

    /// Registered names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.processors.read().keys().cloned().collect();
        names.sort();
        names
    }
}

/// Wrap a processor so calls taking longer than `timeout` fail.
///
/// The inner call runs on its own thread; on expiry the task fails and the
/// thread is left to finish in the background, since in-flight work cannot
/// be preempted.
#[must_use]
pub fn with_deadline(inner: ProcessorRef, timeout: Duration) -> ProcessorRef {
    Arc::new(Deadline { inner, timeout })
}

struct Deadline {
    inner: ProcessorRef,
    timeout: Duration,
}

impl Processor for Deadline {
    fn process(&self, input: Value, metadata: &Metadata) -> Result<Value, ProcessorError> {
        let (tx, rx) = bounded(1);
        let inner = Arc::clone(&self.inner);
        let metadata = metadata.clone();
        let reporter = crate::core::progress::current();
        thread::Builder::new()
            .name("deadline-call".into())
            .spawn(move || {
                let _progress = reporter.map(crate::core::progress::enter);
                let _ = tx.send(inner.process(input, &metadata));
            })
            .map_err(|e| ProcessorError::new(format!("failed to spawn deadline thread: {e}")))?;

        match rx.recv_timeout(self.timeout) {
            Ok(outcome) => outcome,
            Err(RecvTimeoutError::Timeout) => Err(ProcessorError::new(format!(
                "deadline of {} ms exceeded",
                self.timeout.as_millis()
            ))),
            Err(RecvTimeoutError::Disconnected) => Err(ProcessorError::new("processor panicked")),
        }
    }
}
