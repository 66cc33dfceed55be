//! Dispatch strategies: how one task's work maps onto devices.
//!
//! - [`SingleDevice`] runs the whole input on the best device.
//! - [`DataParallel`] splits an array input into contiguous chunks, runs each
//!   chunk on its own device concurrently, and reassembles results in input
//!   order. With one device or fewer available it runs as [`SingleDevice`].
//! - [`ModelParallel`] is an extension point; it currently runs as
//!   [`SingleDevice`].
//!
//! Memory reservations taken during dispatch are pinned and released by a
//! guard on every exit path, including processor panics.

use std::collections::HashMap;
use std::fmt;
use std::ops::Range;
use std::str::FromStr;
use std::sync::Arc;
use std::thread;

use crossbeam_channel::bounded;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::core::device::{Device, DeviceId, DeviceRegistry};
use crate::core::ledger::MemoryLedger;
use crate::core::processor::{meta_keys, Metadata};
use crate::core::progress::{self, ChunkedProgress};
use crate::core::task::DispatchJob;
use crate::core::SchedulerError;

/// Parallelization policy for a task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Whole task on one device.
    #[default]
    SingleDevice,
    /// Array input chunked across devices.
    DataParallel,
    /// Model sharding; currently runs as `SingleDevice`.
    ModelParallel,
}

impl Strategy {
    /// Snake-case name, as accepted in task metadata.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SingleDevice => "single_device",
            Self::DataParallel => "data_parallel",
            Self::ModelParallel => "model_parallel",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "single_device" | "singledevice" | "single" => Ok(Self::SingleDevice),
            "data_parallel" | "dataparallel" => Ok(Self::DataParallel),
            "model_parallel" | "modelparallel" => Ok(Self::ModelParallel),
            other => Err(SchedulerError::InvalidTask(format!("unknown strategy `{other}`"))),
        }
    }
}

/// Pick the strategy for a task: metadata override, then the process default,
/// then `SingleDevice`.
///
/// A `DataParallel` process default degrades to `SingleDevice` when at most
/// one device is available. An explicit metadata override is kept as given.
///
/// # Errors
///
/// `InvalidTask` when the metadata override is not a known strategy name.
pub fn resolve_strategy(
    metadata: &Metadata,
    default: Option<Strategy>,
    available_devices: usize,
) -> Result<Strategy, SchedulerError> {
    match metadata.get(meta_keys::STRATEGY) {
        Some(Value::String(name)) => name.parse(),
        Some(other) => Err(SchedulerError::InvalidTask(format!(
            "strategy must be a string, got {other}"
        ))),
        None => match default.unwrap_or_default() {
            Strategy::DataParallel if available_devices <= 1 => Ok(Strategy::SingleDevice),
            strategy => Ok(strategy),
        },
    }
}

/// One contiguous slice of the input bound to a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkAssignment {
    /// Device the chunk ran on.
    pub device_id: DeviceId,
    /// Offset of the chunk in the input.
    pub offset: usize,
    /// Number of input items in the chunk.
    pub len: usize,
}

/// How one execution was laid out. Not persisted beyond the task snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchPlan {
    /// Strategy that actually ran.
    pub strategy: Strategy,
    /// One entry per chunk; a single entry for whole-input dispatch.
    pub assignments: Vec<ChunkAssignment>,
}

impl DispatchPlan {
    /// Devices used, in chunk order.
    #[must_use]
    pub fn device_ids(&self) -> Vec<DeviceId> {
        self.assignments.iter().map(|a| a.device_id).collect()
    }
}

/// A finished dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct Dispatched {
    /// Processor result (reassembled for data-parallel runs).
    pub result: Value,
    /// Layout that produced it.
    pub plan: DispatchPlan,
}

/// Shared state a strategy may consult.
pub struct DispatchContext<'a> {
    /// Device registry, which also owns the memory ledger.
    pub devices: &'a DeviceRegistry,
}

impl DispatchContext<'_> {
    fn ledger(&self) -> &MemoryLedger {
        self.devices.ledger()
    }
}

/// A policy that executes a job on one or more devices.
pub trait DispatchStrategy: Send + Sync {
    /// Which strategy slot this implementation fills.
    fn kind(&self) -> Strategy;

    /// Execute the job.
    ///
    /// # Errors
    ///
    /// `NoDeviceAvailable`, `AllocationDenied`, `Processor`, or `InvalidTask`
    /// for input the strategy cannot handle.
    fn dispatch(&self, ctx: &DispatchContext<'_>, job: DispatchJob) -> Result<Dispatched, SchedulerError>;
}

/// Releases a ledger reservation when dropped.
struct ReservationGuard<'a> {
    ledger: &'a MemoryLedger,
    device_id: DeviceId,
    tag: String,
}

impl<'a> ReservationGuard<'a> {
    fn acquire(ledger: &'a MemoryLedger, device_id: DeviceId, tag: String, bytes: u64) -> Result<Self, SchedulerError> {
        if ledger.try_reserve_pinned(device_id, &tag, bytes) {
            Ok(Self { ledger, device_id, tag })
        } else {
            Err(SchedulerError::AllocationDenied {
                device_id,
                requested_bytes: bytes,
            })
        }
    }
}

impl Drop for ReservationGuard<'_> {
    fn drop(&mut self) {
        self.ledger.release(self.device_id, &self.tag);
    }
}

fn bind_device(metadata: &mut Metadata, task_id: &str, device: &Device) {
    metadata.insert(meta_keys::TASK_ID.into(), Value::from(task_id));
    metadata.insert(meta_keys::DEVICE_ID.into(), Value::from(device.id));
    metadata.insert(meta_keys::DEVICE_KIND.into(), Value::from(device.kind.as_str()));
}

/// Whole task on the single best device.
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleDevice;

impl SingleDevice {
    fn choose(ctx: &DispatchContext<'_>, job: &DispatchJob) -> Result<Device, SchedulerError> {
        let preferred = job
            .preferred_device
            .and_then(|id| ctx.devices.get(id))
            .filter(|d| d.available && d.free_memory() >= job.memory_estimate);
        preferred
            .or_else(|| ctx.devices.select_best(job.memory_estimate))
            .ok_or(SchedulerError::NoDeviceAvailable {
                required_bytes: job.memory_estimate,
            })
    }
}

impl DispatchStrategy for SingleDevice {
    fn kind(&self) -> Strategy {
        Strategy::SingleDevice
    }

    fn dispatch(&self, ctx: &DispatchContext<'_>, job: DispatchJob) -> Result<Dispatched, SchedulerError> {
        let device = Self::choose(ctx, &job)?;
        let _reservation = ReservationGuard::acquire(
            ctx.ledger(),
            device.id,
            format!("task:{}", job.task_id),
            job.memory_estimate,
        )?;

        let mut metadata = job.metadata;
        bind_device(&mut metadata, &job.task_id, &device);
        debug!(task_id = %job.task_id, device_id = device.id, "dispatching on single device");

        let len = job.input.as_array().map_or(1, Vec::len);
        let result = DispatchJob::invoke(job.processor.as_ref(), job.input, &metadata)?;
        Ok(Dispatched {
            result,
            plan: DispatchPlan {
                strategy: Strategy::SingleDevice,
                assignments: vec![ChunkAssignment {
                    device_id: device.id,
                    offset: 0,
                    len,
                }],
            },
        })
    }
}

/// Split `len` items into `parts` contiguous ranges whose sizes differ by at most one.
fn partition(len: usize, parts: usize) -> Vec<Range<usize>> {
    let base = len / parts;
    let extra = len % parts;
    let mut start = 0;
    (0..parts)
        .map(|i| {
            let size = base + usize::from(i < extra);
            let range = start..start + size;
            start += size;
            range
        })
        .collect()
}

/// Array input chunked across distinct devices, results in input order.
#[derive(Debug, Clone, Copy, Default)]
pub struct DataParallel;

impl DispatchStrategy for DataParallel {
    fn kind(&self) -> Strategy {
        Strategy::DataParallel
    }

    fn dispatch(&self, ctx: &DispatchContext<'_>, job: DispatchJob) -> Result<Dispatched, SchedulerError> {
        let devices = ctx.devices.rank_available();
        if devices.len() <= 1 {
            debug!(task_id = %job.task_id, "one device available, data-parallel running on a single device");
            return SingleDevice.dispatch(ctx, job);
        }

        let DispatchJob {
            task_id,
            processor,
            input,
            metadata,
            memory_estimate,
            ..
        } = job;
        let items = match input {
            Value::Array(items) if !items.is_empty() => items,
            _ => {
                return Err(SchedulerError::InvalidTask(
                    "data-parallel input must be a non-empty array".into(),
                ))
            }
        };

        let chunk_count = devices.len().min(items.len());
        let per_chunk_bytes = memory_estimate.div_ceil(chunk_count as u64);
        let ranges = partition(items.len(), chunk_count);

        // Reserve everything up front; a denial drops the guards taken so far.
        let mut guards = Vec::with_capacity(chunk_count);
        for (index, device) in devices.iter().take(chunk_count).enumerate() {
            guards.push(ReservationGuard::acquire(
                ctx.ledger(),
                device.id,
                format!("task:{task_id}:chunk:{index}"),
                per_chunk_bytes,
            )?);
        }

        debug!(task_id = %task_id, chunks = chunk_count, "dispatching data-parallel");

        let chunk_progress = progress::current().map(|parent| ChunkedProgress::new(parent, chunk_count));
        let (tx, rx) = bounded::<(usize, Result<Value, SchedulerError>)>(chunk_count);
        let mut parts: Vec<Option<Result<Value, SchedulerError>>> = vec![None; chunk_count];

        thread::scope(|scope| {
            for (index, ((range, device), guard)) in ranges
                .iter()
                .zip(devices.iter())
                .zip(guards)
                .enumerate()
            {
                let chunk = Value::Array(items[range.clone()].to_vec());
                let mut chunk_meta = metadata.clone();
                bind_device(&mut chunk_meta, &task_id, device);
                chunk_meta.insert(meta_keys::CHUNK_INDEX.into(), Value::from(index));
                chunk_meta.insert(meta_keys::CHUNK_COUNT.into(), Value::from(chunk_count));

                let processor = Arc::clone(&processor);
                let reporter = chunk_progress.as_ref().map(|shared| shared.chunk_reporter(index));
                let chunk_tx = tx.clone();
                let spawned = thread::Builder::new()
                    .name(format!("dp-{task_id}-{index}"))
                    .spawn_scoped(scope, move || {
                        let _guard = guard;
                        let _progress = reporter.map(progress::enter);
                        let outcome = DispatchJob::invoke(processor.as_ref(), chunk, &chunk_meta);
                        if outcome.is_ok() {
                            progress::report_progress(1.0);
                        }
                        let _ = chunk_tx.send((index, outcome));
                    });
                if let Err(e) = spawned {
                    let _ = tx.send((index, Err(SchedulerError::Internal(format!("failed to spawn chunk thread: {e}")))));
                }
            }
            drop(tx);

            // Fan-in: every chunk is drained even after a failure.
            for (index, outcome) in &rx {
                if let Err(e) = &outcome {
                    warn!(task_id = %task_id, chunk = index, error = %e, "data-parallel chunk failed");
                }
                parts[index] = Some(outcome);
            }
        });

        let mut merged = Vec::with_capacity(items.len());
        for (index, part) in parts.into_iter().enumerate() {
            match part {
                Some(Ok(Value::Array(values))) => merged.extend(values),
                Some(Ok(value)) => merged.push(value),
                Some(Err(e)) => return Err(e),
                None => {
                    return Err(SchedulerError::Internal(format!("chunk {index} produced no result")))
                }
            }
        }

        let assignments = ranges
            .iter()
            .zip(devices.iter())
            .map(|(range, device)| ChunkAssignment {
                device_id: device.id,
                offset: range.start,
                len: range.len(),
            })
            .collect();
        Ok(Dispatched {
            result: Value::Array(merged),
            plan: DispatchPlan {
                strategy: Strategy::DataParallel,
                assignments,
            },
        })
    }
}

/// Model sharding extension point.
///
/// Sharding needs layer-level knowledge of the model that processors do not
/// expose, so this runs the task as [`SingleDevice`]. Register a replacement
/// through [`Dispatcher::register`] to provide real sharding.
#[derive(Debug, Clone, Copy, Default)]
pub struct ModelParallel {
    fallback: SingleDevice,
}

impl DispatchStrategy for ModelParallel {
    fn kind(&self) -> Strategy {
        Strategy::ModelParallel
    }

    fn dispatch(&self, ctx: &DispatchContext<'_>, job: DispatchJob) -> Result<Dispatched, SchedulerError> {
        debug!(task_id = %job.task_id, "model-parallel running on a single device");
        self.fallback.dispatch(ctx, job)
    }
}

/// Maps each [`Strategy`] to its implementation.
pub struct Dispatcher {
    strategies: HashMap<Strategy, Arc<dyn DispatchStrategy>>,
}

impl Dispatcher {
    /// Dispatcher with the built-in strategies.
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut dispatcher = Self {
            strategies: HashMap::new(),
        };
        dispatcher.register(Arc::new(SingleDevice));
        dispatcher.register(Arc::new(DataParallel));
        dispatcher.register(Arc::new(ModelParallel::default()));
        dispatcher
    }

    /// Install or replace the implementation for `strategy.kind()`.
    pub fn register(&mut self, strategy: Arc<dyn DispatchStrategy>) {
        self.strategies.insert(strategy.kind(), strategy);
    }

    /// Implementation installed for a strategy.
    #[must_use]
    pub fn get(&self, strategy: Strategy) -> Option<Arc<dyn DispatchStrategy>> {
        self.strategies.get(&strategy).cloned()
    }

    /// Run a job under the given strategy.
    ///
    /// # Errors
    ///
    /// Whatever the strategy returns.
    pub fn dispatch(
        &self,
        strategy: Strategy,
        ctx: &DispatchContext<'_>,
        job: DispatchJob,
    ) -> Result<Dispatched, SchedulerError> {
        let implementation = self
            .strategies
            .get(&strategy)
            .ok_or_else(|| SchedulerError::Internal(format!("no implementation for {strategy}")))?;
        implementation.dispatch(ctx, job)
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::with_defaults()
    }
}
