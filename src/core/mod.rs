//! Core scheduling abstractions, device accounting and the scheduler facade.

pub mod audit;
pub mod device;
pub mod error;
pub mod ledger;
pub mod processor;
pub mod progress;
pub mod queue;
pub mod registry;
pub mod scheduler;
pub mod stats;
pub mod strategy;
pub mod task;
pub mod worker_pool;

pub use audit::{AuditAction, AuditEvent, AuditSink, ChannelAuditSink, InMemoryAuditSink, build_audit_event};
pub use device::{Device, DeviceId, DeviceKind, DeviceRegistry};
pub use error::{AppResult, SchedulerError};
pub use ledger::{LedgerUsage, MemoryLedger, MemoryReservation};
pub use processor::{Metadata, Processor, ProcessorError, ProcessorRef, ProcessorRegistry, with_deadline};
pub use progress::{ProgressReporter, ProgressScope, ProgressSink, report_progress};
pub use queue::TaskQueue;
pub use registry::{CancelOutcome, RegistryTotals, TaskOutcome, TaskRegistry};
pub use scheduler::Scheduler;
pub use stats::{DeviceUtilization, SchedulerStats};
pub use strategy::{
    ChunkAssignment, DataParallel, DispatchContext, DispatchPlan, DispatchStrategy, Dispatched, Dispatcher,
    ModelParallel, SingleDevice, Strategy, resolve_strategy,
};
pub use task::{CompletionCallback, DispatchJob, Task, TaskId, TaskSnapshot, TaskStatus};
pub use worker_pool::{PoolStats, TaskHandler, WorkerPool};
