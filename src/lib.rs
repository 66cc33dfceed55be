//! # Prometheus Device Scheduler
//!
//! Device-aware task scheduling for AI video processing workloads.
//!
//! Work arrives as tasks carrying an opaque processor, a priority and a
//! memory estimate. The scheduler queues them by priority, runs them on a
//! fixed pool of OS worker threads, and binds each execution to one or more
//! compute devices (CPU, CUDA, Metal, OpenCL) chosen from live telemetry.
//! A logical memory ledger keeps per-device reservations within budget.
//!
//! ## Key Features
//!
//! - **Priority queue**: highest priority first, FIFO among equals
//! - **Device scoring**: free memory, idle time and thermal headroom
//! - **Memory ledger**: per-device budgets with minimum LRU eviction
//! - **Dispatch strategies**: single device, data-parallel chunking, and a
//!   model-parallel extension point
//! - **Lifecycle tracking**: status, cancellation, completion callbacks,
//!   blocking and async waits, audit events
//!
//! ## Example
//!
//! ```rust,ignore
//! use prometheus_device_scheduler::builders::build_scheduler;
//! use prometheus_device_scheduler::config::SchedulerConfig;
//! use prometheus_device_scheduler::core::{DeviceKind, Strategy, Task};
//! use serde_json::json;
//! use std::time::Duration;
//!
//! let scheduler = build_scheduler(
//!     &SchedulerConfig::new()
//!         .with_worker_count(4)
//!         .with_device(0, DeviceKind::Cuda, "cuda:0", 24 << 30)
//!         .with_device(1, DeviceKind::Cuda, "cuda:1", 24 << 30),
//! )?;
//! scheduler.start()?;
//!
//! let id = scheduler.submit(
//!     Task::new("denoise-clip")
//!         .with_priority(5)
//!         .with_strategy(Strategy::DataParallel)
//!         .with_memory_estimate(8 << 30)
//!         .with_input(json!(["f0", "f1", "f2", "f3"]))
//!         .with_processor(|frames, meta| Ok(frames)),
//! )?;
//!
//! let snapshot = scheduler.wait(&id, Duration::from_secs(60))?;
//! println!("{:?} on devices {:?}", snapshot.status, snapshot.devices);
//! scheduler.stop();
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Core scheduling abstractions, device accounting and the scheduler facade.
pub mod core;
/// Configuration models for the scheduler and its devices.
pub mod config;
/// Builders to construct a scheduler from configuration.
pub mod builders;
/// API surface and runtime adapters.
pub mod runtime;
/// Shared utilities.
pub mod util;
