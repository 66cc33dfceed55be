//! Configuration models for the scheduler and its devices.

pub mod scheduler;

pub use scheduler::{DeviceConfig, SchedulerConfig};
