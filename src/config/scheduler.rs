//! Scheduler configuration.

use std::env;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::core::device::{Device, DeviceId, DeviceKind};
use crate::core::strategy::Strategy;

/// Default bound on queued tasks.
pub const DEFAULT_MAX_QUEUE_DEPTH: usize = 10_000;
/// Default worker thread stack size.
pub const DEFAULT_THREAD_STACK_SIZE: usize = 2 * 1024 * 1024;
/// Default number of terminal task snapshots kept.
pub const DEFAULT_RETENTION_LIMIT: usize = 1_000;

/// A device declared in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Device id, unique within the registry.
    pub id: DeviceId,
    /// Backend family.
    pub kind: DeviceKind,
    /// Display name.
    pub name: String,
    /// Memory budget in bytes.
    pub memory_total_bytes: u64,
}

impl From<&DeviceConfig> for Device {
    fn from(cfg: &DeviceConfig) -> Self {
        Self::new(cfg.id, cfg.kind, cfg.name.clone(), cfg.memory_total_bytes)
    }
}

/// Root scheduler configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Worker threads; defaults to the number of logical CPUs.
    pub worker_count: usize,
    /// Maximum queued tasks before submissions are rejected.
    pub max_queue_depth: usize,
    /// Strategy for tasks without a `strategy` metadata override.
    pub default_strategy: Option<Strategy>,
    /// Stack size of each worker thread, bytes.
    pub thread_stack_size: usize,
    /// Terminal task snapshots kept before the oldest are trimmed.
    pub retention_limit: usize,
    /// Devices to register; the host CPU is used when empty.
    pub devices: Vec<DeviceConfig>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_count: num_cpus::get().max(1),
            max_queue_depth: DEFAULT_MAX_QUEUE_DEPTH,
            default_strategy: None,
            thread_stack_size: DEFAULT_THREAD_STACK_SIZE,
            retention_limit: DEFAULT_RETENTION_LIMIT,
            devices: Vec::new(),
        }
    }
}

impl SchedulerConfig {
    /// Configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the worker count.
    #[must_use]
    pub const fn with_worker_count(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count;
        self
    }

    /// Set the queue bound.
    #[must_use]
    pub const fn with_max_queue_depth(mut self, depth: usize) -> Self {
        self.max_queue_depth = depth;
        self
    }

    /// Set the fallback strategy.
    #[must_use]
    pub const fn with_default_strategy(mut self, strategy: Strategy) -> Self {
        self.default_strategy = Some(strategy);
        self
    }

    /// Set the worker stack size.
    #[must_use]
    pub const fn with_thread_stack_size(mut self, bytes: usize) -> Self {
        self.thread_stack_size = bytes;
        self
    }

    /// Set the terminal snapshot retention limit.
    #[must_use]
    pub const fn with_retention_limit(mut self, limit: usize) -> Self {
        self.retention_limit = limit;
        self
    }

    /// Declare a device.
    #[must_use]
    pub fn with_device(mut self, id: DeviceId, kind: DeviceKind, name: impl Into<String>, memory_total_bytes: u64) -> Self {
        self.devices.push(DeviceConfig {
            id,
            kind,
            name: name.into(),
            memory_total_bytes,
        });
        self
    }

    /// Validate configuration values.
    ///
    /// # Errors
    ///
    /// A description of the first invalid field.
    pub fn validate(&self) -> Result<(), String> {
        if self.worker_count == 0 {
            return Err("worker_count must be greater than 0".into());
        }
        if self.max_queue_depth == 0 {
            return Err("max_queue_depth must be greater than 0".into());
        }
        if self.thread_stack_size < 64 * 1024 {
            return Err("thread_stack_size must be at least 64 KiB".into());
        }
        if self.retention_limit == 0 {
            return Err("retention_limit must be greater than 0".into());
        }
        let mut seen = std::collections::HashSet::new();
        for device in &self.devices {
            if !seen.insert(device.id) {
                return Err(format!("device id {} declared twice", device.id));
            }
            if device.memory_total_bytes == 0 {
                return Err(format!("device {} has a zero memory budget", device.id));
            }
        }
        Ok(())
    }

    /// Parse scheduler configuration from a JSON string and validate.
    ///
    /// # Errors
    ///
    /// Parse or validation failure.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Defaults overridden by `SCHEDULER_*` environment variables, after
    /// loading a `.env` file if one exists.
    ///
    /// Recognized: `SCHEDULER_WORKER_COUNT`, `SCHEDULER_MAX_QUEUE_DEPTH`,
    /// `SCHEDULER_DEFAULT_STRATEGY`, `SCHEDULER_THREAD_STACK_SIZE`,
    /// `SCHEDULER_RETENTION_LIMIT`. Unparseable values are logged and ignored.
    ///
    /// # Errors
    ///
    /// Validation failure of the resulting configuration.
    pub fn from_env() -> Result<Self, String> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Like [`SchedulerConfig::from_env`], reading variables through `lookup`.
    ///
    /// # Errors
    ///
    /// Validation failure of the resulting configuration.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, String> {
        fn parsed<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
            let raw = lookup(key).filter(|v| !v.trim().is_empty())?;
            let value = raw.trim().parse().ok();
            if value.is_none() {
                warn!(key, value = %raw, "ignoring unparseable environment value");
            }
            value
        }

        let mut cfg = Self::default();
        if let Some(v) = parsed(&lookup, "SCHEDULER_WORKER_COUNT") {
            cfg.worker_count = v;
        }
        if let Some(v) = parsed(&lookup, "SCHEDULER_MAX_QUEUE_DEPTH") {
            cfg.max_queue_depth = v;
        }
        if let Some(v) = parsed::<Strategy>(&lookup, "SCHEDULER_DEFAULT_STRATEGY") {
            cfg.default_strategy = Some(v);
        }
        if let Some(v) = parsed(&lookup, "SCHEDULER_THREAD_STACK_SIZE") {
            cfg.thread_stack_size = v;
        }
        if let Some(v) = parsed(&lookup, "SCHEDULER_RETENTION_LIMIT") {
            cfg.retention_limit = v;
        }
        cfg.validate()?;
        Ok(cfg)
    }

    /// Devices to register, falling back to the host CPU.
    #[must_use]
    pub fn build_devices(&self) -> Vec<Device> {
        if self.devices.is_empty() {
            vec![Device::host_cpu(0)]
        } else {
            self.devices.iter().map(Device::from).collect()
        }
    }
}
