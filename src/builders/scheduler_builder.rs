//! Build a [`Scheduler`] from a [`SchedulerConfig`].

use std::sync::Arc;

use tracing::info;

use crate::config::SchedulerConfig;
use crate::core::{DeviceRegistry, Scheduler, SchedulerError};

/// Validate `cfg`, register its devices (or the host CPU when none are
/// declared), and create a stopped scheduler over them.
///
/// # Errors
///
/// `InvalidTask` describing the invalid configuration field.
pub fn build_scheduler(cfg: &SchedulerConfig) -> Result<Scheduler, SchedulerError> {
    cfg.validate()
        .map_err(|e| SchedulerError::InvalidTask(format!("config invalid: {e}")))?;

    let devices = Arc::new(DeviceRegistry::new(cfg.build_devices()));
    info!(
        worker_count = cfg.worker_count,
        max_queue_depth = cfg.max_queue_depth,
        devices = devices.list_devices().len(),
        default_strategy = ?cfg.default_strategy,
        "building scheduler"
    );
    Ok(Scheduler::new(cfg, devices))
}
