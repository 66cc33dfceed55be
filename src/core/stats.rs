//! Pull-model scheduler statistics.

use serde::{Deserialize, Serialize};

use crate::core::device::{DeviceId, DeviceKind, DeviceRegistry};
use crate::core::registry::TaskRegistry;
use crate::core::worker_pool::PoolStats;
use crate::util::clock;

/// Point-in-time view of one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceUtilization {
    /// Device id.
    pub device_id: DeviceId,
    /// Device name.
    pub name: String,
    /// Backend family.
    pub kind: DeviceKind,
    /// Whether the device accepts work.
    pub available: bool,
    /// Reported utilization, percent.
    pub utilization_percent: f64,
    /// Bytes in use, telemetry and ledger combined.
    pub memory_used: u64,
    /// Memory budget.
    pub memory_total: u64,
    /// Active ledger reservations.
    pub reservations: usize,
}

/// Aggregate scheduler statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerStats {
    /// Tasks accepted since start.
    pub total_submitted: u64,
    /// Tasks completed.
    pub completed: u64,
    /// Tasks failed.
    pub failed: u64,
    /// Tasks cancelled.
    pub cancelled: u64,
    /// Tasks waiting to run.
    pub pending: usize,
    /// Tasks executing.
    pub running: usize,
    /// Completed tasks per second of scheduler uptime.
    pub throughput_per_second: f64,
    /// Mean submission-to-completion latency of completed tasks.
    pub avg_latency_seconds: f64,
    /// One entry per device, ascending id.
    pub per_device_utilization: Vec<DeviceUtilization>,
    /// Seconds since the scheduler was created.
    pub uptime_seconds: f64,
    /// Worker pool counters, if the pool is running.
    pub pool: Option<PoolStats>,
}

impl SchedulerStats {
    #[allow(clippy::cast_precision_loss)]
    pub(crate) fn collect(
        registry: &TaskRegistry,
        devices: &DeviceRegistry,
        started_at_ms: u64,
        pool: Option<PoolStats>,
    ) -> Self {
        let totals = registry.totals();
        let (pending, running) = registry.in_flight();
        let uptime_seconds = clock::elapsed_secs(started_at_ms, clock::now_ms());

        let throughput_per_second = if uptime_seconds > 0.0 {
            totals.completed as f64 / uptime_seconds
        } else {
            0.0
        };
        let avg_latency_seconds = if totals.completed == 0 {
            0.0
        } else {
            totals.completed_latency_ms as f64 / 1000.0 / totals.completed as f64
        };

        let ledger = devices.ledger();
        let per_device_utilization = devices
            .list_devices()
            .into_iter()
            .map(|d| DeviceUtilization {
                reservations: ledger.usage(d.id).map_or(0, |u| u.reservation_count),
                device_id: d.id,
                name: d.name,
                kind: d.kind,
                available: d.available,
                utilization_percent: d.utilization_percent,
                memory_used: d.memory_used,
                memory_total: d.memory_total,
            })
            .collect();

        Self {
            total_submitted: totals.submitted,
            completed: totals.completed,
            failed: totals.failed,
            cancelled: totals.cancelled,
            pending,
            running,
            throughput_per_second,
            avg_latency_seconds,
            per_device_utilization,
            uptime_seconds,
            pool,
        }
    }
}
