//! Periodic device telemetry refresh on a tokio runtime.
//!
//! A [`TelemetryProbe`] reads live utilization, temperature and memory for
//! each device (NVML, Metal counters, `/proc`, ...). The monitor task samples
//! it on an interval and feeds every reading into the [`DeviceRegistry`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::core::{DeviceId, DeviceRegistry};

/// One telemetry reading for one device.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DeviceSample {
    /// Device the reading belongs to.
    pub device_id: DeviceId,
    /// Utilization, percent.
    pub utilization_percent: f64,
    /// Temperature, Celsius.
    pub temperature_c: f64,
    /// Memory in use as reported by the driver, bytes.
    pub memory_used_bytes: u64,
    /// Whether the device should accept work; `None` leaves it unchanged.
    pub available: Option<bool>,
}

/// Source of device telemetry.
#[async_trait]
pub trait TelemetryProbe: Send + Sync {
    /// Read current telemetry for every device the probe knows about.
    async fn sample(&self) -> Vec<DeviceSample>;
}

/// Apply a batch of samples to the registry.
pub fn apply_samples(registry: &DeviceRegistry, samples: &[DeviceSample]) {
    for sample in samples {
        registry.refresh_telemetry(
            sample.device_id,
            sample.utilization_percent,
            sample.temperature_c,
            sample.memory_used_bytes,
        );
        if let Some(available) = sample.available {
            if !registry.set_available(sample.device_id, available) {
                warn!(device_id = sample.device_id, "availability for unknown device ignored");
            }
        }
    }
}

/// Handle to a running telemetry monitor.
pub struct MonitorHandle {
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl MonitorHandle {
    /// Stop the monitor and wait for its task to finish.
    pub async fn shutdown(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Err(e) = (&mut self.task).await {
            warn!(error = %e, "telemetry monitor ended abnormally");
        }
    }

    /// Whether the monitor task has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Spawn a task that samples `probe` every `interval` and refreshes `registry`.
///
/// The first sample is taken immediately. Must be called inside a tokio runtime.
pub fn spawn_telemetry_monitor(
    registry: Arc<DeviceRegistry>,
    probe: Arc<dyn TelemetryProbe>,
    interval: Duration,
) -> MonitorHandle {
    let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        info!(interval_ms = interval.as_millis(), "telemetry monitor started");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = &mut stop_rx => break,
                _ = ticker.tick() => {
                    let samples = probe.sample().await;
                    debug!(samples = samples.len(), "telemetry sampled");
                    apply_samples(&registry, &samples);
                }
            }
        }
        info!("telemetry monitor stopped");
    });
    MonitorHandle {
        stop: Some(stop_tx),
        task,
    }
}
