//! Compute device registry: static description, live telemetry, and scoring.
//!
//! The registry is the only place device telemetry lives. Selection reads a
//! consistent snapshot under a read lock; telemetry refresh takes the write
//! lock for a handful of field stores and nothing else.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::ledger::MemoryLedger;

/// Identifier of a compute device.
pub type DeviceId = u32;

/// Temperature above which a device earns no thermal score.
const THERMAL_CEILING_C: f64 = 85.0;

/// Default memory budget assumed for the host CPU device.
const HOST_CPU_MEMORY_BYTES: u64 = 16 * 1024 * 1024 * 1024;

/// Backend family of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    /// Host processor.
    Cpu,
    /// NVIDIA CUDA device.
    Cuda,
    /// Apple Metal device.
    Metal,
    /// OpenCL device.
    OpenCl,
}

impl DeviceKind {
    /// Lower-case name used in metadata and logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::Cuda => "cuda",
            Self::Metal => "metal",
            Self::OpenCl => "open_cl",
        }
    }
}

/// A compute device and its most recent telemetry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    /// Stable device identifier.
    pub id: DeviceId,
    /// Backend family.
    pub kind: DeviceKind,
    /// Human-readable name.
    pub name: String,
    /// Total memory budget in bytes.
    pub memory_total: u64,
    /// Memory in use in bytes, never above `memory_total`.
    pub memory_used: u64,
    /// Utilization in percent, within `[0, 100]`.
    pub utilization_percent: f64,
    /// Temperature in degrees Celsius.
    pub temperature_c: f64,
    /// Whether the device may receive work.
    pub available: bool,
}

impl Device {
    /// Create an idle, available device.
    pub fn new(id: DeviceId, kind: DeviceKind, name: impl Into<String>, memory_total: u64) -> Self {
        Self {
            id,
            kind,
            name: name.into(),
            memory_total,
            memory_used: 0,
            utilization_percent: 0.0,
            temperature_c: 0.0,
            available: true,
        }
    }

    /// Describe the host CPU as a device.
    #[must_use]
    pub fn host_cpu(id: DeviceId) -> Self {
        Self::new(
            id,
            DeviceKind::Cpu,
            format!("host-cpu ({} cores)", num_cpus::get()),
            HOST_CPU_MEMORY_BYTES,
        )
    }

    /// Bytes not yet in use.
    #[must_use]
    pub const fn free_memory(&self) -> u64 {
        self.memory_total.saturating_sub(self.memory_used)
    }

    /// Selection score in `[0, 1]`; higher is better.
    ///
    /// Weighted 0.5 free memory fraction, 0.3 idle fraction, 0.2 thermal headroom.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn score(&self) -> f64 {
        let memory_term = if self.memory_total == 0 {
            0.0
        } else {
            1.0 - self.memory_used as f64 / self.memory_total as f64
        };
        let utilization_term = 1.0 - self.utilization_percent / 100.0;
        let thermal_term = ((THERMAL_CEILING_C - self.temperature_c) / THERMAL_CEILING_C).max(0.0);
        0.5 * memory_term + 0.3 * utilization_term + 0.2 * thermal_term
    }
}

/// Registry of known devices.
///
/// Owns the [`MemoryLedger`] whose reservations feed into each device's
/// reported `memory_used`.
pub struct DeviceRegistry {
    /// Devices keyed by id; `BTreeMap` keeps iteration in ascending id order.
    devices: RwLock<BTreeMap<DeviceId, Device>>,
    ledger: Arc<MemoryLedger>,
}

impl DeviceRegistry {
    /// Build a registry (and its ledger) from an initial device list.
    ///
    /// Later entries with a duplicate id replace earlier ones.
    #[must_use]
    pub fn new(devices: Vec<Device>) -> Self {
        let ledger = Arc::new(MemoryLedger::new());
        let mut map = BTreeMap::new();
        for mut device in devices {
            device.memory_used = device.memory_used.min(device.memory_total);
            ledger.register_device(device.id, device.memory_total);
            map.insert(device.id, device);
        }
        debug!(device_count = map.len(), "device registry initialized");
        Self {
            devices: RwLock::new(map),
            ledger,
        }
    }

    /// The memory ledger tracking reservations on these devices.
    #[must_use]
    pub const fn ledger(&self) -> &Arc<MemoryLedger> {
        &self.ledger
    }

    /// Snapshot copy of every known device, ascending by id.
    #[must_use]
    pub fn list_devices(&self) -> Vec<Device> {
        let devices = self.devices.read();
        devices.values().map(|d| self.effective(d)).collect()
    }

    /// Snapshot of one device.
    #[must_use]
    pub fn get(&self, id: DeviceId) -> Option<Device> {
        let devices = self.devices.read();
        devices.get(&id).map(|d| self.effective(d))
    }

    /// Number of devices currently accepting work.
    #[must_use]
    pub fn available_count(&self) -> usize {
        self.devices.read().values().filter(|d| d.available).count()
    }

    /// Update live telemetry for a device.
    ///
    /// Utilization is clamped to `[0, 100]` and memory to the device total.
    /// An unknown id is logged and ignored.
    pub fn refresh_telemetry(
        &self,
        id: DeviceId,
        utilization_percent: f64,
        temperature_c: f64,
        memory_used_external: u64,
    ) {
        let mut devices = self.devices.write();
        let Some(device) = devices.get_mut(&id) else {
            warn!(device_id = id, "telemetry for unknown device ignored");
            return;
        };
        device.utilization_percent = if utilization_percent.is_nan() {
            0.0
        } else {
            utilization_percent.clamp(0.0, 100.0)
        };
        device.temperature_c = temperature_c;
        device.memory_used = memory_used_external.min(device.memory_total);
    }

    /// Mark a device available or unavailable. Returns `false` for unknown ids.
    pub fn set_available(&self, id: DeviceId, available: bool) -> bool {
        let mut devices = self.devices.write();
        devices.get_mut(&id).is_some_and(|device| {
            device.available = available;
            debug!(device_id = id, available, "device availability changed");
            true
        })
    }

    /// Pick the best available device with at least `required_bytes` free.
    ///
    /// `required_bytes == 0` disables the memory filter. Ties go to the lowest id.
    /// `None` means no device qualifies right now.
    #[must_use]
    pub fn select_best(&self, required_bytes: u64) -> Option<Device> {
        let devices = self.devices.read();
        let mut best: Option<(f64, Device)> = None;
        for device in devices.values().filter(|d| d.available) {
            let snapshot = self.effective(device);
            if required_bytes > 0 && snapshot.free_memory() < required_bytes {
                continue;
            }
            let score = snapshot.score();
            // Strictly greater keeps the earlier (lower) id on ties.
            if best.as_ref().is_none_or(|(top, _)| score > *top) {
                best = Some((score, snapshot));
            }
        }
        best.map(|(_, device)| device)
    }

    /// Every available device, best score first, ties by ascending id.
    #[must_use]
    pub fn rank_available(&self) -> Vec<Device> {
        let mut ranked: Vec<(f64, Device)> = {
            let devices = self.devices.read();
            devices
                .values()
                .filter(|d| d.available)
                .map(|d| {
                    let snapshot = self.effective(d);
                    (snapshot.score(), snapshot)
                })
                .collect()
        };
        ranked.sort_by(|(sa, a), (sb, b)| sb.total_cmp(sa).then(a.id.cmp(&b.id)));
        ranked.into_iter().map(|(_, d)| d).collect()
    }

    /// Device view with ledger reservations folded into `memory_used`.
    fn effective(&self, device: &Device) -> Device {
        let mut snapshot = device.clone();
        if let Some(usage) = self.ledger.usage(device.id) {
            snapshot.memory_used = snapshot
                .memory_used
                .max(usage.used_bytes)
                .min(snapshot.memory_total);
        }
        snapshot
    }
}

impl Default for DeviceRegistry {
    /// A registry holding only the host CPU as device 0.
    fn default() -> Self {
        Self::new(vec![Device::host_cpu(0)])
    }
}
