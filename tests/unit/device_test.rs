//! Tests for device scoring and selection

use prometheus_device_scheduler::core::{Device, DeviceKind, DeviceRegistry};

fn gpu(id: u32, total: u64) -> Device {
    Device::new(id, DeviceKind::Cuda, format!("cuda:{id}"), total)
}

#[test]
fn test_score_weights() {
    let idle = gpu(0, 1_000);
    assert!((idle.score() - 1.0).abs() < 1e-9);

    let mut hot = gpu(1, 1_000);
    hot.memory_used = 500;
    hot.utilization_percent = 50.0;
    hot.temperature_c = 85.0;
    // 0.5 * 0.5 + 0.3 * 0.5 + 0.2 * 0.0
    assert!((hot.score() - 0.4).abs() < 1e-9);
}

#[test]
fn test_selection_prefers_idle_device() {
    let registry = DeviceRegistry::new(vec![gpu(0, 1_000), gpu(1, 1_000)]);
    registry.refresh_telemetry(0, 90.0, 70.0, 0);
    assert_eq!(registry.select_best(0).unwrap().id, 1);

    let ranked: Vec<u32> = registry.rank_available().iter().map(|d| d.id).collect();
    assert_eq!(ranked, vec![1, 0]);
}

#[test]
fn test_selection_respects_reservations() {
    let registry = DeviceRegistry::new(vec![gpu(0, 1_000), gpu(1, 400)]);
    assert!(registry.ledger().try_reserve(0, "big", 800));

    // Device 0 has 200 bytes left, device 1 has 400.
    assert_eq!(registry.select_best(300).unwrap().id, 1);
    assert!(registry.select_best(500).is_none());
    assert_eq!(registry.get(0).unwrap().memory_used, 800);

    registry.ledger().release(0, "big");
    assert_eq!(registry.select_best(500).unwrap().id, 0);
}

#[test]
fn test_telemetry_is_clamped() {
    let registry = DeviceRegistry::new(vec![gpu(0, 1_000)]);
    registry.refresh_telemetry(0, 250.0, 40.0, 5_000);
    let device = registry.get(0).unwrap();
    assert!((device.utilization_percent - 100.0).abs() < f64::EPSILON);
    assert_eq!(device.memory_used, 1_000);

    // Unknown ids are ignored.
    registry.refresh_telemetry(42, 10.0, 10.0, 0);
    assert!(!registry.set_available(42, false));
}

#[test]
fn test_host_cpu_device() {
    let cpu = Device::host_cpu(7);
    assert_eq!(cpu.kind, DeviceKind::Cpu);
    assert!(cpu.available);
    assert!(cpu.memory_total > 0);
    assert_eq!(DeviceKind::OpenCl.as_str(), "open_cl");
}
