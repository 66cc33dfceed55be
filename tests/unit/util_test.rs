//! Tests for shared utilities

use prometheus_device_scheduler::util::{DEFAULT_LOG_DIRECTIVE, elapsed_secs, init_tracing, now_ms};

#[test]
fn test_now_ms_is_after_2020() {
    assert!(now_ms() > 1_577_836_800_000);
}

#[test]
fn test_elapsed_secs_saturates() {
    assert!((elapsed_secs(1_000, 3_500) - 2.5).abs() < 1e-9);
    assert!(elapsed_secs(5_000, 1_000).abs() < f64::EPSILON);
}

#[test]
fn test_init_tracing_is_idempotent() {
    init_tracing(DEFAULT_LOG_DIRECTIVE);
    init_tracing("debug");
    tracing::info!("tracing initialized twice without panicking");
}
