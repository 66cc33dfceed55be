//! Tests for audit sinks

use prometheus_device_scheduler::core::{AuditAction, AuditSink, InMemoryAuditSink, build_audit_event};

#[test]
fn test_in_memory_audit_sink() {
    let sink = InMemoryAuditSink::new(10);

    let event = build_audit_event("task1", AuditAction::Submitted, Some("priority=5".to_string()));
    sink.record(event.clone());
    assert_eq!(sink.events().len(), 1);

    let events = sink.events();
    assert_eq!(events[0], event);
    assert_eq!(events[0].task_id, "task1");
    assert_eq!(events[0].action, AuditAction::Submitted);
    assert!(uuid::Uuid::parse_str(&events[0].event_id).is_ok());
}

#[test]
fn test_audit_sink_overflow() {
    let sink = InMemoryAuditSink::new(2);

    sink.record(build_audit_event("t1", AuditAction::Submitted, None));
    sink.record(build_audit_event("t1", AuditAction::Started, None));
    sink.record(build_audit_event("t1", AuditAction::Completed, None));

    let actions: Vec<AuditAction> = sink.events().into_iter().map(|e| e.action).collect();
    assert_eq!(actions, vec![AuditAction::Started, AuditAction::Completed]);
}

#[test]
fn test_audit_action_serializes_snake_case() {
    let json = serde_json::to_value(AuditAction::Cancelled).unwrap();
    assert_eq!(json, serde_json::json!("cancelled"));
    assert_eq!(AuditAction::Failed.to_string(), "failed");
}
