//! Failover integration tests
//!
//! Read retry, write failover, mirroring and reconciliation against mock backends

use crate::integration::{FailureMode, MockBackend, TestLayer};
use heimdall::core::backend::{Statement, WriteOp};
use heimdall::core::shard::PartitionKey;
use heimdall::service::{AccessError, AccessLayer, ReadOp, WriteRequest};
use std::time::Duration;

fn pune_read() -> ReadOp {
    ReadOp::new(
        PartitionKey::named("Pune"),
        Statement::new("SELECT * FROM submissions WHERE district = $1"),
    )
    .uncached()
}

fn pune_write() -> WriteRequest {
    WriteRequest::new(
        PartitionKey::named("Pune"),
        WriteOp::statement(Statement::new("UPDATE submissions SET synced = true")),
    )
}

async fn fail_probes(layer: &AccessLayer, backend: &MockBackend, rounds: usize) {
    backend.set_ping_fails(true);
    for _ in 0..rounds {
        layer.probe_now().await;
    }
}

async fn wait_for_applied(backend: &MockBackend, count: usize) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while backend.applied().len() < count {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("mirror write landed");
}

fn served_by(rows: &heimdall::Rows) -> String {
    rows.records[0]["served_by"].as_str().unwrap().to_string()
}

// ============================================================================
// Read Failover Tests
// ============================================================================

#[tokio::test]
async fn test_read_retries_once_on_alternate() {
    let fixture = TestLayer::new();
    fixture.north.primary.set_read_failure(FailureMode::Transient);

    // The first read of a fresh router is routed to the primary
    let rows = fixture.layer.read(&pune_read()).await.unwrap();
    assert_eq!(served_by(&rows), "north.fallback");

    let metrics = fixture.layer.metrics().snapshot();
    assert_eq!(metrics.read_retries, 1);
    assert_eq!(metrics.failover_count, 1);
}

#[tokio::test]
async fn test_rejected_read_is_not_retried() {
    let fixture = TestLayer::new();
    fixture.north.primary.set_read_failure(FailureMode::Rejected);

    let result = fixture.layer.read(&pune_read()).await;
    assert!(matches!(result, Err(AccessError::InvalidOperation(_))));
    assert_eq!(fixture.north.fallback.reads(), 0);
    assert_eq!(fixture.layer.metrics().snapshot().read_retries, 0);
}

#[tokio::test]
async fn test_read_fails_when_both_tiers_are_down() {
    let fixture = TestLayer::new();
    fixture.north.primary.set_read_failure(FailureMode::Transient);
    fixture.north.fallback.set_read_failure(FailureMode::Transient);

    let result = fixture.layer.read(&pune_read()).await;
    assert!(matches!(result, Err(AccessError::BackendUnavailable(_))));
    // Exactly one retry, no loop
    assert_eq!(fixture.layer.metrics().snapshot().read_retries, 1);
}

#[tokio::test]
async fn test_unhealthy_primary_sends_reads_to_fallback() {
    let fixture = TestLayer::new();
    fail_probes(&fixture.layer, &fixture.north.primary, 3).await;

    for _ in 0..20 {
        fixture.layer.read(&pune_read()).await.unwrap();
    }
    assert_eq!(fixture.north.primary.reads(), 0);
    assert_eq!(fixture.north.fallback.reads(), 20);
}

// ============================================================================
// Write Failover Tests
// ============================================================================

#[tokio::test]
async fn test_write_goes_to_primary_and_mirrors_to_fallback() {
    let fixture = TestLayer::new();
    let request = pune_write();

    let result = fixture.layer.write(&request).await.unwrap();
    assert_eq!(result.backend, "north.primary");
    assert!(!result.degraded);

    wait_for_applied(&fixture.north.fallback, 1).await;
    assert_eq!(fixture.north.primary.applied(), vec![request.op.idempotency_key]);
    assert_eq!(fixture.north.fallback.applied(), vec![request.op.idempotency_key]);
    assert_eq!(fixture.layer.metrics().snapshot().failover_count, 0);
}

#[tokio::test]
async fn test_write_fails_over_and_repairs_primary() {
    let fixture = TestLayer::new();
    let layer = &fixture.layer;
    fail_probes(layer, &fixture.north.primary, 3).await;

    let request = pune_write();
    let result = layer.write(&request).await.unwrap();
    assert_eq!(result.backend, "north.fallback");

    let metrics = layer.metrics().snapshot();
    assert_eq!(metrics.failover_count, 1);
    assert_eq!(metrics.mirror_failures, 1);
    assert_eq!(layer.get_stats().pending_mirrors, 1);

    // Still down: the pending write waits
    let report = layer.reconcile_now().await;
    assert_eq!(report.deferred, 1);
    assert!(fixture.north.primary.applied().is_empty());

    fixture.north.primary.set_ping_fails(false);
    layer.probe_now().await;
    let report = layer.reconcile_now().await;
    assert_eq!(report.repaired, 1);
    assert_eq!(fixture.north.primary.applied(), vec![request.op.idempotency_key]);
    assert_eq!(layer.get_stats().pending_mirrors, 0);
}

#[tokio::test]
async fn test_replayed_write_is_deduplicated() {
    let fixture = TestLayer::new();
    let request = pune_write();

    let first = fixture.layer.write(&request).await.unwrap();
    let second = fixture.layer.write(&request).await.unwrap();

    assert!(!first.outcome.deduplicated);
    assert!(second.outcome.deduplicated);
    assert_eq!(fixture.north.primary.applied().len(), 1);
}

#[tokio::test]
async fn test_no_healthy_write_target_serves_degraded_unless_fail_fast() {
    let fixture = TestLayer::new();
    let layer = &fixture.layer;
    fixture.north.fallback.set_ping_fails(true);
    fail_probes(layer, &fixture.north.primary, 3).await;

    let degraded = layer.write(&pune_write()).await.unwrap();
    assert!(degraded.degraded);
    assert_eq!(layer.metrics().snapshot().degraded_writes, 1);

    let result = layer.write(&pune_write().fail_fast()).await;
    assert!(matches!(result, Err(AccessError::BackendUnavailable(_))));
    assert_eq!(layer.metrics().snapshot().degraded_writes, 1);
}

#[tokio::test]
async fn test_rejected_write_is_surfaced() {
    let fixture = TestLayer::new();
    fixture.north.primary.set_write_failure(FailureMode::Rejected);

    let result = fixture.layer.write(&pune_write()).await;
    assert!(matches!(result, Err(AccessError::InvalidOperation(_))));
    assert!(fixture.north.fallback.applied().is_empty());
}

// ============================================================================
// Operator Exclusion Tests
// ============================================================================

#[tokio::test]
async fn test_inactive_backend_is_excluded_from_routing() {
    let fixture = TestLayer::new();
    let layer = &fixture.layer;
    assert!(layer.set_backend_active("north.primary", false));

    for _ in 0..10 {
        layer.read(&pune_read()).await.unwrap();
    }
    assert_eq!(fixture.north.primary.reads(), 0);

    let result = layer.write(&pune_write()).await.unwrap();
    assert_eq!(result.backend, "north.fallback");

    // Probes keep succeeding but never bring it back
    layer.probe_now().await;
    layer.read(&pune_read()).await.unwrap();
    assert_eq!(fixture.north.primary.reads(), 0);
    // An excluded peer is not a mirror target
    assert_eq!(layer.get_stats().pending_mirrors, 0);
}
