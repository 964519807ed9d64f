//! Health monitoring integration tests
//!
//! Probe classification, status reporting and policy recomputation

use crate::integration::TestLayer;
use heimdall::core::replica::BackendStatus;
use heimdall::service::{AccessLayer, LayerStats};
use std::time::Duration;

fn status_of(stats: &LayerStats, name: &str) -> BackendStatus {
    stats
        .health
        .iter()
        .find(|backend| backend.name == name)
        .map(|backend| backend.status)
        .unwrap()
}

fn read_pct(layer: &AccessLayer, group: &str) -> u8 {
    layer
        .get_stats()
        .distribution
        .iter()
        .find(|d| d.shard_group == group)
        .map(|d| d.policy.read_distribution_pct)
        .unwrap()
}

#[tokio::test]
async fn test_consecutive_failures_mark_unhealthy_and_one_success_recovers() {
    let fixture = TestLayer::new();
    let layer = &fixture.layer;
    fixture.south.primary.set_ping_fails(true);

    layer.probe_now().await;
    layer.probe_now().await;
    assert!(layer.registry().is_healthy("south.primary"));

    layer.probe_now().await;
    assert!(!layer.registry().is_healthy("south.primary"));
    assert_eq!(status_of(&layer.get_stats(), "south.primary"), BackendStatus::Degraded);

    fixture.south.primary.set_ping_fails(false);
    layer.probe_now().await;
    let state = layer.registry().get("south.primary").unwrap();
    assert!(state.healthy);
    assert_eq!(state.consecutive_failures, 0);
    assert!(state.last_failed_at.is_some());
}

#[tokio::test]
async fn test_latency_ceiling_breach_is_immediate() {
    let fixture = TestLayer::new();
    // Primary ceiling is 1000ms, probe timeout 2000ms
    fixture.north.primary.set_ping_latency(Duration::from_millis(1200));

    fixture.layer.probe_now().await;

    let state = fixture.layer.registry().get("north.primary").unwrap();
    assert!(!state.healthy);
    assert!((state.latency_ms.unwrap() - 1200.0).abs() < 0.01);
}

#[tokio::test]
async fn test_probe_timeout_counts_as_failure() {
    let fixture = TestLayer::new();
    fixture.north.fallback.set_ping_latency(Duration::from_secs(5));

    fixture.layer.probe_now().await;

    let state = fixture.layer.registry().get("north.fallback").unwrap();
    assert_eq!(state.consecutive_failures, 1);
    assert!(state.healthy);
}

#[tokio::test]
async fn test_slow_primary_shifts_reads_to_secondaries() {
    let fixture = TestLayer::new();
    fixture.north.primary.set_ping_latency(Duration::from_millis(600));

    fixture.layer.probe_now().await;

    assert_eq!(read_pct(&fixture.layer, "north"), 60);
    assert_eq!(read_pct(&fixture.layer, "south"), 70);
}

#[tokio::test]
async fn test_unhealthy_secondary_keeps_reads_on_primary() {
    let fixture = TestLayer::new();
    fixture.south.fallback.set_ping_fails(true);
    for _ in 0..3 {
        fixture.layer.probe_now().await;
    }
    assert_eq!(read_pct(&fixture.layer, "south"), 100);

    let op = heimdall::ReadOp::new(
        heimdall::PartitionKey::named("Madurai"),
        heimdall::Statement::new("SELECT 1"),
    )
    .uncached();
    for _ in 0..20 {
        fixture.layer.read(&op).await.unwrap();
    }
    assert_eq!(fixture.south.primary.reads(), 20);
}

#[tokio::test]
async fn test_background_monitor_probes_on_interval() {
    let mut config = TestLayer::config();
    config.health.interval_secs = 1;
    let fixture = TestLayer::build(config, None);
    fixture.north.primary.set_ping_latency(Duration::from_millis(7));

    let tasks = fixture.layer.start();
    // The first tick fires immediately
    tokio::time::timeout(Duration::from_secs(2), async {
        while fixture.layer.registry().get("north.primary").unwrap().latency_ms.is_none() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("monitor probed");
    tasks.shutdown().await;

    let latency = fixture.layer.registry().get("north.primary").unwrap().latency_ms;
    assert!((latency.unwrap() - 7.0).abs() < 0.01);
}

#[tokio::test]
async fn test_stats_report_every_backend() {
    let fixture = TestLayer::new();
    fixture.layer.probe_now().await;

    let stats = fixture.layer.get_stats();
    assert_eq!(stats.health.len(), 4);
    assert_eq!(stats.backends.len(), 4);
    assert!(stats.remote_cache.is_none());
    assert!(stats
        .health
        .iter()
        .all(|backend| backend.status == BackendStatus::Healthy && backend.state.is_some()));
    // Stats are meant for a status endpoint
    assert!(serde_json::to_string(&stats).is_ok());
}
