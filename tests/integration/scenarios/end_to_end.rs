//! End-to-end scenarios over the whole access layer

use crate::integration::{MockMemcached, TestLayer};
use heimdall::core::backend::{Statement, WriteOp};
use heimdall::core::shard::PartitionKey;
use heimdall::service::{ReadOp, WriteRequest};
use std::time::{Duration, Instant};

#[tokio::test]
async fn test_read_split_follows_distribution() {
    let fixture = TestLayer::new();
    fixture.north.primary.set_ping_latency(Duration::from_millis(50));
    fixture.north.fallback.set_ping_latency(Duration::from_millis(1500));
    fixture.layer.probe_now().await;

    assert!(fixture.layer.registry().is_healthy("north.fallback"));

    let op = ReadOp::new(PartitionKey::named("Pune"), Statement::new("SELECT 1")).uncached();
    for _ in 0..1000 {
        fixture.layer.read(&op).await.unwrap();
    }

    let on_primary = fixture.north.primary.reads();
    assert!((665..=735).contains(&on_primary), "primary served {}", on_primary);
    assert_eq!(on_primary + fixture.north.fallback.reads(), 1000);
}

#[tokio::test]
async fn test_refused_remote_cache_fails_fast_and_counts_each_attempt() {
    let fixture = TestLayer::with_remote("127.0.0.1:1");
    let layer = &fixture.layer;

    for attempt in 1..=3u64 {
        let start = Instant::now();
        assert!(layer.cache_get(&format!("uncached:{}", attempt)).await.is_none());
        assert!(start.elapsed() < Duration::from_millis(500));
        assert_eq!(layer.metrics().failover_count(), attempt);
    }
}

#[tokio::test]
async fn test_unknown_district_routes_to_default_group() {
    let fixture = TestLayer::new();
    let op = ReadOp::new(
        PartitionKey::named("UnknownDistrict"),
        Statement::new("SELECT * FROM schools"),
    )
    .uncached();

    fixture.layer.read(&op).await.expect("unmapped key is not an error");

    assert_eq!(fixture.north.primary.reads() + fixture.north.fallback.reads(), 1);
    assert_eq!(fixture.south.primary.reads() + fixture.south.fallback.reads(), 0);
    assert_eq!(fixture.layer.metrics().snapshot().unmapped_shard_keys, 1);
}

#[tokio::test]
async fn test_round_trip_with_both_tiers_healthy() {
    let mock = MockMemcached::new().await.unwrap();
    let fixture = TestLayer::with_remote(mock.addr());
    fixture.layer.probe_now().await;

    for i in 0..20 {
        let key = format!("submission:{}", i);
        let value = format!("payload-{}", i).into_bytes();
        fixture.layer.cache_set(&key, value.clone(), None).await;
        assert_eq!(fixture.layer.cache_get(&key).await, Some(value));
    }
}

#[tokio::test]
async fn test_outage_and_recovery_cycle() {
    let fixture = TestLayer::new();
    let layer = &fixture.layer;
    let write = || {
        WriteRequest::new(
            PartitionKey::named("Madurai"),
            WriteOp::statement(Statement::new("INSERT INTO attendance VALUES (1)")),
        )
    };

    fixture.south.primary.set_ping_fails(true);
    for _ in 0..3 {
        layer.probe_now().await;
    }
    let during = layer.write(&write()).await.unwrap();
    assert_eq!(during.backend, "south.fallback");

    fixture.south.primary.set_ping_fails(false);
    layer.probe_now().await;
    let after = layer.write(&write()).await.unwrap();
    assert_eq!(after.backend, "south.primary");

    // The write taken during the outage reaches the primary on reconciliation
    let report = layer.reconcile_now().await;
    assert_eq!(report.repaired, 1);
    assert_eq!(fixture.south.primary.applied().len(), 2);
}
