//! Tiered cache integration tests
//!
//! The remote tier is a real `MemcachedRemote` talking to the mock server

use crate::integration::{MockMemcached, MockMemcachedBuilder, ResponseMode, TestLayer};
use heimdall::core::backend::Statement;
use heimdall::core::cache::Tier;
use heimdall::core::health::REMOTE_CACHE_TARGET;
use heimdall::core::shard::PartitionKey;
use heimdall::service::{ReadOp, WriteRequest};
use heimdall::WriteOp;
use std::time::{Duration, Instant};

// ============================================================================
// Remote Tier Tests
// ============================================================================

#[tokio::test]
async fn test_set_then_get_round_trip_through_remote() {
    let mock = MockMemcached::new().await.unwrap();
    let fixture = TestLayer::with_remote(mock.addr());
    let layer = &fixture.layer;

    let tier = layer
        .cache_set("assessment:42", b"{\"score\":17}".to_vec(), None)
        .await;
    assert_eq!(tier, Tier::Remote);
    assert_eq!(
        mock.get_stored_value("assessment:42").as_deref(),
        Some(&b"{\"score\":17}"[..])
    );

    assert_eq!(
        layer.cache_get("assessment:42").await.as_deref(),
        Some(&b"{\"score\":17}"[..])
    );
    assert_eq!(layer.metrics().snapshot().local_hits, 1);
}

#[tokio::test]
async fn test_remote_hit_backfills_local_tier() {
    let mock = MockMemcachedBuilder::new()
        .with_data("district:Pune:summary", b"cached-elsewhere")
        .build()
        .await
        .unwrap();
    let fixture = TestLayer::with_remote(mock.addr());
    let layer = &fixture.layer;

    assert_eq!(
        layer.cache_get("district:Pune:summary").await.as_deref(),
        Some(&b"cached-elsewhere"[..])
    );
    let entry = layer.cache().local().entry("district:Pune:summary").unwrap();
    assert_eq!(entry.source_tier, Tier::Remote);

    // Second lookup never leaves the process
    let gets_before = mock.stats().gets;
    assert!(layer.cache_get("district:Pune:summary").await.is_some());
    assert_eq!(mock.stats().gets, gets_before);

    let metrics = layer.metrics().snapshot();
    assert_eq!(metrics.remote_hits, 1);
    assert_eq!(metrics.local_hits, 1);
}

#[tokio::test]
async fn test_multi_get_is_one_remote_round_trip() {
    let mock = MockMemcachedBuilder::new()
        .with_data("student:1", b"a")
        .with_data("student:2", b"b")
        .build()
        .await
        .unwrap();
    let fixture = TestLayer::with_remote(mock.addr());

    let keys: Vec<String> = ["student:1", "student:2", "student:3"]
        .iter()
        .map(|k| k.to_string())
        .collect();
    let values = fixture.layer.cache_multi_get(&keys).await;

    assert_eq!(values[0].as_deref(), Some(&b"a"[..]));
    assert_eq!(values[1].as_deref(), Some(&b"b"[..]));
    assert!(values[2].is_none());
    assert_eq!(mock.stats().gets, 1);
    assert_eq!(fixture.layer.metrics().snapshot().cache_misses, 1);
}

#[tokio::test]
async fn test_delete_reaches_remote() {
    let mock = MockMemcached::new().await.unwrap();
    let fixture = TestLayer::with_remote(mock.addr());

    fixture
        .layer
        .cache_set("staff:9", b"x".to_vec(), None)
        .await;
    fixture.layer.cache_delete("staff:9").await;

    assert!(mock.get_stored_value("staff:9").is_none());
    assert!(fixture.layer.cache().local().get("staff:9").is_none());
    assert_eq!(mock.stats().deletes, 1);
}

// ============================================================================
// Degraded Remote Tests
// ============================================================================

#[tokio::test]
async fn test_unreachable_remote_degrades_to_local_only() {
    let fixture = TestLayer::with_remote("127.0.0.1:1");
    let layer = &fixture.layer;

    let start = Instant::now();
    assert!(layer.cache_get("assessment:1").await.is_none());
    assert!(start.elapsed() < Duration::from_secs(1));
    assert_eq!(layer.metrics().failover_count(), 1);

    // Sets still land locally and are served from there
    let tier = layer.cache_set("assessment:1", b"v".to_vec(), None).await;
    assert_eq!(tier, Tier::Local);
    assert_eq!(layer.cache_get("assessment:1").await.as_deref(), Some(&b"v"[..]));
}

#[tokio::test]
async fn test_failing_server_counts_failover() {
    let mock = MockMemcachedBuilder::new()
        .response_mode(ResponseMode::Failure)
        .build()
        .await
        .unwrap();
    let fixture = TestLayer::with_remote(mock.addr());

    assert!(fixture.layer.cache_get("assessment:7").await.is_none());
    assert_eq!(fixture.layer.metrics().failover_count(), 1);
}

#[tokio::test]
async fn test_unhealthy_remote_is_skipped() {
    let fixture = TestLayer::with_remote("127.0.0.1:1");
    let layer = &fixture.layer;

    for _ in 0..3 {
        layer.probe_now().await;
    }
    assert!(!layer.registry().is_healthy(REMOTE_CACHE_TARGET));
    assert!(layer.get_stats().remote_cache.is_some());

    // No remote attempt, so no new failover
    assert!(layer.cache_get("assessment:1").await.is_none());
    assert_eq!(layer.cache_set("assessment:1", b"v".to_vec(), None).await, Tier::Local);
    assert_eq!(layer.metrics().failover_count(), 0);
}

#[tokio::test]
async fn test_recovered_remote_is_used_again() {
    let mock = MockMemcached::new().await.unwrap();
    let fixture = TestLayer::with_remote(mock.addr());
    let layer = &fixture.layer;

    mock.set_response_mode(ResponseMode::Failure);
    for _ in 0..3 {
        layer.probe_now().await;
    }
    assert!(!layer.registry().is_healthy(REMOTE_CACHE_TARGET));

    mock.set_response_mode(ResponseMode::Normal);
    layer.probe_now().await;
    assert!(layer.registry().is_healthy(REMOTE_CACHE_TARGET));
    assert_eq!(layer.cache_set("k", b"v".to_vec(), None).await, Tier::Remote);
}

// ============================================================================
// Cached Read Tests
// ============================================================================

#[tokio::test]
async fn test_repeated_read_is_served_from_cache() {
    let fixture = TestLayer::new();
    let layer = &fixture.layer;
    let op = ReadOp::new(
        PartitionKey::named("Pune"),
        Statement::new("SELECT count(*) FROM submissions"),
    );

    let first = layer.read(&op).await.unwrap();
    let second = layer.read(&op).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(fixture.north.primary.reads() + fixture.north.fallback.reads(), 1);
    assert_eq!(layer.metrics().snapshot().local_hits, 1);
}

#[tokio::test]
async fn test_write_invalidates_cached_read() {
    let fixture = TestLayer::new();
    let layer = &fixture.layer;
    let read = ReadOp::new(
        PartitionKey::named("Pune"),
        Statement::new("SELECT * FROM district_summary"),
    )
    .with_cache_key("summary:Pune");

    layer.read(&read).await.unwrap();
    layer
        .write(
            &WriteRequest::new(
                PartitionKey::named("Pune"),
                WriteOp::statement(Statement::new("UPDATE district_summary SET stale = true")),
            )
            .invalidating("summary:Pune"),
        )
        .await
        .unwrap();
    layer.read(&read).await.unwrap();

    assert_eq!(fixture.north.primary.reads() + fixture.north.fallback.reads(), 2);
}

#[tokio::test]
async fn test_uncached_read_always_hits_backend() {
    let fixture = TestLayer::new();
    let op = ReadOp::new(PartitionKey::named("Madurai"), Statement::new("SELECT 1")).uncached();

    for _ in 0..3 {
        fixture.layer.read(&op).await.unwrap();
    }

    assert_eq!(fixture.south.primary.reads() + fixture.south.fallback.reads(), 3);
    assert!(fixture.layer.cache().local().is_empty());
}
