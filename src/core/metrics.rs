use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Process-wide counters for the access layer.
///
/// Counters are monotonic for the life of the process; there is no reset.
#[derive(Debug, Default)]
pub struct LayerMetrics {
    total_queries: AtomicU64,
    read_queries: AtomicU64,
    write_queries: AtomicU64,
    failover_count: AtomicU64,
    local_hits: AtomicU64,
    remote_hits: AtomicU64,
    cache_misses: AtomicU64,
    read_retries: AtomicU64,
    degraded_writes: AtomicU64,
    mirror_writes: AtomicU64,
    mirror_failures: AtomicU64,
    mirror_repaired: AtomicU64,
    mirror_abandoned: AtomicU64,
    mirror_dropped: AtomicU64,
    skipped_remote_deletes: AtomicU64,
    unmapped_shard_keys: AtomicU64,
}

/// Point-in-time copy of [`LayerMetrics`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LayerMetricsSnapshot {
    pub total_queries: u64,
    pub read_queries: u64,
    pub write_queries: u64,
    pub failover_count: u64,
    pub local_hits: u64,
    pub remote_hits: u64,
    pub cache_misses: u64,
    pub read_retries: u64,
    pub degraded_writes: u64,
    pub mirror_writes: u64,
    pub mirror_failures: u64,
    pub mirror_repaired: u64,
    pub mirror_abandoned: u64,
    pub mirror_dropped: u64,
    /// Invalidations that could not reach an unhealthy remote tier
    pub skipped_remote_deletes: u64,
    pub unmapped_shard_keys: u64,
}

impl LayerMetricsSnapshot {
    pub fn cache_hit_rate(&self) -> f64 {
        let hits = self.local_hits + self.remote_hits;
        let lookups = hits + self.cache_misses;
        if lookups == 0 {
            0.0
        } else {
            hits as f64 / lookups as f64
        }
    }
}

impl LayerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_read(&self) {
        self.total_queries.fetch_add(1, Ordering::Relaxed);
        self.read_queries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_write(&self) {
        self.total_queries.fetch_add(1, Ordering::Relaxed);
        self.write_queries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failover(&self) {
        self.failover_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_local_hit(&self) {
        self.local_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_remote_hit(&self) {
        self.remote_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_read_retry(&self) {
        self.read_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_degraded_write(&self) {
        self.degraded_writes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_mirror_write(&self) {
        self.mirror_writes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_mirror_failure(&self) {
        self.mirror_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_mirror_repaired(&self) {
        self.mirror_repaired.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_mirror_abandoned(&self) {
        self.mirror_abandoned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_mirror_dropped(&self) {
        self.mirror_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_skipped_remote_delete(&self) {
        self.skipped_remote_deletes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unmapped_shard_key(&self) {
        self.unmapped_shard_keys.fetch_add(1, Ordering::Relaxed);
    }

    pub fn total_queries(&self) -> u64 {
        self.total_queries.load(Ordering::Relaxed)
    }

    pub fn failover_count(&self) -> u64 {
        self.failover_count.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> LayerMetricsSnapshot {
        LayerMetricsSnapshot {
            total_queries: self.total_queries.load(Ordering::Relaxed),
            read_queries: self.read_queries.load(Ordering::Relaxed),
            write_queries: self.write_queries.load(Ordering::Relaxed),
            failover_count: self.failover_count.load(Ordering::Relaxed),
            local_hits: self.local_hits.load(Ordering::Relaxed),
            remote_hits: self.remote_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            read_retries: self.read_retries.load(Ordering::Relaxed),
            degraded_writes: self.degraded_writes.load(Ordering::Relaxed),
            mirror_writes: self.mirror_writes.load(Ordering::Relaxed),
            mirror_failures: self.mirror_failures.load(Ordering::Relaxed),
            mirror_repaired: self.mirror_repaired.load(Ordering::Relaxed),
            mirror_abandoned: self.mirror_abandoned.load(Ordering::Relaxed),
            mirror_dropped: self.mirror_dropped.load(Ordering::Relaxed),
            skipped_remote_deletes: self.skipped_remote_deletes.load(Ordering::Relaxed),
            unmapped_shard_keys: self.unmapped_shard_keys.load(Ordering::Relaxed),
        }
    }
}

/// Request outcome and latency tracking for one backend
#[derive(Debug)]
pub struct BackendMetrics {
    backend_name: String,

    // Request counters
    total_requests: AtomicU64,
    successful_requests: AtomicU64,
    failed_requests: AtomicU64,
    timeouts: AtomicU64,

    latency_tracker: Mutex<LatencyTracker>,
}

/// Snapshot of backend metrics at a point in time
#[derive(Debug, Clone, Serialize)]
pub struct BackendMetricsSnapshot {
    pub backend_name: String,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub timeouts: u64,
    pub average_latency_ms: f64,
    pub p95_latency_ms: f64,
    pub p99_latency_ms: f64,
    pub success_rate: f64,
}

impl BackendMetrics {
    pub fn new(backend_name: impl Into<String>) -> Self {
        Self {
            backend_name: backend_name.into(),
            total_requests: AtomicU64::new(0),
            successful_requests: AtomicU64::new(0),
            failed_requests: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            latency_tracker: Mutex::new(LatencyTracker::new()),
        }
    }

    /// Record a successful operation with its latency
    pub fn record_success(&self, latency: Duration) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.successful_requests.fetch_add(1, Ordering::Relaxed);
        self.latency_tracker.lock().record_latency(latency);
    }

    /// Record a failed operation with its latency (if available)
    pub fn record_failure(&self, latency: Option<Duration>) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
        if let Some(latency) = latency {
            self.latency_tracker.lock().record_latency(latency);
        }
    }

    /// Record a timeout (also counted as a failure)
    pub fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
        self.record_failure(None);
    }

    pub fn backend_name(&self) -> &str {
        &self.backend_name
    }

    pub fn snapshot(&self) -> BackendMetricsSnapshot {
        let total = self.total_requests.load(Ordering::Relaxed);
        let successes = self.successful_requests.load(Ordering::Relaxed);

        let success_rate = if total > 0 {
            (successes as f64) / (total as f64) * 100.0
        } else {
            0.0
        };

        let (average_latency_ms, p95_latency_ms, p99_latency_ms) = {
            let tracker = self.latency_tracker.lock();
            (
                tracker.average_latency_ms(),
                tracker.percentile_latency_ms(95.0),
                tracker.percentile_latency_ms(99.0),
            )
        };

        BackendMetricsSnapshot {
            backend_name: self.backend_name.clone(),
            total_requests: total,
            successful_requests: successes,
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            average_latency_ms,
            p95_latency_ms,
            p99_latency_ms,
            success_rate,
        }
    }
}

/// Latency tracking with sliding window for percentiles
#[derive(Debug)]
struct LatencyTracker {
    latencies: Vec<Duration>,
    max_samples: usize,
    next_index: usize,
}

impl LatencyTracker {
    fn new() -> Self {
        Self {
            latencies: Vec::with_capacity(1000),
            max_samples: 1000, // Keep last 1000 samples for percentile calculation
            next_index: 0,
        }
    }

    fn record_latency(&mut self, latency: Duration) {
        if self.latencies.len() < self.max_samples {
            self.latencies.push(latency);
        } else {
            self.latencies[self.next_index] = latency;
            self.next_index = (self.next_index + 1) % self.max_samples;
        }
    }

    fn average_latency_ms(&self) -> f64 {
        if self.latencies.is_empty() {
            return 0.0;
        }

        let total_ms: f64 = self
            .latencies
            .iter()
            .map(|d| d.as_secs_f64() * 1000.0)
            .sum();

        total_ms / self.latencies.len() as f64
    }

    fn percentile_latency_ms(&self, percentile: f64) -> f64 {
        if self.latencies.is_empty() {
            return 0.0;
        }

        let mut sorted_latencies = self.latencies.clone();
        sorted_latencies.sort();

        let index = ((percentile / 100.0) * sorted_latencies.len() as f64) as usize;
        let index = index.min(sorted_latencies.len() - 1);

        sorted_latencies[index].as_secs_f64() * 1000.0
    }
}
