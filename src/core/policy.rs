//! Routing policy and the load meter that feeds it.
//!
//! [`compute_policy`] is a pure function of one shard group's health and the
//! layer's load; the [`PolicyOptimizer`] is its single writer and runs after
//! every health probe round.

use crate::config::RoutingConfig;
use crate::core::health::HealthRegistry;
use crate::core::replica::ShardGroup;
use crate::core::shard::ShardGroupId;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

/// Live read/write weighting for one shard group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RoutingPolicy {
    /// Share of reads (percent) sent to the primary; the rest go to the secondary tier
    pub read_distribution_pct: u8,
    /// Consecutive primary failures tolerated before writes move to the fallback
    pub write_failover_threshold: u32,
    pub fallback_threshold_ms: u64,
}

impl RoutingPolicy {
    pub fn from_config(config: &RoutingConfig) -> Self {
        Self {
            read_distribution_pct: config.read_distribution_pct.min(100),
            write_failover_threshold: config.write_failover_threshold.max(1),
            fallback_threshold_ms: config.fallback_threshold_ms,
        }
    }
}

/// Observed request rate of the whole layer
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LoadSnapshot {
    pub requests_per_second: f64,
    /// `requests_per_second / high_load_rps`, clamped to `[0, 1]`
    pub load_score: f64,
}

/// Health inputs for one shard group
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GroupHealth {
    pub primary_healthy: bool,
    pub primary_latency_ms: Option<f64>,
    /// At least one active fallback or replica is healthy
    pub secondary_healthy: bool,
}

/// Derive a group's routing policy from its health and the current load
pub fn compute_policy(base: &RoutingConfig, health: &GroupHealth, load: &LoadSnapshot) -> RoutingPolicy {
    let mut policy = RoutingPolicy::from_config(base);
    let high_load = load.requests_per_second >= base.high_load_rps;
    let moderate_load = load.requests_per_second >= base.high_load_rps / 2.0;
    let slow_primary = health
        .primary_latency_ms
        .map_or(false, |ms| ms > base.fallback_threshold_ms as f64);

    policy.read_distribution_pct = if !health.secondary_healthy {
        100
    } else if !health.primary_healthy {
        0
    } else if high_load {
        50
    } else if moderate_load || slow_primary {
        60
    } else {
        policy.read_distribution_pct
    };

    if high_load {
        policy.write_failover_threshold = policy.write_failover_threshold.saturating_sub(1).max(1);
    }

    policy
}

/// Shortest interval a request rate is computed over
pub const MIN_SAMPLE_WINDOW: Duration = Duration::from_secs(1);

/// Turns the monotonic query counter into a request rate
#[derive(Debug)]
pub struct LoadMeter {
    high_load_rps: f64,
    last: Option<(u64, Instant)>,
    current: LoadSnapshot,
}

impl LoadMeter {
    pub fn new(high_load_rps: f64) -> Self {
        Self {
            high_load_rps,
            last: None,
            current: LoadSnapshot::default(),
        }
    }

    /// Record the counter value at `now` and return the rate since the previous observation.
    ///
    /// Observations closer than [`MIN_SAMPLE_WINDOW`] to the previous one keep the
    /// current rate and do not move the baseline.
    pub fn observe(&mut self, total_queries: u64, now: Instant) -> LoadSnapshot {
        if let Some((last_total, last_at)) = self.last {
            let window = now.saturating_duration_since(last_at);
            if window < MIN_SAMPLE_WINDOW {
                return self.current;
            }
            let rps = total_queries.saturating_sub(last_total) as f64 / window.as_secs_f64();
            let load_score = if self.high_load_rps > 0.0 {
                (rps / self.high_load_rps).clamp(0.0, 1.0)
            } else {
                1.0
            };
            self.current = LoadSnapshot {
                requests_per_second: rps,
                load_score,
            };
        }
        self.last = Some((total_queries, now));
        self.current
    }

    pub fn current(&self) -> LoadSnapshot {
        self.current
    }
}

/// Current policy per shard group; one writer, many readers
#[derive(Debug)]
pub struct PolicyTable {
    policies: RwLock<Vec<RoutingPolicy>>,
}

impl PolicyTable {
    pub fn new(group_count: usize, base: &RoutingConfig) -> Self {
        Self {
            policies: RwLock::new(vec![RoutingPolicy::from_config(base); group_count]),
        }
    }

    pub fn get(&self, group: ShardGroupId) -> Option<RoutingPolicy> {
        self.policies.read().get(group.index()).copied()
    }

    pub fn snapshot(&self) -> Vec<RoutingPolicy> {
        self.policies.read().clone()
    }

    fn set(&self, group: ShardGroupId, policy: RoutingPolicy) -> Option<RoutingPolicy> {
        let mut policies = self.policies.write();
        let slot = policies.get_mut(group.index())?;
        let previous = *slot;
        *slot = policy;
        Some(previous)
    }
}

/// Periodic recomputation of every group's [`RoutingPolicy`]
pub struct PolicyOptimizer {
    base: RoutingConfig,
    meter: Mutex<LoadMeter>,
    table: Arc<PolicyTable>,
    groups: Vec<Arc<ShardGroup>>,
}

impl PolicyOptimizer {
    pub fn new(base: RoutingConfig, table: Arc<PolicyTable>, groups: Vec<Arc<ShardGroup>>) -> Self {
        Self {
            meter: Mutex::new(LoadMeter::new(base.high_load_rps)),
            base,
            table,
            groups,
        }
    }

    pub fn table(&self) -> &Arc<PolicyTable> {
        &self.table
    }

    pub fn current_load(&self) -> LoadSnapshot {
        self.meter.lock().current()
    }

    /// Recompute every group's policy from the registry and the current query total
    pub fn optimize(&self, registry: &HealthRegistry, total_queries: u64, now: Instant) -> LoadSnapshot {
        let load = self.meter.lock().observe(total_queries, now);

        for group in &self.groups {
            let health = group.health(registry);
            let policy = compute_policy(&self.base, &health, &load);
            if let Some(previous) = self.table.set(group.id(), policy) {
                if previous.read_distribution_pct != policy.read_distribution_pct {
                    info!(
                        shard = %group.name(),
                        from = previous.read_distribution_pct,
                        to = policy.read_distribution_pct,
                        rps = load.requests_per_second,
                        "Read distribution changed"
                    );
                }
            }
        }

        load
    }
}
