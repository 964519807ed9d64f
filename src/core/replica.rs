//! Backend selection inside one shard group.
//!
//! Writes go to the primary, to the fallback under sustained primary failure,
//! and as a last resort to the least-recently-failed backend flagged degraded.
//! Reads split between the primary and the secondary tier (fallback plus
//! replicas) according to the group's [`RoutingPolicy`].

use crate::core::backend::{execute_with_metrics, Backend, BackendError, BackendRole, Rows, Statement, WriteOp, WriteOutcome};
use crate::core::health::HealthRegistry;
use crate::core::metrics::LayerMetrics;
use crate::core::mirror::{MirrorQueue, PendingMirror};
use crate::core::policy::{GroupHealth, PolicyTable, RoutingPolicy};
use crate::core::shard::ShardGroupId;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Derived routing status of one backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendStatus {
    Healthy,
    /// Failing probes or over its latency ceiling; recovers on its own
    Degraded,
    /// Taken out of rotation by an operator
    Excluded,
}

impl BackendStatus {
    pub fn of(backend: &dyn Backend, registry: &HealthRegistry) -> Self {
        if !backend.descriptor().is_active() {
            BackendStatus::Excluded
        } else if registry.is_healthy(backend.name()) {
            BackendStatus::Healthy
        } else {
            BackendStatus::Degraded
        }
    }
}

/// The backends serving one shard group
pub struct ShardGroup {
    id: ShardGroupId,
    name: String,
    primary: Arc<dyn Backend>,
    fallback: Option<Arc<dyn Backend>>,
    replicas: Vec<Arc<dyn Backend>>,
}

impl ShardGroup {
    pub fn new(
        id: ShardGroupId,
        name: impl Into<String>,
        primary: Arc<dyn Backend>,
        fallback: Option<Arc<dyn Backend>>,
        replicas: Vec<Arc<dyn Backend>>,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            primary,
            fallback,
            replicas,
        }
    }

    pub fn id(&self) -> ShardGroupId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn primary(&self) -> &Arc<dyn Backend> {
        &self.primary
    }

    pub fn fallback(&self) -> Option<&Arc<dyn Backend>> {
        self.fallback.as_ref()
    }

    pub fn replicas(&self) -> &[Arc<dyn Backend>] {
        &self.replicas
    }

    /// Fallback first, then replicas
    pub fn secondaries(&self) -> impl Iterator<Item = &Arc<dyn Backend>> {
        self.fallback.iter().chain(self.replicas.iter())
    }

    pub fn backends(&self) -> impl Iterator<Item = &Arc<dyn Backend>> {
        std::iter::once(&self.primary).chain(self.secondaries())
    }

    pub fn find(&self, name: &str) -> Option<&Arc<dyn Backend>> {
        self.backends().find(|backend| backend.name() == name)
    }

    /// Routing inputs for this group's policy
    pub fn health(&self, registry: &HealthRegistry) -> GroupHealth {
        GroupHealth {
            primary_healthy: usable(&self.primary, registry),
            primary_latency_ms: registry
                .get(self.primary.name())
                .and_then(|state| state.latency_ms),
            secondary_healthy: self.secondaries().any(|backend| usable(backend, registry)),
        }
    }
}

fn usable(backend: &Arc<dyn Backend>, registry: &HealthRegistry) -> bool {
    backend.descriptor().is_active() && registry.is_healthy(backend.name())
}

/// Selected write target
#[derive(Clone)]
pub struct WriteTarget {
    pub backend: Arc<dyn Backend>,
    /// No healthy write target existed; this is the least-recently-failed one
    pub degraded: bool,
}

/// Result of a routed write
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WriteResult {
    pub backend: String,
    pub outcome: WriteOutcome,
    pub degraded: bool,
}

/// Routes reads and writes to backends within shard groups
pub struct ReplicaRouter {
    groups: Vec<Arc<ShardGroup>>,
    registry: Arc<HealthRegistry>,
    policies: Arc<PolicyTable>,
    metrics: Arc<LayerMetrics>,
    mirror: Option<Arc<MirrorQueue>>,
    read_counter: AtomicU64,
    secondary_counter: AtomicU64,
}

impl ReplicaRouter {
    pub fn new(
        groups: Vec<Arc<ShardGroup>>,
        registry: Arc<HealthRegistry>,
        policies: Arc<PolicyTable>,
        metrics: Arc<LayerMetrics>,
    ) -> Self {
        Self {
            groups,
            registry,
            policies,
            metrics,
            mirror: None,
            read_counter: AtomicU64::new(0),
            secondary_counter: AtomicU64::new(0),
        }
    }

    /// Park failed or skipped mirror writes in `queue` for later repair
    pub fn with_mirror_queue(mut self, queue: Arc<MirrorQueue>) -> Self {
        self.mirror = Some(queue);
        self
    }

    pub fn groups(&self) -> &[Arc<ShardGroup>] {
        &self.groups
    }

    pub fn group(&self, id: ShardGroupId) -> Result<&Arc<ShardGroup>, RouteError> {
        self.groups
            .get(id.index())
            .ok_or(RouteError::UnknownGroup(id))
    }

    fn policy(&self, group: &ShardGroup) -> RoutingPolicy {
        self.policies
            .get(group.id())
            .unwrap_or(RoutingPolicy {
                read_distribution_pct: 100,
                write_failover_threshold: 1,
                fallback_threshold_ms: 0,
            })
    }

    /// Pick the write target for a group.
    ///
    /// A healthy primary is always acceptable. Once its consecutive failures reach
    /// the policy's `write_failover_threshold`, a healthy fallback is preferred over it.
    /// With `allow_degraded` the router serves a degraded target instead of
    /// failing; without it a group with no healthy write target is an error.
    pub fn select_write_target(
        &self,
        id: ShardGroupId,
        allow_degraded: bool,
    ) -> Result<WriteTarget, RouteError> {
        let group = self.group(id)?;
        let policy = self.policy(group);

        let primary_usable = usable(&group.primary, &self.registry);
        let primary_failures = self
            .registry
            .get(group.primary.name())
            .map_or(0, |state| state.consecutive_failures);
        if primary_usable && primary_failures < policy.write_failover_threshold {
            return Ok(WriteTarget {
                backend: Arc::clone(&group.primary),
                degraded: false,
            });
        }

        if let Some(fallback) = group.fallback.as_ref().filter(|f| usable(f, &self.registry)) {
            debug!(shard = %group.name, backend = %fallback.name(), "Writes routed to fallback");
            return Ok(WriteTarget {
                backend: Arc::clone(fallback),
                degraded: false,
            });
        }

        if primary_usable {
            return Ok(WriteTarget {
                backend: Arc::clone(&group.primary),
                degraded: false,
            });
        }

        // Least recently failed active write-capable backend; never-failed sorts first
        let candidate = std::iter::once(&group.primary)
            .chain(group.fallback.iter())
            .filter(|backend| backend.descriptor().is_active())
            .min_by_key(|backend| {
                self.registry
                    .get(backend.name())
                    .and_then(|state| state.last_failed_at)
            });

        match candidate {
            Some(backend) if allow_degraded => {
                warn!(
                    shard = %group.name,
                    backend = %backend.name(),
                    "No healthy write target, serving degraded"
                );
                Ok(WriteTarget {
                    backend: Arc::clone(backend),
                    degraded: true,
                })
            }
            _ => Err(RouteError::NoHealthyWriteTarget(group.name.clone())),
        }
    }

    /// Weighted choice between the primary and the secondary tier
    pub fn select_read_target(&self, id: ShardGroupId) -> Result<Arc<dyn Backend>, RouteError> {
        let group = self.group(id)?;
        let policy = self.policy(group);

        // 37 is coprime with 100, so every run of 100 reads hits each slot once
        let n = self.read_counter.fetch_add(1, Ordering::Relaxed);
        let prefer_primary = (n.wrapping_mul(37) % 100) < u64::from(policy.read_distribution_pct);

        let primary = Some(&group.primary).filter(|p| usable(p, &self.registry));
        let target = if prefer_primary {
            primary.cloned().or_else(|| self.pick_secondary(group, None))
        } else {
            self.pick_secondary(group, None).or_else(|| primary.cloned())
        };

        target.ok_or_else(|| RouteError::BackendUnavailable(group.name.clone()))
    }

    /// Round robin over usable secondaries, skipping `exclude`
    fn pick_secondary(&self, group: &ShardGroup, exclude: Option<&str>) -> Option<Arc<dyn Backend>> {
        let candidates: Vec<&Arc<dyn Backend>> = group
            .secondaries()
            .filter(|backend| usable(backend, &self.registry))
            .filter(|backend| Some(backend.name()) != exclude)
            .collect();
        if candidates.is_empty() {
            return None;
        }
        let n = self.secondary_counter.fetch_add(1, Ordering::Relaxed) as usize;
        Some(Arc::clone(candidates[n % candidates.len()]))
    }

    /// Another usable backend for a read that failed on `failed`
    fn alternate_read_target(&self, group: &ShardGroup, failed: &str) -> Option<Arc<dyn Backend>> {
        if failed == group.primary.name() {
            return self.pick_secondary(group, Some(failed));
        }
        Some(&group.primary)
            .filter(|p| usable(p, &self.registry))
            .cloned()
            .or_else(|| self.pick_secondary(group, Some(failed)))
    }

    /// Run a read, retrying exactly once on another backend after a transient failure
    pub async fn execute_read(&self, id: ShardGroupId, statement: &Statement) -> Result<Rows, RouteError> {
        let group = self.group(id)?;
        let target = self.select_read_target(id)?;
        debug!(shard = %group.name, backend = %target.name(), "Routing read");

        let error = match execute_with_metrics(target.as_ref(), target.execute(statement)).await {
            Ok(rows) => return Ok(rows),
            Err(e) => e,
        };

        match &error {
            BackendError::PoolExhausted => {
                return Err(RouteError::PoolExhausted(target.name().to_string()))
            }
            e if !e.is_transient() => return Err(RouteError::Rejected(e.to_string())),
            _ => {}
        }

        let Some(alternate) = self.alternate_read_target(group, target.name()) else {
            warn!(shard = %group.name, backend = %target.name(), "Read failed with no alternate: {}", error);
            return Err(RouteError::BackendUnavailable(group.name.clone()));
        };

        warn!(
            shard = %group.name,
            backend = %target.name(),
            alternate = %alternate.name(),
            "Read failed, retrying once: {}",
            error
        );
        self.metrics.record_read_retry();
        self.metrics.record_failover();

        execute_with_metrics(alternate.as_ref(), alternate.execute(statement))
            .await
            .map_err(|e| match e {
                BackendError::PoolExhausted => RouteError::PoolExhausted(alternate.name().to_string()),
                e if e.is_transient() => RouteError::BackendUnavailable(group.name.clone()),
                e => RouteError::Rejected(e.to_string()),
            })
    }

    /// Apply a write to the selected target, then mirror it to the primary/fallback peer
    pub async fn execute_write(
        &self,
        id: ShardGroupId,
        op: &WriteOp,
        allow_degraded: bool,
    ) -> Result<WriteResult, RouteError> {
        let group = self.group(id)?;
        let target = self.select_write_target(id, allow_degraded)?;
        let backend = &target.backend;

        if target.degraded {
            self.metrics.record_degraded_write();
        }
        if backend.descriptor().role != BackendRole::Primary {
            self.metrics.record_failover();
        }
        debug!(shard = %group.name, backend = %backend.name(), key = %op.idempotency_key, "Routing write");

        let outcome = execute_with_metrics(backend.as_ref(), backend.apply(op))
            .await
            .map_err(|e| match e {
                BackendError::PoolExhausted => RouteError::PoolExhausted(backend.name().to_string()),
                e if e.is_transient() => RouteError::BackendUnavailable(group.name.clone()),
                e => RouteError::Rejected(e.to_string()),
            })?;

        self.mirror_write(group, backend.name(), op);

        Ok(WriteResult {
            backend: backend.name().to_string(),
            outcome,
            degraded: target.degraded,
        })
    }

    /// Best-effort copy of a write to the other of primary/fallback
    fn mirror_write(&self, group: &ShardGroup, written_to: &str, op: &WriteOp) {
        let Some(queue) = self.mirror.as_ref() else {
            return;
        };
        let peer = if written_to == group.primary.name() {
            group.fallback.as_ref()
        } else {
            Some(&group.primary)
        };
        let Some(peer) = peer.filter(|peer| peer.descriptor().is_active()) else {
            return;
        };

        let pending = PendingMirror::new(op.clone(), group.id, peer.name());
        if !self.registry.is_healthy(peer.name()) {
            self.metrics.record_mirror_failure();
            warn!(backend = %peer.name(), "Mirror target unhealthy, queued for repair");
            queue.push(pending);
            return;
        }

        let peer = Arc::clone(peer);
        let queue = Arc::clone(queue);
        let metrics = Arc::clone(&self.metrics);
        tokio::spawn(async move {
            let result = execute_with_metrics(peer.as_ref(), peer.apply(&pending.op)).await;
            match result {
                Ok(_) => metrics.record_mirror_write(),
                Err(e) => {
                    metrics.record_mirror_failure();
                    warn!(backend = %peer.name(), "Mirror write failed, queued for repair: {}", e);
                    queue.push(pending);
                }
            }
        });
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("Unknown shard group {0}")]
    UnknownGroup(ShardGroupId),
    #[error("No healthy write target in shard group '{0}'")]
    NoHealthyWriteTarget(String),
    #[error("No healthy backend in shard group '{0}'")]
    BackendUnavailable(String),
    #[error("Connection pool exhausted on '{0}'")]
    PoolExhausted(String),
    #[error("Operation rejected: {0}")]
    Rejected(String),
}
