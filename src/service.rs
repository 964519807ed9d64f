use crate::config::{Config, ConfigError};
use crate::core::backend::{Backend, BackendRole, PgBackend, Rows, Statement, WriteOp};
use crate::core::cache::{MemcachedRemote, RemoteCache, Tier, TieredCache};
use crate::core::health::{BackendProbe, CacheProbe, HealthMonitor, HealthRegistry, HealthState, Probe};
use crate::core::metrics::{BackendMetricsSnapshot, LayerMetrics, LayerMetricsSnapshot};
use crate::core::mirror::{MirrorQueue, ReconcileReport, Reconciler};
use crate::core::policy::{LoadSnapshot, PolicyOptimizer, PolicyTable, RoutingPolicy};
use crate::core::replica::{BackendStatus, ReplicaRouter, RouteError, ShardGroup, WriteResult};
use crate::core::shard::{PartitionKey, ShardError, ShardGroupId, ShardMap, ShardRouter};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// A routed, optionally cached read
#[derive(Debug, Clone)]
pub struct ReadOp {
    pub partition: PartitionKey,
    pub statement: Statement,
    /// Overrides the statement fingerprint as cache key
    pub cache_key: Option<String>,
    pub cache_ttl: Option<Duration>,
    pub use_cache: bool,
}

impl ReadOp {
    pub fn new(partition: PartitionKey, statement: Statement) -> Self {
        Self {
            partition,
            statement,
            cache_key: None,
            cache_ttl: None,
            use_cache: true,
        }
    }

    pub fn with_cache_key(mut self, key: impl Into<String>) -> Self {
        self.cache_key = Some(key.into());
        self
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = Some(ttl);
        self
    }

    pub fn uncached(mut self) -> Self {
        self.use_cache = false;
        self
    }
}

/// A routed write plus the cache keys it invalidates
#[derive(Debug, Clone)]
pub struct WriteRequest {
    pub partition: PartitionKey,
    pub op: WriteOp,
    pub invalidate: Vec<String>,
    /// Accept a degraded target when nothing is healthy (the default).
    /// Callers with no retry budget clear it with [`WriteRequest::fail_fast`].
    pub allow_degraded: bool,
}

impl WriteRequest {
    pub fn new(partition: PartitionKey, op: WriteOp) -> Self {
        Self {
            partition,
            op,
            invalidate: Vec::new(),
            allow_degraded: true,
        }
    }

    pub fn invalidating(mut self, key: impl Into<String>) -> Self {
        self.invalidate.push(key.into());
        self
    }

    /// Fail with `BackendUnavailable` instead of writing to an unhealthy backend
    pub fn fail_fast(mut self) -> Self {
        self.allow_degraded = false;
        self
    }
}

/// Backends of one shard group, before they are wired into the layer
pub struct GroupBackends {
    pub primary: Arc<dyn Backend>,
    pub fallback: Option<Arc<dyn Backend>>,
    pub replicas: Vec<Arc<dyn Backend>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackendHealth {
    pub name: String,
    pub shard_group: String,
    pub role: BackendRole,
    pub status: BackendStatus,
    pub state: Option<HealthState>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupDistribution {
    pub shard_group: String,
    pub policy: RoutingPolicy,
}

/// Observability snapshot for status endpoints
#[derive(Debug, Clone, Serialize)]
pub struct LayerStats {
    pub health: Vec<BackendHealth>,
    pub remote_cache: Option<HealthState>,
    pub load: LoadSnapshot,
    pub distribution: Vec<GroupDistribution>,
    pub metrics: LayerMetricsSnapshot,
    pub backends: Vec<BackendMetricsSnapshot>,
    pub pending_mirrors: usize,
}

/// The resilient data-access layer.
///
/// Constructed explicitly and shared by reference; nothing here is process-global.
pub struct AccessLayer {
    shard_router: ShardRouter,
    replica_router: ReplicaRouter,
    cache: TieredCache,
    registry: Arc<HealthRegistry>,
    monitor: Arc<HealthMonitor>,
    optimizer: Arc<PolicyOptimizer>,
    reconciler: Option<Arc<Reconciler>>,
    mirror_queue: Arc<MirrorQueue>,
    metrics: Arc<LayerMetrics>,
}

impl AccessLayer {
    /// Build Postgres backends and the memcached tier from configuration.
    ///
    /// No connection is attempted here; unreachable backends show up through
    /// health probes and request errors.
    pub async fn new(config: Config) -> Result<Self, ServiceError> {
        config.validate()?;

        let mut groups = HashMap::new();
        for (name, group) in &config.shard_groups {
            let primary = Arc::new(PgBackend::from_config(
                format!("{}.primary", name),
                name,
                BackendRole::Primary,
                &group.primary,
            )) as Arc<dyn Backend>;
            let fallback = group.fallback.as_ref().map(|fallback| {
                Arc::new(PgBackend::from_config(
                    format!("{}.fallback", name),
                    name,
                    BackendRole::Fallback,
                    fallback,
                )) as Arc<dyn Backend>
            });
            let replicas = group
                .replicas
                .iter()
                .enumerate()
                .map(|(i, replica)| {
                    Arc::new(PgBackend::from_config(
                        format!("{}.replica-{}", name, i),
                        name,
                        BackendRole::Replica,
                        replica,
                    )) as Arc<dyn Backend>
                })
                .collect();

            groups.insert(
                name.clone(),
                GroupBackends {
                    primary,
                    fallback,
                    replicas,
                },
            );
        }

        let remote = config.active_remote_cache().map(|remote| {
            info!("Remote cache tier: {}", remote.server);
            Arc::new(MemcachedRemote::from_config(remote)) as Arc<dyn RemoteCache>
        });
        if remote.is_none() {
            info!("No remote cache configured, running local-cache-only");
        }

        Self::with_backends(&config, groups, remote)
    }

    /// Wire already-built backends into a layer
    pub fn with_backends(
        config: &Config,
        mut backends: HashMap<String, GroupBackends>,
        remote: Option<Arc<dyn RemoteCache>>,
    ) -> Result<Self, ServiceError> {
        let metrics = Arc::new(LayerMetrics::new());
        let shard_map = ShardMap::new(
            backends.keys().map(String::as_str),
            &config.shard_map,
            &config.default_shard,
        )?;

        let mut groups = Vec::with_capacity(shard_map.group_count());
        for (id, name) in shard_map.groups() {
            let group = backends
                .remove(name)
                .ok_or_else(|| ServiceError::MissingBackends(name.to_string()))?;
            groups.push(Arc::new(ShardGroup::new(
                id,
                name,
                group.primary,
                group.fallback,
                group.replicas,
            )));
        }

        let mut probes: Vec<Arc<dyn Probe>> = groups
            .iter()
            .flat_map(|group| group.backends())
            .map(|backend| Arc::new(BackendProbe(Arc::clone(backend))) as Arc<dyn Probe>)
            .collect();
        if let Some(remote) = &remote {
            probes.push(Arc::new(CacheProbe(Arc::clone(remote))));
        }

        let registry = Arc::new(HealthRegistry::new());
        let policies = Arc::new(PolicyTable::new(groups.len(), &config.routing));
        let optimizer = Arc::new(PolicyOptimizer::new(
            config.routing.clone(),
            Arc::clone(&policies),
            groups.clone(),
        ));
        let monitor = Arc::new(
            HealthMonitor::new(
                config.health.clone(),
                Arc::clone(&registry),
                probes,
                Arc::clone(&metrics),
            )
            .with_optimizer(Arc::clone(&optimizer)),
        );

        let mirror_queue = Arc::new(MirrorQueue::new(
            config.mirror.queue_capacity,
            Arc::clone(&metrics),
        ));
        let mut replica_router = ReplicaRouter::new(
            groups.clone(),
            Arc::clone(&registry),
            policies,
            Arc::clone(&metrics),
        );
        let reconciler = if config.mirror.enabled {
            replica_router = replica_router.with_mirror_queue(Arc::clone(&mirror_queue));
            Some(Arc::new(Reconciler::new(
                config.mirror.clone(),
                Arc::clone(&mirror_queue),
                groups,
                Arc::clone(&registry),
                Arc::clone(&metrics),
            )))
        } else {
            None
        };

        let cache = TieredCache::new(
            config.cache.clone(),
            remote,
            Arc::clone(&registry),
            Arc::clone(&metrics),
        );

        info!(
            "Access layer ready: {} shard groups, default '{}'",
            shard_map.group_count(),
            config.default_shard
        );

        Ok(Self {
            shard_router: ShardRouter::new(shard_map, Arc::clone(&metrics)),
            replica_router,
            cache,
            registry,
            monitor,
            optimizer,
            reconciler,
            mirror_queue,
            metrics,
        })
    }

    pub fn shard_router(&self) -> &ShardRouter {
        &self.shard_router
    }

    pub fn replica_router(&self) -> &ReplicaRouter {
        &self.replica_router
    }

    pub fn cache(&self) -> &TieredCache {
        &self.cache
    }

    pub fn metrics(&self) -> &Arc<LayerMetrics> {
        &self.metrics
    }

    pub fn registry(&self) -> &Arc<HealthRegistry> {
        &self.registry
    }

    /// Resolve a partition key to its shard group
    pub fn resolve(&self, partition: &PartitionKey) -> ShardGroupId {
        self.shard_router.resolve(partition)
    }

    pub async fn read(&self, op: &ReadOp) -> Result<Rows, AccessError> {
        self.metrics.record_read();
        let group = self.shard_router.resolve(&op.partition);

        let cache_key = op.use_cache.then(|| {
            op.cache_key.clone().unwrap_or_else(|| {
                format!(
                    "{}:{}",
                    self.shard_router.shard_map().group_name(group),
                    op.statement.fingerprint()
                )
            })
        });

        if let Some(key) = &cache_key {
            if let Some(bytes) = self.cache.get(key).await {
                match serde_json::from_slice::<Rows>(&bytes) {
                    Ok(rows) => return Ok(rows),
                    Err(e) => debug!("Ignoring undecodable cache entry '{}': {}", key, e),
                }
            }
        }

        let rows = self.replica_router.execute_read(group, &op.statement).await?;

        if let Some(key) = &cache_key {
            match serde_json::to_vec(&rows) {
                Ok(bytes) => {
                    self.cache.set(key, bytes, op.cache_ttl).await;
                }
                Err(e) => warn!("Could not cache rows for '{}': {}", key, e),
            }
        }

        Ok(rows)
    }

    pub async fn write(&self, request: &WriteRequest) -> Result<WriteResult, AccessError> {
        self.metrics.record_write();
        let group = self.shard_router.resolve(&request.partition);

        let result = self
            .replica_router
            .execute_write(group, &request.op, request.allow_degraded)
            .await?;

        for key in &request.invalidate {
            self.cache.delete(key).await;
        }

        Ok(result)
    }

    pub async fn cache_get(&self, key: &str) -> Option<Vec<u8>> {
        self.cache.get(key).await
    }

    pub async fn cache_multi_get(&self, keys: &[String]) -> Vec<Option<Vec<u8>>> {
        self.cache.multi_get(keys).await
    }

    pub async fn cache_set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Tier {
        self.cache.set(key, value, ttl).await
    }

    pub async fn cache_delete(&self, key: &str) {
        self.cache.delete(key).await
    }

    /// Operator switch: an inactive backend is excluded from routing and never auto-restored
    pub fn set_backend_active(&self, name: &str, active: bool) -> bool {
        let backend = self
            .replica_router
            .groups()
            .iter()
            .find_map(|group| group.find(name));

        match backend {
            Some(backend) => {
                backend.descriptor().set_active(active);
                info!(backend = %name, active, "Backend activation changed");
                true
            }
            None => false,
        }
    }

    /// Run one probe round (and policy recomputation) immediately
    pub async fn probe_now(&self) {
        self.monitor.probe_all().await;
    }

    /// Recompute routing policies from current health and load without probing
    pub fn optimize_now(&self) -> LoadSnapshot {
        self.optimizer
            .optimize(&self.registry, self.metrics.total_queries(), Instant::now())
    }

    /// Run one mirror reconciliation pass immediately
    pub async fn reconcile_now(&self) -> ReconcileReport {
        match &self.reconciler {
            Some(reconciler) => reconciler.reconcile_once().await,
            None => ReconcileReport::default(),
        }
    }

    pub fn get_stats(&self) -> LayerStats {
        let shard_map = self.shard_router.shard_map();
        let groups = self.replica_router.groups();

        let health = groups
            .iter()
            .flat_map(|group| group.backends())
            .map(|backend| BackendHealth {
                name: backend.name().to_string(),
                shard_group: backend.descriptor().shard_group.clone(),
                role: backend.descriptor().role,
                status: BackendStatus::of(backend.as_ref(), &self.registry),
                state: self.registry.get(backend.name()),
            })
            .collect();

        let distribution = self
            .optimizer
            .table()
            .snapshot()
            .into_iter()
            .zip(shard_map.groups())
            .map(|(policy, (_, name))| GroupDistribution {
                shard_group: name.to_string(),
                policy,
            })
            .collect();

        let backends = groups
            .iter()
            .flat_map(|group| group.backends())
            .map(|backend| backend.metrics().snapshot())
            .collect();

        LayerStats {
            health,
            remote_cache: self
                .cache
                .has_remote()
                .then(|| self.registry.get(crate::core::health::REMOTE_CACHE_TARGET))
                .flatten(),
            load: self.optimizer.current_load(),
            distribution,
            metrics: self.metrics.snapshot(),
            backends,
            pending_mirrors: self.mirror_queue.len(),
        }
    }

    /// Spawn the health monitor and the mirror reconciler
    pub fn start(&self) -> BackgroundTasks {
        let (shutdown, receiver) = watch::channel(false);
        let mut handles = vec![tokio::spawn(
            Arc::clone(&self.monitor).run(receiver.clone()),
        )];
        if let Some(reconciler) = &self.reconciler {
            handles.push(tokio::spawn(Arc::clone(reconciler).run(receiver)));
        }
        BackgroundTasks { shutdown, handles }
    }
}

/// Handles of the layer's periodic tasks
pub struct BackgroundTasks {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundTasks {
    /// Signal every task to stop and wait for them
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            if let Err(e) = handle.await {
                warn!("Background task ended abnormally: {}", e);
            }
        }
    }
}

/// Errors surfaced to callers of the access layer
#[derive(Debug, thiserror::Error)]
pub enum AccessError {
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),
    #[error("Connection pool exhausted: {0}")]
    PoolExhausted(String),
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

impl From<RouteError> for AccessError {
    fn from(e: RouteError) -> Self {
        match e {
            RouteError::PoolExhausted(backend) => AccessError::PoolExhausted(backend),
            RouteError::Rejected(reason) => AccessError::InvalidOperation(reason),
            other @ (RouteError::UnknownGroup(_)
            | RouteError::NoHealthyWriteTarget(_)
            | RouteError::BackendUnavailable(_)) => AccessError::BackendUnavailable(other.to_string()),
        }
    }
}

/// Errors building the access layer
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Shard map error: {0}")]
    Shard(#[from] ShardError),
    #[error("No backends for shard group '{0}'")]
    MissingBackends(String),
}
