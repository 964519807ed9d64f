//! Backend health tracking.
//!
//! The [`HealthMonitor`] is the only writer of [`HealthState`]; routers and the
//! tiered cache read it through the shared [`HealthRegistry`] on every decision.

use crate::config::HealthConfig;
use crate::core::backend::{Backend, BackendError, BackendRole};
use crate::core::cache::RemoteCache;
use crate::core::metrics::LayerMetrics;
use crate::core::policy::PolicyOptimizer;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Per-backend health record
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthState {
    pub role: BackendRole,
    /// Latency of the last successful probe
    pub latency_ms: Option<f64>,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub healthy: bool,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub last_failed_at: Option<DateTime<Utc>>,
}

/// Classification limits for one role
#[derive(Debug, Clone, Copy)]
pub struct HealthThresholds {
    pub failure_threshold: u32,
    pub recovery_threshold: u32,
    pub latency_ceiling: Duration,
}

impl HealthThresholds {
    pub fn for_role(config: &HealthConfig, role: BackendRole) -> Self {
        let ceiling_ms = match role {
            BackendRole::Primary => config.primary_latency_ceiling_ms,
            BackendRole::Fallback => config.fallback_latency_ceiling_ms,
            BackendRole::Replica => config.replica_latency_ceiling_ms,
            BackendRole::Cache => config.cache_latency_ceiling_ms,
        };
        Self {
            failure_threshold: config.failure_threshold.max(1),
            recovery_threshold: config.recovery_threshold.max(1),
            latency_ceiling: Duration::from_millis(ceiling_ms),
        }
    }
}

/// Why a probe did not produce a latency
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProbeError {
    #[error("Probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("Probe failed: {0}")]
    Failed(String),
}

impl From<BackendError> for ProbeError {
    fn from(e: BackendError) -> Self {
        match e {
            BackendError::Timeout(limit) => ProbeError::Timeout(limit),
            other => ProbeError::Failed(other.to_string()),
        }
    }
}

impl HealthState {
    /// Backends start healthy so the layer serves traffic before the first probe round
    pub fn new(role: BackendRole) -> Self {
        Self {
            role,
            latency_ms: None,
            consecutive_failures: 0,
            consecutive_successes: 0,
            healthy: true,
            last_checked_at: None,
            last_failed_at: None,
        }
    }

    /// Fold one probe result into the state. Returns true if `healthy` flipped.
    pub fn apply(
        &mut self,
        outcome: &Result<Duration, ProbeError>,
        thresholds: &HealthThresholds,
        now: DateTime<Utc>,
    ) -> bool {
        let was_healthy = self.healthy;
        self.last_checked_at = Some(now);

        match outcome {
            Ok(latency) => {
                self.latency_ms = Some(latency.as_secs_f64() * 1000.0);
                if *latency > thresholds.latency_ceiling {
                    // Too slow counts against the backend immediately
                    self.consecutive_successes = 0;
                    self.last_failed_at = Some(now);
                    self.healthy = false;
                } else {
                    self.consecutive_failures = 0;
                    self.consecutive_successes = self.consecutive_successes.saturating_add(1);
                    if self.consecutive_successes >= thresholds.recovery_threshold {
                        self.healthy = true;
                    }
                }
            }
            Err(_) => {
                self.consecutive_successes = 0;
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                self.last_failed_at = Some(now);
                if self.consecutive_failures >= thresholds.failure_threshold {
                    self.healthy = false;
                }
            }
        }

        was_healthy != self.healthy
    }
}

/// Shared, concurrently readable health table keyed by backend name
#[derive(Debug, Default)]
pub struct HealthRegistry {
    states: DashMap<String, HealthState>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: &str, role: BackendRole) {
        self.states
            .entry(name.to_string())
            .or_insert_with(|| HealthState::new(role));
    }

    /// Unregistered names are never considered healthy
    pub fn is_healthy(&self, name: &str) -> bool {
        self.states.get(name).map_or(false, |state| state.healthy)
    }

    pub fn get(&self, name: &str) -> Option<HealthState> {
        self.states.get(name).map(|state| state.clone())
    }

    /// All states, sorted by backend name
    pub fn snapshot(&self) -> Vec<(String, HealthState)> {
        let mut states: Vec<(String, HealthState)> = self
            .states
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        states.sort_by(|a, b| a.0.cmp(&b.0));
        states
    }

    pub(crate) fn record(
        &self,
        name: &str,
        outcome: &Result<Duration, ProbeError>,
        config: &HealthConfig,
    ) -> Option<HealthState> {
        let mut state = self.states.get_mut(name)?;
        let thresholds = HealthThresholds::for_role(config, state.role);

        if state.apply(outcome, &thresholds, Utc::now()) {
            if state.healthy {
                info!(backend = %name, latency_ms = ?state.latency_ms, "Backend recovered");
            } else {
                warn!(
                    backend = %name,
                    failures = state.consecutive_failures,
                    latency_ms = ?state.latency_ms,
                    "Backend marked unhealthy"
                );
            }
        }

        Some(state.clone())
    }
}

/// Something the monitor can probe
#[async_trait]
pub trait Probe: Send + Sync {
    fn target(&self) -> &str;
    fn role(&self) -> BackendRole;
    async fn probe(&self, limit: Duration) -> Result<Duration, ProbeError>;
}

/// Probes a database backend over its dedicated probe connection
pub struct BackendProbe(pub Arc<dyn Backend>);

#[async_trait]
impl Probe for BackendProbe {
    fn target(&self) -> &str {
        self.0.name()
    }

    fn role(&self) -> BackendRole {
        self.0.descriptor().role
    }

    async fn probe(&self, limit: Duration) -> Result<Duration, ProbeError> {
        self.0.ping(limit).await.map_err(ProbeError::from)
    }
}

/// Name the remote cache tier is registered under
pub const REMOTE_CACHE_TARGET: &str = "remote-cache";

/// Probes the remote cache tier
pub struct CacheProbe(pub Arc<dyn RemoteCache>);

#[async_trait]
impl Probe for CacheProbe {
    fn target(&self) -> &str {
        REMOTE_CACHE_TARGET
    }

    fn role(&self) -> BackendRole {
        BackendRole::Cache
    }

    async fn probe(&self, limit: Duration) -> Result<Duration, ProbeError> {
        let start = Instant::now();
        match tokio::time::timeout(limit, self.0.ping()).await {
            Ok(Ok(())) => Ok(start.elapsed()),
            Ok(Err(e)) => Err(ProbeError::Failed(e.to_string())),
            Err(_) => Err(ProbeError::Timeout(limit)),
        }
    }
}

/// Periodic prober and policy driver
pub struct HealthMonitor {
    config: HealthConfig,
    registry: Arc<HealthRegistry>,
    targets: Vec<Arc<dyn Probe>>,
    optimizer: Option<Arc<PolicyOptimizer>>,
    metrics: Arc<LayerMetrics>,
}

impl HealthMonitor {
    pub fn new(
        config: HealthConfig,
        registry: Arc<HealthRegistry>,
        targets: Vec<Arc<dyn Probe>>,
        metrics: Arc<LayerMetrics>,
    ) -> Self {
        for target in &targets {
            registry.register(target.target(), target.role());
        }
        Self {
            config,
            registry,
            targets,
            optimizer: None,
            metrics,
        }
    }

    /// Recompute routing policies after every probe round
    pub fn with_optimizer(mut self, optimizer: Arc<PolicyOptimizer>) -> Self {
        self.optimizer = Some(optimizer);
        self
    }

    pub fn registry(&self) -> &Arc<HealthRegistry> {
        &self.registry
    }

    /// Probe every target concurrently, update health, then recompute routing policies
    pub async fn probe_all(&self) {
        let limit = self.config.probe_timeout();
        let probes = self.targets.iter().map(|target| async move {
            let outcome = target.probe(limit).await;
            (target.target(), outcome)
        });

        for (name, outcome) in futures::future::join_all(probes).await {
            if let Err(e) = &outcome {
                debug!(backend = %name, error = %e, "Health probe failed");
            }
            self.registry.record(name, &outcome, &self.config);
        }

        if let Some(optimizer) = &self.optimizer {
            optimizer.optimize(&self.registry, self.metrics.total_queries(), Instant::now());
        }
    }

    /// Feed an externally observed probe result through the same classification
    pub fn record_probe(
        &self,
        name: &str,
        outcome: Result<Duration, ProbeError>,
    ) -> Option<HealthState> {
        self.registry.record(name, &outcome, &self.config)
    }

    /// Probe on a fixed interval until `shutdown` flips to true
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(
            "Health monitor started: {} targets every {:?}",
            self.targets.len(),
            self.config.interval()
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => self.probe_all().await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Health monitor stopped");
    }
}
