use super::{LocalTier, RemoteCache, Tier};
use crate::config::CacheConfig;
use crate::core::health::{HealthRegistry, REMOTE_CACHE_TARGET};
use crate::core::metrics::LayerMetrics;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Local tier in front of an optional remote tier.
///
/// The cache is advisory: remote failures degrade to local-only operation and
/// are counted as failovers, never returned to the caller.
pub struct TieredCache {
    local: LocalTier,
    remote: Option<Arc<dyn RemoteCache>>,
    registry: Arc<HealthRegistry>,
    metrics: Arc<LayerMetrics>,
    config: CacheConfig,
    writes: AtomicU64,
}

impl TieredCache {
    pub fn new(
        config: CacheConfig,
        remote: Option<Arc<dyn RemoteCache>>,
        registry: Arc<HealthRegistry>,
        metrics: Arc<LayerMetrics>,
    ) -> Self {
        Self {
            local: LocalTier::new(config.local_capacity),
            remote,
            registry,
            metrics,
            config,
            writes: AtomicU64::new(0),
        }
    }

    pub fn local(&self) -> &LocalTier {
        &self.local
    }

    pub fn has_remote(&self) -> bool {
        self.remote.is_some()
    }

    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.config.default_ttl_secs)
    }

    /// The remote tier, if configured and currently healthy
    fn healthy_remote(&self) -> Option<&Arc<dyn RemoteCache>> {
        self.remote
            .as_ref()
            .filter(|_| self.registry.is_healthy(REMOTE_CACHE_TARGET))
    }

    fn local_ttl(&self, ttl: Duration) -> Duration {
        ttl.min(Duration::from_secs(self.config.local_ttl_secs))
    }

    // Values recovered from the remote tier carry an unknown remaining lifetime
    fn backfill_ttl(&self) -> Duration {
        Duration::from_secs(
            self.config
                .local_ttl_secs
                .min(self.config.default_ttl_secs / 2)
                .max(1),
        )
    }

    fn remote_failed(&self, operation: &str, error: &dyn std::fmt::Display) {
        self.metrics.record_failover();
        warn!("Remote cache {} failed, continuing local-only: {}", operation, error);
    }

    pub async fn get(&self, key: &str) -> Option<Vec<u8>> {
        if let Some(value) = self.local.get(key) {
            self.metrics.record_local_hit();
            return Some(value);
        }

        if let Some(remote) = self.healthy_remote() {
            match remote.get_many(&[key.to_string()]).await {
                Ok(mut found) => {
                    if let Some(value) = found.remove(key) {
                        self.metrics.record_remote_hit();
                        self.local
                            .insert(key, value.clone(), self.backfill_ttl(), Tier::Remote);
                        return Some(value);
                    }
                }
                Err(e) => self.remote_failed("get", &e),
            }
        }

        self.metrics.record_cache_miss();
        None
    }

    /// Look up several keys; the result is aligned with `keys`
    pub async fn multi_get(&self, keys: &[String]) -> Vec<Option<Vec<u8>>> {
        let mut values = self.local.get_many(keys);

        let missing: Vec<String> = keys
            .iter()
            .zip(&values)
            .filter(|(_, value)| value.is_none())
            .map(|(key, _)| key.clone())
            .collect();
        let local_hits = keys.len() - missing.len();
        for _ in 0..local_hits {
            self.metrics.record_local_hit();
        }

        let mut recovered: HashMap<String, Vec<u8>> = HashMap::new();
        if !missing.is_empty() {
            if let Some(remote) = self.healthy_remote() {
                let mut unique = missing.clone();
                unique.sort();
                unique.dedup();
                match remote.get_many(&unique).await {
                    Ok(found) => recovered = found,
                    Err(e) => self.remote_failed("multi_get", &e),
                }
            }
        }

        let backfill_ttl = self.backfill_ttl();
        for (key, value) in keys.iter().zip(values.iter_mut()) {
            if value.is_some() {
                continue;
            }
            match recovered.get(key) {
                Some(found) => {
                    self.metrics.record_remote_hit();
                    self.local.insert(key, found.clone(), backfill_ttl, Tier::Remote);
                    *value = Some(found.clone());
                }
                None => self.metrics.record_cache_miss(),
            }
        }

        values
    }

    /// Store a value and report which tier accepted it synchronously.
    ///
    /// The local tier is always written. `remote_write_pct` of writes go to the
    /// remote tier inline; the rest are mirrored there in the background.
    pub async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Tier {
        let ttl = ttl.unwrap_or_else(|| self.default_ttl());
        self.local
            .insert(key, value.clone(), self.local_ttl(ttl), Tier::Local);

        let Some(remote) = self.healthy_remote() else {
            return Tier::Local;
        };

        let n = self.writes.fetch_add(1, Ordering::Relaxed);
        let remote_first = (n.wrapping_mul(37) % 100) < u64::from(self.config.remote_write_pct);

        if remote_first {
            match remote.set(key, &value, ttl).await {
                Ok(()) => Tier::Remote,
                Err(e) => {
                    self.remote_failed("set", &e);
                    Tier::Local
                }
            }
        } else {
            let remote = Arc::clone(remote);
            let metrics = Arc::clone(&self.metrics);
            let key = key.to_string();
            tokio::spawn(async move {
                match remote.set(&key, &value, ttl).await {
                    Ok(()) => debug!("Mirrored cache key '{}' to remote tier", key),
                    Err(e) => {
                        metrics.record_failover();
                        warn!("Remote cache mirror of '{}' failed: {}", key, e);
                    }
                }
            });
            Tier::Local
        }
    }

    /// Remove a key from both tiers.
    ///
    /// An unhealthy remote is skipped, so its copy lives until the remote TTL runs out.
    /// Each skip is counted in `skipped_remote_deletes`.
    pub async fn delete(&self, key: &str) {
        self.local.remove(key);
        match (&self.remote, self.healthy_remote()) {
            (_, Some(remote)) => {
                if let Err(e) = remote.delete(key).await {
                    self.remote_failed("delete", &e);
                }
            }
            (Some(_), None) => {
                self.metrics.record_skipped_remote_delete();
                warn!(
                    "Remote cache unhealthy, '{}' may stay stale there until its TTL expires",
                    key
                );
            }
            (None, None) => {}
        }
    }
}
