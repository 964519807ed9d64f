use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Name of the single shard group built from environment settings
pub const ENV_SHARD_GROUP: &str = "default";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub shard_groups: HashMap<String, ShardGroupConfig>,
    // Partition key (e.g. district name) -> shard group name
    #[serde(default)]
    pub shard_map: HashMap<String, String>,
    pub default_shard: String,
    #[serde(default)]
    pub remote_cache: Option<RemoteCacheConfig>,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub mirror: MirrorConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ShardGroupConfig {
    pub primary: BackendConfig,
    #[serde(default)]
    pub fallback: Option<BackendConfig>,
    #[serde(default)]
    pub replicas: Vec<BackendConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackendConfig {
    pub url: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub connection_pool: ConnectionPoolConfig,
}

impl BackendConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            enabled: true,
            connection_pool: ConnectionPoolConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConnectionPoolConfig {
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_connection_timeout_secs")]
    pub connection_timeout_secs: u64,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_max_lifetime_secs")]
    pub max_lifetime_secs: u64,
    #[serde(default = "default_query_timeout_secs")]
    pub query_timeout_secs: u64,
}

impl Default for ConnectionPoolConfig {
    fn default() -> Self {
        Self {
            min_connections: default_min_connections(),
            max_connections: default_max_connections(),
            connection_timeout_secs: default_connection_timeout_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            max_lifetime_secs: default_max_lifetime_secs(),
            query_timeout_secs: default_query_timeout_secs(),
        }
    }
}

impl ConnectionPoolConfig {
    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }
}

// Default values for connection pool configuration
fn default_min_connections() -> u32 {
    2
}
fn default_max_connections() -> u32 {
    10
}
fn default_connection_timeout_secs() -> u64 {
    5
}
fn default_idle_timeout_secs() -> u64 {
    300
} // 5 minutes
fn default_max_lifetime_secs() -> u64 {
    3600
} // 1 hour
fn default_query_timeout_secs() -> u64 {
    15
}
fn default_true() -> bool {
    true
}

/// Memcached-compatible shared cache tier
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RemoteCacheConfig {
    pub server: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_remote_pool")]
    pub connection_pool: ConnectionPoolConfig,
    #[serde(default = "default_remote_timeout_ms")]
    pub operation_timeout_ms: u64,
}

impl RemoteCacheConfig {
    pub fn new(server: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            enabled: true,
            connection_pool: default_remote_pool(),
            operation_timeout_ms: default_remote_timeout_ms(),
        }
    }
}

fn default_remote_pool() -> ConnectionPoolConfig {
    ConnectionPoolConfig {
        min_connections: 1,
        max_connections: 16,
        connection_timeout_secs: 1,
        ..ConnectionPoolConfig::default()
    }
}
fn default_remote_timeout_ms() -> u64 {
    250
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheConfig {
    #[serde(default = "default_local_capacity")]
    pub local_capacity: usize,
    #[serde(default = "default_local_ttl_secs")]
    pub local_ttl_secs: u64,
    #[serde(default = "default_ttl_secs")]
    pub default_ttl_secs: u64,
    // Share of sets written synchronously to the remote tier
    #[serde(default = "default_remote_write_pct")]
    pub remote_write_pct: u8,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            local_capacity: default_local_capacity(),
            local_ttl_secs: default_local_ttl_secs(),
            default_ttl_secs: default_ttl_secs(),
            remote_write_pct: default_remote_write_pct(),
        }
    }
}

fn default_local_capacity() -> usize {
    10_000
}
fn default_local_ttl_secs() -> u64 {
    300
}
fn default_ttl_secs() -> u64 {
    3600
}
fn default_remote_write_pct() -> u8 {
    100
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HealthConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_recovery_threshold")]
    pub recovery_threshold: u32,
    #[serde(default = "default_primary_ceiling_ms")]
    pub primary_latency_ceiling_ms: u64,
    #[serde(default = "default_fallback_ceiling_ms")]
    pub fallback_latency_ceiling_ms: u64,
    #[serde(default = "default_primary_ceiling_ms")]
    pub replica_latency_ceiling_ms: u64,
    #[serde(default = "default_cache_ceiling_ms")]
    pub cache_latency_ceiling_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            probe_timeout_ms: default_probe_timeout_ms(),
            failure_threshold: default_failure_threshold(),
            recovery_threshold: default_recovery_threshold(),
            primary_latency_ceiling_ms: default_primary_ceiling_ms(),
            fallback_latency_ceiling_ms: default_fallback_ceiling_ms(),
            replica_latency_ceiling_ms: default_primary_ceiling_ms(),
            cache_latency_ceiling_ms: default_cache_ceiling_ms(),
        }
    }
}

impl HealthConfig {
    /// Probe period, never shorter than one second
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

fn default_interval_secs() -> u64 {
    30
}
fn default_probe_timeout_ms() -> u64 {
    1000
}
fn default_failure_threshold() -> u32 {
    3
}
fn default_recovery_threshold() -> u32 {
    1
}
fn default_primary_ceiling_ms() -> u64 {
    1000
}
fn default_fallback_ceiling_ms() -> u64 {
    2000
}
fn default_cache_ceiling_ms() -> u64 {
    100
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RoutingConfig {
    // Base share (percent) of reads served by the primary
    #[serde(default = "default_read_distribution_pct")]
    pub read_distribution_pct: u8,
    #[serde(default = "default_failure_threshold")]
    pub write_failover_threshold: u32,
    #[serde(default = "default_fallback_threshold_ms")]
    pub fallback_threshold_ms: u64,
    #[serde(default = "default_high_load_rps")]
    pub high_load_rps: f64,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            read_distribution_pct: default_read_distribution_pct(),
            write_failover_threshold: default_failure_threshold(),
            fallback_threshold_ms: default_fallback_threshold_ms(),
            high_load_rps: default_high_load_rps(),
        }
    }
}

fn default_read_distribution_pct() -> u8 {
    70
}
fn default_fallback_threshold_ms() -> u64 {
    500
}
fn default_high_load_rps() -> f64 {
    500.0
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MirrorConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            queue_capacity: default_queue_capacity(),
            reconcile_interval_secs: default_reconcile_interval_secs(),
            max_attempts: default_max_attempts(),
        }
    }
}

fn default_queue_capacity() -> usize {
    10_000
}
fn default_reconcile_interval_secs() -> u64 {
    15
}
fn default_max_attempts() -> u32 {
    5
}

impl Config {
    /// Load configuration from a YAML file
    pub async fn from_yaml_file(path: &str) -> Result<Self, ConfigError> {
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::FileNotFound(path.to_string())
            } else {
                ConfigError::IoError(e.to_string())
            }
        })?;

        Self::from_yaml_str(&content)
    }

    /// Parse configuration from a YAML string (useful for testing)
    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config =
            serde_yaml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;

        Ok(config)
    }

    /// Build a single-group configuration from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_vars(std::env::vars())
    }

    /// Build a single-group configuration from environment-style key/value pairs
    pub fn from_env_vars<I, K, V>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let vars = EnvVars::collect(vars);
        let primary_url = vars
            .get("DATABASE_URL")
            .ok_or_else(|| ConfigError::ValidationError("DATABASE_URL is not set".to_string()))?;

        let mut shard_groups = HashMap::new();
        shard_groups.insert(
            ENV_SHARD_GROUP.to_string(),
            ShardGroupConfig {
                primary: BackendConfig::new(primary_url),
                fallback: None,
                replicas: Vec::new(),
            },
        );

        let mut config = Config {
            shard_groups,
            shard_map: HashMap::new(),
            default_shard: ENV_SHARD_GROUP.to_string(),
            remote_cache: None,
            cache: CacheConfig::default(),
            health: HealthConfig::default(),
            routing: RoutingConfig::default(),
            mirror: MirrorConfig::default(),
        };
        config.apply_vars(&vars)?;
        config.validate()?;

        Ok(config)
    }

    /// Apply environment-style overrides on top of a file-based configuration
    pub fn apply_env_overrides<I, K, V>(&mut self, vars: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let vars = EnvVars::collect(vars);
        self.apply_vars(&vars)?;
        self.validate()
    }

    fn apply_vars(&mut self, vars: &EnvVars) -> Result<(), ConfigError> {
        let default_shard = self.default_shard.clone();
        let pool_max = vars.parse::<u32>("DB_POOL_MAX")?;
        let pool_min = vars.parse::<u32>("DB_POOL_MIN")?;

        if let Some(group) = self.shard_groups.get_mut(&default_shard) {
            if let Some(url) = vars.get("DATABASE_URL") {
                group.primary.url = url.to_string();
            }

            let fallback_enabled = vars.parse_bool("ENABLE_FALLBACK_DB")?;
            if let Some(url) = vars.get("FALLBACK_DATABASE_URL") {
                let mut fallback = BackendConfig::new(url);
                fallback.enabled = fallback_enabled.unwrap_or(true);
                group.fallback = Some(fallback);
            } else if let (Some(enabled), Some(fallback)) =
                (fallback_enabled, group.fallback.as_mut())
            {
                fallback.enabled = enabled;
            }

            if let Some(urls) = vars.get("REPLICA_DATABASE_URLS") {
                group.replicas = urls
                    .split(',')
                    .map(str::trim)
                    .filter(|url| !url.is_empty())
                    .map(BackendConfig::new)
                    .collect();
            }
        }

        for group in self.shard_groups.values_mut() {
            let backends = std::iter::once(&mut group.primary)
                .chain(group.fallback.iter_mut())
                .chain(group.replicas.iter_mut());
            for backend in backends {
                if let Some(max) = pool_max {
                    backend.connection_pool.max_connections = max;
                }
                if let Some(min) = pool_min {
                    backend.connection_pool.min_connections = min;
                }
            }
        }

        let cache_enabled = vars.parse_bool("ENABLE_REMOTE_CACHE")?;
        if let Some(server) = vars.get("REMOTE_CACHE_URL") {
            let mut remote = RemoteCacheConfig::new(server);
            remote.enabled = cache_enabled.unwrap_or(true);
            self.remote_cache = Some(remote);
        } else if let (Some(enabled), Some(remote)) = (cache_enabled, self.remote_cache.as_mut()) {
            remote.enabled = enabled;
        }

        if let Some(secs) = vars.parse("HEALTH_CHECK_INTERVAL_SECS")? {
            self.health.interval_secs = secs;
        }
        if let Some(ms) = vars.parse("HEALTH_PROBE_TIMEOUT_MS")? {
            self.health.probe_timeout_ms = ms;
        }
        if let Some(ms) = vars.parse("PRIMARY_LATENCY_CEILING_MS")? {
            self.health.primary_latency_ceiling_ms = ms;
        }
        if let Some(ms) = vars.parse("FALLBACK_LATENCY_CEILING_MS")? {
            self.health.fallback_latency_ceiling_ms = ms;
        }
        if let Some(ms) = vars.parse("CACHE_LATENCY_CEILING_MS")? {
            self.health.cache_latency_ceiling_ms = ms;
        }
        if let Some(pct) = vars.parse("READ_DISTRIBUTION_PCT")? {
            self.routing.read_distribution_pct = pct;
        }

        if let Some(pairs) = vars.get("SHARD_MAP") {
            for pair in pairs.split(',').map(str::trim).filter(|p| !p.is_empty()) {
                let (key, group) = pair.split_once('=').ok_or_else(|| {
                    ConfigError::ValidationError(format!("Invalid SHARD_MAP entry '{}'", pair))
                })?;
                self.shard_map
                    .insert(key.trim().to_string(), group.trim().to_string());
            }
        }

        Ok(())
    }

    /// Validate configuration for common errors
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.shard_groups.is_empty() {
            return Err(ConfigError::ValidationError(
                "At least one shard group is required".to_string(),
            ));
        }

        if !self.shard_groups.contains_key(&self.default_shard) {
            return Err(ConfigError::ValidationError(format!(
                "Default shard '{}' is not a configured shard group",
                self.default_shard
            )));
        }

        // Check that all shard map targets exist
        for (key, group) in &self.shard_map {
            if !self.shard_groups.contains_key(group) {
                return Err(ConfigError::ValidationError(format!(
                    "Shard key '{}' references unknown shard group '{}'",
                    key, group
                )));
            }
        }

        for (name, group) in &self.shard_groups {
            let backends = std::iter::once(&group.primary)
                .chain(group.fallback.iter())
                .chain(group.replicas.iter());
            for backend in backends {
                if backend.url.trim().is_empty() {
                    return Err(ConfigError::ValidationError(format!(
                        "Shard group '{}' has a backend without a url",
                        name
                    )));
                }
                if backend.connection_pool.max_connections == 0 {
                    return Err(ConfigError::ValidationError(format!(
                        "Shard group '{}' has a backend with max_connections = 0",
                        name
                    )));
                }
            }
        }

        if self.routing.read_distribution_pct > 100 || self.cache.remote_write_pct > 100 {
            return Err(ConfigError::ValidationError(
                "Percentages must be between 0 and 100".to_string(),
            ));
        }

        if self.health.failure_threshold == 0
            || self.health.recovery_threshold == 0
            || self.routing.write_failover_threshold == 0
        {
            return Err(ConfigError::ValidationError(
                "Health and failover thresholds must be at least 1".to_string(),
            ));
        }

        if self.health.interval_secs == 0 || self.health.probe_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "health.interval_secs and health.probe_timeout_ms must be at least 1".to_string(),
            ));
        }

        if self.mirror.reconcile_interval_secs == 0 {
            return Err(ConfigError::ValidationError(
                "mirror.reconcile_interval_secs must be at least 1".to_string(),
            ));
        }

        if self.cache.local_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "cache.local_capacity must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    /// Remote cache settings, if configured and enabled
    pub fn active_remote_cache(&self) -> Option<&RemoteCacheConfig> {
        self.remote_cache.as_ref().filter(|remote| remote.enabled)
    }
}

struct EnvVars(HashMap<String, String>);

impl EnvVars {
    fn collect<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self(
            vars.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .filter(|(_, v)| !v.trim().is_empty())
                .collect(),
        )
    }

    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(|v| v.trim())
    }

    fn parse<T: std::str::FromStr>(&self, key: &str) -> Result<Option<T>, ConfigError> {
        match self.get(key) {
            Some(raw) => raw.parse::<T>().map(Some).map_err(|_| {
                ConfigError::ValidationError(format!("Invalid value '{}' for {}", raw, key))
            }),
            None => Ok(None),
        }
    }

    fn parse_bool(&self, key: &str) -> Result<Option<bool>, ConfigError> {
        match self.get(key).map(str::to_lowercase).as_deref() {
            None => Ok(None),
            Some("1" | "true" | "yes" | "on") => Ok(Some(true)),
            Some("0" | "false" | "no" | "off") => Ok(Some(false)),
            Some(other) => Err(ConfigError::ValidationError(format!(
                "Invalid boolean '{}' for {}",
                other, key
            ))),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("File not found: {0}")]
    FileNotFound(String),
    #[error("Parse error: {0}")]
    ParseError(String),
    #[error("IO error: {0}")]
    IoError(String),
    #[error("Validation error: {0}")]
    ValidationError(String),
}
