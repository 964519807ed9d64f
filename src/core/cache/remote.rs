use super::CacheError;
use crate::config::RemoteCacheConfig;
use crate::core::connection_pool::{self, ConnectionPoolBuilder, MemcachedPool};
use crate::core::protocols::ascii;
use crate::core::shard::fnv1a64;
use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Shared remote cache tier
#[async_trait]
pub trait RemoteCache: Send + Sync {
    /// Fetch several keys in one round trip; missing keys are absent from the map
    async fn get_many(&self, keys: &[String]) -> Result<HashMap<String, Vec<u8>>, CacheError>;

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), CacheError>;

    async fn delete(&self, key: &str) -> Result<(), CacheError>;

    /// Liveness check outside the request pool
    async fn ping(&self) -> Result<(), CacheError>;
}

// memcached reads expirations above 30 days as absolute unix timestamps
const MAX_RELATIVE_EXPTIME: u64 = 60 * 60 * 24 * 30;

/// Remote tier backed by a memcached-compatible server
pub struct MemcachedRemote {
    server: String,
    pool: MemcachedPool,
    max_connections: u32,
    operation_timeout: Duration,
}

impl MemcachedRemote {
    /// Build the remote tier; the pool connects lazily
    pub fn from_config(config: &RemoteCacheConfig) -> Self {
        Self {
            server: config.server.clone(),
            pool: ConnectionPoolBuilder::build_memcached_pool(
                config.server.clone(),
                &config.connection_pool,
            ),
            max_connections: config.connection_pool.max_connections,
            operation_timeout: Duration::from_millis(config.operation_timeout_ms),
        }
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    async fn with_timeout<T>(
        &self,
        operation: impl Future<Output = Result<T, CacheError>>,
    ) -> Result<T, CacheError> {
        timeout(self.operation_timeout, operation)
            .await
            .map_err(|_| CacheError::Timeout(self.operation_timeout))?
    }
}

/// Keys memcached cannot carry (spaces, control bytes, > 250 bytes) are hashed
pub fn wire_key(key: &str) -> String {
    if ascii::is_valid_key(key) {
        key.to_string()
    } else {
        format!("k:{:016x}", fnv1a64(key.as_bytes()))
    }
}

fn exptime(ttl: Duration) -> u32 {
    ttl.as_secs().clamp(1, MAX_RELATIVE_EXPTIME) as u32
}

#[async_trait]
impl RemoteCache for MemcachedRemote {
    async fn get_many(&self, keys: &[String]) -> Result<HashMap<String, Vec<u8>>, CacheError> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }

        let mut by_wire: HashMap<String, &String> = HashMap::with_capacity(keys.len());
        for key in keys {
            by_wire.insert(wire_key(key), key);
        }
        let wire_keys: Vec<String> = by_wire.keys().cloned().collect();

        let found = self
            .with_timeout(async {
                let mut conn = connection_pool::acquire(&self.pool, self.max_connections).await?;
                Ok(ascii::get_many(&mut *conn, &wire_keys).await?)
            })
            .await?;

        Ok(found
            .into_iter()
            .filter_map(|(wire, value)| by_wire.get(&wire).map(|key| ((*key).clone(), value)))
            .collect())
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), CacheError> {
        let wire = wire_key(key);
        self.with_timeout(async {
            let mut conn = connection_pool::acquire(&self.pool, self.max_connections).await?;
            Ok(ascii::set(&mut *conn, &wire, value, exptime(ttl)).await?)
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let wire = wire_key(key);
        self.with_timeout(async {
            let mut conn = connection_pool::acquire(&self.pool, self.max_connections).await?;
            ascii::delete(&mut *conn, &wire).await?;
            Ok(())
        })
        .await
    }

    async fn ping(&self) -> Result<(), CacheError> {
        self.with_timeout(async {
            let mut stream = TcpStream::connect(&self.server)
                .await
                .map_err(|e| CacheError::Unreachable(e.to_string()))?;
            ascii::version(&mut stream).await?;
            Ok(())
        })
        .await
    }
}
