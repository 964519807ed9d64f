use crate::config::ConnectionPoolConfig;
use async_trait::async_trait;
use bb8::{ManageConnection, Pool, PooledConnection, RunError};
use sqlx::{Connection, PgConnection};
use std::time::Duration;
use tokio::net::TcpStream;

/// Connection manager for bb8 that opens Postgres connections through sqlx
#[derive(Debug, Clone)]
pub struct PgConnectionManager {
    url: String,
}

impl PgConnectionManager {
    pub fn new(url: String) -> Self {
        Self { url }
    }

    /// Open a connection outside of any pool (used for health probes)
    pub async fn open(&self) -> Result<PgConnection, ConnectionError> {
        PgConnection::connect(&self.url)
            .await
            .map_err(|e| ConnectionError::ConnectionFailed(e.to_string()))
    }
}

#[async_trait]
impl ManageConnection for PgConnectionManager {
    type Connection = PgConnection;
    type Error = ConnectionError;

    async fn connect(&self) -> Result<Self::Connection, Self::Error> {
        self.open().await
    }

    async fn is_valid(&self, conn: &mut Self::Connection) -> Result<(), Self::Error> {
        conn.ping()
            .await
            .map_err(|_| ConnectionError::ConnectionInvalid)
    }

    fn has_broken(&self, _conn: &mut Self::Connection) -> bool {
        // bb8 catches broken connections through is_valid
        false
    }
}

/// Connection manager for bb8 that creates TCP connections to memcached servers
#[derive(Debug, Clone)]
pub struct MemcachedConnectionManager {
    server_address: String,
}

impl MemcachedConnectionManager {
    pub fn new(server_address: String) -> Self {
        Self { server_address }
    }
}

#[async_trait]
impl ManageConnection for MemcachedConnectionManager {
    type Connection = TcpStream;
    type Error = ConnectionError;

    async fn connect(&self) -> Result<Self::Connection, Self::Error> {
        let stream = TcpStream::connect(&self.server_address)
            .await
            .map_err(|e| ConnectionError::ConnectionFailed(e.to_string()))?;

        optimize_socket_for_latency(&stream);

        Ok(stream)
    }

    async fn is_valid(&self, conn: &mut Self::Connection) -> Result<(), Self::Error> {
        // A peer that closed the socket shows up as readable with zero bytes pending
        let mut probe = [0u8; 1];
        match conn.try_read(&mut probe) {
            Ok(0) => Err(ConnectionError::ConnectionInvalid),
            Ok(_) => Err(ConnectionError::ConnectionInvalid),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(()),
            Err(_) => Err(ConnectionError::ConnectionInvalid),
        }
    }

    fn has_broken(&self, _conn: &mut Self::Connection) -> bool {
        false
    }
}

/// Optimize TCP socket for low latency
pub(crate) fn optimize_socket_for_latency(stream: &TcpStream) {
    // Disable Nagle's algorithm for lower latency
    let _ = stream.set_nodelay(true);

    let socket_ref = socket2::SockRef::from(stream);
    let _ = socket_ref.set_reuse_address(true);

    // 32KB buffers balance latency vs throughput for cache operations
    let _ = socket_ref.set_send_buffer_size(32768);
    let _ = socket_ref.set_recv_buffer_size(32768);
}

/// Type alias for the Postgres request pool
pub type PgPool = Pool<PgConnectionManager>;

/// Type alias for the memcached request pool
pub type MemcachedPool = Pool<MemcachedConnectionManager>;

/// Builder for creating connection pools
pub struct ConnectionPoolBuilder;

impl ConnectionPoolBuilder {
    /// Create a pool without waiting for the first connections.
    ///
    /// The layer must come up while a backend is unreachable, so connection
    /// errors surface on acquire rather than here.
    pub fn build_lazy<M: ManageConnection>(manager: M, config: &ConnectionPoolConfig) -> Pool<M> {
        Pool::builder()
            .min_idle(Some(config.min_connections.min(config.max_connections)))
            .max_size(config.max_connections)
            .connection_timeout(Duration::from_secs(config.connection_timeout_secs.max(1)))
            .idle_timeout(Some(Duration::from_secs(config.idle_timeout_secs)))
            .max_lifetime(Some(Duration::from_secs(config.max_lifetime_secs)))
            .build_unchecked(manager)
    }

    pub fn build_pg_pool(url: String, config: &ConnectionPoolConfig) -> PgPool {
        Self::build_lazy(PgConnectionManager::new(url), config)
    }

    pub fn build_memcached_pool(server_address: String, config: &ConnectionPoolConfig) -> MemcachedPool {
        Self::build_lazy(MemcachedConnectionManager::new(server_address), config)
    }
}

/// Check a connection out of the pool, failing fast when the pool is saturated.
///
/// Callers never queue behind a full pool: if every connection is checked out
/// and the cap is reached the acquire returns [`ConnectionError::PoolExhausted`].
pub async fn acquire<M>(
    pool: &Pool<M>,
    max_size: u32,
) -> Result<PooledConnection<'_, M>, ConnectionError>
where
    M: ManageConnection<Error = ConnectionError>,
{
    let state = pool.state();
    if state.idle_connections == 0 && state.connections >= max_size {
        return Err(ConnectionError::PoolExhausted(max_size));
    }

    if state.connections == 0 {
        // Nothing established yet: dial once outside the pool so an unreachable
        // backend fails now instead of after the pool's connection timeout.
        pool.dedicated_connection().await?;
    }

    pool.get().await.map_err(|e| match e {
        RunError::User(e) => e,
        RunError::TimedOut => ConnectionError::PoolExhausted(max_size),
    })
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Connection pool exhausted ({0} connections in use)")]
    PoolExhausted(u32),
    #[error("Connection is invalid")]
    ConnectionInvalid,
}
