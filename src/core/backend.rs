use crate::config::BackendConfig;
use crate::core::connection_pool::{self, ConnectionError, ConnectionPoolBuilder, PgConnectionManager, PgPool};
use crate::core::metrics::BackendMetrics;
use crate::core::shard::fnv1a64;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgArguments, PgConnection};
use sqlx::types::Json;
use sqlx::{Connection, Postgres, Row};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OnceCell};
use tokio::time::timeout;
use uuid::Uuid;

/// Role a backend plays inside its shard group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendRole {
    Primary,
    Fallback,
    Replica,
    /// The shared remote cache tier
    Cache,
}

impl fmt::Display for BackendRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackendRole::Primary => "primary",
            BackendRole::Fallback => "fallback",
            BackendRole::Replica => "replica",
            BackendRole::Cache => "cache",
        };
        f.write_str(name)
    }
}

/// Identity and capacity of one physical backend.
///
/// Everything is fixed at startup except `is_active`, which operators flip.
#[derive(Debug)]
pub struct BackendDescriptor {
    pub name: String,
    pub shard_group: String,
    pub role: BackendRole,
    pub address: String,
    pub capacity: u32,
    is_active: AtomicBool,
}

impl BackendDescriptor {
    pub fn new(
        name: impl Into<String>,
        shard_group: impl Into<String>,
        role: BackendRole,
        address: impl Into<String>,
        capacity: u32,
    ) -> Self {
        Self {
            name: name.into(),
            shard_group: shard_group.into(),
            role,
            address: address.into(),
            capacity,
            is_active: AtomicBool::new(true),
        }
    }

    pub fn is_active(&self) -> bool {
        self.is_active.load(Ordering::Acquire)
    }

    pub fn set_active(&self, active: bool) {
        self.is_active.store(active, Ordering::Release);
    }
}

/// A positional statement parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Param {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Json(serde_json::Value),
}

/// A raw SQL statement with `$n` placeholders
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Statement {
    pub sql: String,
    #[serde(default)]
    pub params: Vec<Param>,
}

impl Statement {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    pub fn bind(mut self, param: Param) -> Self {
        self.params.push(param);
        self
    }

    /// Stable fingerprint of the SQL text and parameters, used as a cache key
    pub fn fingerprint(&self) -> String {
        let mut material = self.sql.clone().into_bytes();
        // Param serialization cannot fail: it only holds JSON-representable values
        if let Ok(params) = serde_json::to_vec(&self.params) {
            material.push(0);
            material.extend_from_slice(&params);
        }
        format!("q:{:016x}", fnv1a64(&material))
    }
}

/// Result rows, each rendered as a JSON object
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Rows {
    pub records: Vec<serde_json::Value>,
}

impl Rows {
    pub fn new(records: Vec<serde_json::Value>) -> Self {
        Self { records }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// What a write does
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operation {
    Statement(Statement),
    /// Typed (bulk) insert of JSON records into a logical table
    Insert {
        table: String,
        records: Vec<serde_json::Value>,
    },
}

/// A write carrying the idempotency key shared by its primary and mirrored applications
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteOp {
    pub idempotency_key: Uuid,
    pub operation: Operation,
}

impl WriteOp {
    pub fn new(operation: Operation) -> Self {
        Self {
            idempotency_key: Uuid::new_v4(),
            operation,
        }
    }

    pub fn statement(statement: Statement) -> Self {
        Self::new(Operation::Statement(statement))
    }

    pub fn insert(
        table: impl Into<String>,
        records: Vec<serde_json::Value>,
    ) -> Result<Self, BackendError> {
        let table = table.into();
        validate_table_name(&table)?;
        Ok(Self::new(Operation::Insert { table, records }))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WriteOutcome {
    pub rows_affected: u64,
    /// The idempotency key was already recorded; nothing was applied
    pub deduplicated: bool,
}

/// Core trait for one physical backend (primary, fallback or replica store)
#[async_trait]
pub trait Backend: Send + Sync {
    fn descriptor(&self) -> &BackendDescriptor;

    fn name(&self) -> &str {
        &self.descriptor().name
    }

    /// Run a row-returning statement
    async fn execute(&self, statement: &Statement) -> Result<Rows, BackendError>;

    /// Apply a write at most once per idempotency key
    async fn apply(&self, op: &WriteOp) -> Result<WriteOutcome, BackendError>;

    /// Liveness check over a connection separate from the request pool
    async fn ping(&self, limit: Duration) -> Result<Duration, BackendError>;

    fn metrics(&self) -> Arc<BackendMetrics>;
}

/// Run a backend call, recording its outcome and latency on the backend's metrics
pub async fn execute_with_metrics<T>(
    backend: &dyn Backend,
    operation: impl std::future::Future<Output = Result<T, BackendError>> + Send,
) -> Result<T, BackendError> {
    let start = Instant::now();
    let result = operation.await;
    let latency = start.elapsed();

    let metrics = backend.metrics();
    match &result {
        Ok(_) => metrics.record_success(latency),
        Err(BackendError::Timeout(_)) => metrics.record_timeout(),
        Err(_) => metrics.record_failure(Some(latency)),
    }

    result
}

/// Postgres backend with a bounded request pool and a dedicated probe connection
pub struct PgBackend {
    descriptor: BackendDescriptor,
    pool: PgPool,
    manager: PgConnectionManager,
    probe: Mutex<Option<PgConnection>>,
    query_timeout: Duration,
    ledger_table: String,
    ledger_ready: OnceCell<()>,
    metrics: Arc<BackendMetrics>,
}

/// Table recording applied idempotency keys
pub const DEFAULT_LEDGER_TABLE: &str = "heimdall_applied_writes";

impl PgBackend {
    /// Create a backend from configuration. No connection is made here.
    pub fn from_config(
        name: String,
        shard_group: &str,
        role: BackendRole,
        config: &BackendConfig,
    ) -> Self {
        let pool = ConnectionPoolBuilder::build_pg_pool(config.url.clone(), &config.connection_pool);
        let descriptor = BackendDescriptor::new(
            name.clone(),
            shard_group,
            role,
            redact_url(&config.url),
            config.connection_pool.max_connections,
        );
        descriptor.set_active(config.enabled);

        Self {
            descriptor,
            pool,
            manager: PgConnectionManager::new(config.url.clone()),
            probe: Mutex::new(None),
            query_timeout: config.connection_pool.query_timeout(),
            ledger_table: DEFAULT_LEDGER_TABLE.to_string(),
            ledger_ready: OnceCell::new(),
            metrics: Arc::new(BackendMetrics::new(name)),
        }
    }

    async fn acquire(&self) -> Result<bb8::PooledConnection<'_, PgConnectionManager>, BackendError> {
        connection_pool::acquire(&self.pool, self.descriptor.capacity)
            .await
            .map_err(BackendError::from)
    }

    async fn ensure_ledger(&self) -> Result<(), BackendError> {
        self.ledger_ready
            .get_or_try_init(|| async {
                let mut conn = self.acquire().await?;
                let ddl = format!(
                    "CREATE TABLE IF NOT EXISTS {} (\
                     idempotency_key UUID PRIMARY KEY, \
                     applied_at TIMESTAMPTZ NOT NULL DEFAULT now())",
                    self.ledger_table
                );
                sqlx::query(&ddl)
                    .execute(&mut *conn)
                    .await
                    .map_err(query_failed)?;
                Ok::<(), BackendError>(())
            })
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl Backend for PgBackend {
    fn descriptor(&self) -> &BackendDescriptor {
        &self.descriptor
    }

    async fn execute(&self, statement: &Statement) -> Result<Rows, BackendError> {
        let mut conn = self.acquire().await?;
        let sql = format!("SELECT row_to_json(q) FROM ({}) q", statement.sql);
        let query = bind_params(sqlx::query(&sql), &statement.params);

        let rows = timeout(self.query_timeout, query.fetch_all(&mut *conn))
            .await
            .map_err(|_| BackendError::Timeout(self.query_timeout))?
            .map_err(query_failed)?;

        let records = rows
            .iter()
            .map(|row| row.try_get::<serde_json::Value, _>(0))
            .collect::<Result<Vec<_>, _>>()
            .map_err(query_failed)?;

        Ok(Rows::new(records))
    }

    async fn apply(&self, op: &WriteOp) -> Result<WriteOutcome, BackendError> {
        if let Operation::Insert { table, .. } = &op.operation {
            validate_table_name(table)?;
        }
        self.ensure_ledger().await?;

        let mut conn = self.acquire().await?;
        timeout(
            self.query_timeout,
            apply_in_transaction(&mut conn, &self.ledger_table, op),
        )
        .await
        .map_err(|_| BackendError::Timeout(self.query_timeout))?
        .map_err(query_failed)
    }

    async fn ping(&self, limit: Duration) -> Result<Duration, BackendError> {
        let start = Instant::now();
        let mut slot = self.probe.lock().await;

        match timeout(limit, probe_once(&mut slot, &self.manager)).await {
            Ok(Ok(())) => Ok(start.elapsed()),
            Ok(Err(e)) => {
                *slot = None;
                Err(e)
            }
            Err(_) => {
                // The probe connection may be wedged mid-query; start over next time
                *slot = None;
                Err(BackendError::Timeout(limit))
            }
        }
    }

    fn metrics(&self) -> Arc<BackendMetrics> {
        Arc::clone(&self.metrics)
    }
}

async fn probe_once(
    slot: &mut Option<PgConnection>,
    manager: &PgConnectionManager,
) -> Result<(), BackendError> {
    if slot.is_none() {
        *slot = Some(manager.open().await?);
    }
    let conn = slot
        .as_mut()
        .ok_or_else(|| BackendError::ConnectionFailed("probe connection missing".to_string()))?;

    sqlx::query("SELECT 1")
        .execute(conn)
        .await
        .map_err(query_failed)?;
    Ok(())
}

async fn apply_in_transaction(
    conn: &mut PgConnection,
    ledger_table: &str,
    op: &WriteOp,
) -> Result<WriteOutcome, sqlx::Error> {
    let mut tx = conn.begin().await?;

    let claim = format!(
        "INSERT INTO {} (idempotency_key) VALUES ($1) ON CONFLICT DO NOTHING",
        ledger_table
    );
    let claimed = sqlx::query(&claim)
        .bind(op.idempotency_key)
        .execute(&mut *tx)
        .await?;

    if claimed.rows_affected() == 0 {
        tx.rollback().await?;
        return Ok(WriteOutcome {
            rows_affected: 0,
            deduplicated: true,
        });
    }

    let result = match &op.operation {
        Operation::Statement(statement) => {
            bind_params(sqlx::query(&statement.sql), &statement.params)
                .execute(&mut *tx)
                .await?
        }
        Operation::Insert { table, records } => {
            let sql = format!(
                "INSERT INTO {table} SELECT * FROM jsonb_populate_recordset(NULL::{table}, $1)"
            );
            sqlx::query(&sql)
                .bind(Json(records))
                .execute(&mut *tx)
                .await?
        }
    };

    tx.commit().await?;

    Ok(WriteOutcome {
        rows_affected: result.rows_affected(),
        deduplicated: false,
    })
}

fn bind_params<'q>(
    mut query: sqlx::query::Query<'q, Postgres, PgArguments>,
    params: &'q [Param],
) -> sqlx::query::Query<'q, Postgres, PgArguments> {
    for param in params {
        query = match param {
            Param::Null => query.bind(None::<String>),
            Param::Bool(value) => query.bind(*value),
            Param::Int(value) => query.bind(*value),
            Param::Float(value) => query.bind(*value),
            Param::Text(value) => query.bind(value.as_str()),
            Param::Json(value) => query.bind(Json(value)),
        };
    }
    query
}

/// Table names are spliced into SQL, so only plain (optionally schema-qualified) identifiers pass
pub fn validate_table_name(table: &str) -> Result<(), BackendError> {
    let is_identifier = |part: &str| {
        let mut chars = part.chars();
        matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
            && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
    };

    let parts: Vec<&str> = table.split('.').collect();
    if parts.len() <= 2 && parts.iter().all(|part| is_identifier(part)) {
        Ok(())
    } else {
        Err(BackendError::InvalidOperation(format!(
            "Invalid table name '{}'",
            table
        )))
    }
}

/// Strip credentials from a connection URL before it is logged or reported
pub fn redact_url(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***{}", &url[..scheme_end], &url[at..])
        }
        _ => url.to_string(),
    }
}

fn query_failed(e: sqlx::Error) -> BackendError {
    match e {
        sqlx::Error::Io(e) => BackendError::ConnectionFailed(e.to_string()),
        sqlx::Error::PoolTimedOut => BackendError::PoolExhausted,
        other => BackendError::QueryFailed(other.to_string()),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Connection pool exhausted")]
    PoolExhausted,
    #[error("Timed out after {0:?}")]
    Timeout(Duration),
    #[error("Query failed: {0}")]
    QueryFailed(String),
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
    #[error("Backend unavailable")]
    Unavailable,
}

impl BackendError {
    /// Errors worth retrying against another backend
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BackendError::ConnectionFailed(_)
                | BackendError::Timeout(_)
                | BackendError::Unavailable
                | BackendError::PoolExhausted
        )
    }
}

impl From<ConnectionError> for BackendError {
    fn from(e: ConnectionError) -> Self {
        match e {
            ConnectionError::PoolExhausted(_) => BackendError::PoolExhausted,
            other => BackendError::ConnectionFailed(other.to_string()),
        }
    }
}
