pub mod backend;
pub mod cache;
pub mod connection_pool;
pub mod health;
pub mod metrics;
pub mod mirror;
pub mod policy;
pub mod protocols;
pub mod replica;
pub mod shard;

// Re-export core traits
pub use backend::{Backend, BackendDescriptor, BackendError, BackendRole, PgBackend};
pub use backend::{Operation, Param, Rows, Statement, WriteOp, WriteOutcome};
pub use cache::{LocalTier, MemcachedRemote, RemoteCache, Tier, TieredCache};
pub use connection_pool::{ConnectionPoolBuilder, MemcachedPool, PgPool};
pub use health::{HealthMonitor, HealthRegistry, HealthState, Probe, ProbeError};
pub use metrics::{BackendMetrics, BackendMetricsSnapshot, LayerMetrics, LayerMetricsSnapshot};
pub use mirror::{MirrorQueue, PendingMirror, Reconciler};
pub use policy::{compute_policy, GroupHealth, LoadMeter, LoadSnapshot, RoutingPolicy};
pub use replica::{BackendStatus, ReplicaRouter, RouteError, ShardGroup, WriteResult, WriteTarget};
pub use shard::{PartitionKey, ShardGroupId, ShardMap, ShardResolution, ShardRouter};
