//! Two-tier cache: a bounded process-local tier in front of a shared remote tier.

pub mod local;
pub mod remote;
pub mod tiered;

pub use local::{CacheEntry, LocalTier, Tier};
pub use remote::{MemcachedRemote, RemoteCache};
pub use tiered::TieredCache;

use crate::core::connection_pool::ConnectionError;
use crate::core::protocols::ProtocolError;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Remote cache unreachable: {0}")]
    Unreachable(String),
    #[error("Remote cache timed out after {0:?}")]
    Timeout(Duration),
    #[error("Remote cache protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("Remote cache pool: {0}")]
    Pool(#[from] ConnectionError),
}
