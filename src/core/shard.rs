//! Partition key to shard group resolution.
//!
//! Shard groups are numbered by the lexicographic order of their names, so a
//! given configuration always yields the same [`ShardGroupId`]s no matter how
//! the configuration map happened to be iterated.

use crate::core::metrics::LayerMetrics;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::warn;

/// Index of a shard group inside the [`ShardMap`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ShardGroupId(usize);

impl ShardGroupId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for ShardGroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "shard-{}", self.0)
    }
}

/// How a request names its partition
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PartitionKey {
    /// A natural partition dimension looked up in the shard map (e.g. a district)
    Named(String),
    /// An identity key distributed by stable hash
    Identity(String),
    /// No partition dimension; always the default group
    Unpartitioned,
}

impl PartitionKey {
    pub fn named(key: impl Into<String>) -> Self {
        PartitionKey::Named(key.into())
    }

    pub fn identity(key: impl Into<String>) -> Self {
        PartitionKey::Identity(key.into())
    }
}

/// Outcome of resolving a named partition key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardResolution {
    Mapped(ShardGroupId),
    /// The key had no shard map entry and went to the default group
    Defaulted(ShardGroupId),
}

impl ShardResolution {
    pub fn group(self) -> ShardGroupId {
        match self {
            ShardResolution::Mapped(id) | ShardResolution::Defaulted(id) => id,
        }
    }
}

/// Static partition-key -> shard-group table, loaded once at startup
#[derive(Debug, Clone)]
pub struct ShardMap {
    group_names: Vec<String>,
    entries: HashMap<String, ShardGroupId>,
    default_group: ShardGroupId,
}

impl ShardMap {
    /// Build a shard map from group names, key -> group-name entries and the default group name
    pub fn new<'a>(
        group_names: impl IntoIterator<Item = &'a str>,
        entries: &HashMap<String, String>,
        default_group: &str,
    ) -> Result<Self, ShardError> {
        let mut group_names: Vec<String> = group_names.into_iter().map(str::to_string).collect();
        group_names.sort();
        group_names.dedup();

        if group_names.is_empty() {
            return Err(ShardError::NoGroups);
        }

        let lookup = |name: &str| {
            group_names
                .binary_search_by(|candidate| candidate.as_str().cmp(name))
                .map(ShardGroupId)
                .map_err(|_| ShardError::UnknownGroup(name.to_string()))
        };

        let default_group = lookup(default_group)?;
        let entries = entries
            .iter()
            .map(|(key, group)| Ok((key.clone(), lookup(group)?)))
            .collect::<Result<HashMap<_, _>, ShardError>>()?;

        Ok(Self {
            group_names,
            entries,
            default_group,
        })
    }

    pub fn group_count(&self) -> usize {
        self.group_names.len()
    }

    pub fn default_group(&self) -> ShardGroupId {
        self.default_group
    }

    pub fn group_name(&self, id: ShardGroupId) -> &str {
        &self.group_names[id.0]
    }

    pub fn group_id(&self, name: &str) -> Option<ShardGroupId> {
        self.group_names
            .iter()
            .position(|candidate| candidate == name)
            .map(ShardGroupId)
    }

    pub fn groups(&self) -> impl Iterator<Item = (ShardGroupId, &str)> {
        self.group_names
            .iter()
            .enumerate()
            .map(|(index, name)| (ShardGroupId(index), name.as_str()))
    }

    /// Pure lookup: mapped group, or the default for unmapped keys
    pub fn lookup(&self, key: &str) -> ShardResolution {
        match self.entries.get(key) {
            Some(id) => ShardResolution::Mapped(*id),
            None => ShardResolution::Defaulted(self.default_group),
        }
    }
}

/// Resolves partition keys to shard groups
pub struct ShardRouter {
    map: ShardMap,
    metrics: Arc<LayerMetrics>,
}

impl ShardRouter {
    pub fn new(map: ShardMap, metrics: Arc<LayerMetrics>) -> Self {
        Self { map, metrics }
    }

    pub fn shard_map(&self) -> &ShardMap {
        &self.map
    }

    /// Resolve a named partition key. Unmapped keys are not an error: they go
    /// to the default group and leave a warning behind.
    pub fn resolve_shard(&self, partition_key: &str) -> ShardResolution {
        let resolution = self.map.lookup(partition_key);
        if let ShardResolution::Defaulted(group) = resolution {
            self.metrics.record_unmapped_shard_key();
            warn!(
                partition_key,
                shard = %self.map.group_name(group),
                "Unmapped shard key routed to default shard group"
            );
        }
        resolution
    }

    /// Distribute an identity key across all groups with a restart-stable hash
    pub fn resolve_shard_by_hash(&self, identity_key: &str) -> ShardGroupId {
        let count = self.map.group_count() as u64;
        ShardGroupId((fnv1a64(identity_key.as_bytes()) % count) as usize)
    }

    pub fn resolve(&self, key: &PartitionKey) -> ShardGroupId {
        match key {
            PartitionKey::Named(name) => self.resolve_shard(name).group(),
            PartitionKey::Identity(identity) => self.resolve_shard_by_hash(identity),
            PartitionKey::Unpartitioned => self.map.default_group(),
        }
    }
}

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// 64-bit FNV-1a; fixed constants, no per-process seed
pub fn fnv1a64(bytes: &[u8]) -> u64 {
    bytes.iter().fold(FNV_OFFSET_BASIS, |hash, byte| {
        (hash ^ u64::from(*byte)).wrapping_mul(FNV_PRIME)
    })
}

#[derive(Debug, thiserror::Error)]
pub enum ShardError {
    #[error("No shard groups configured")]
    NoGroups,
    #[error("Unknown shard group: {0}")]
    UnknownGroup(String),
}
