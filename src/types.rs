//! Core types used throughout the cache-group subsystem.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::Hasher;
use twox_hash::XxHash64;

/// Node identifier in the cluster.
pub type NodeId = u64;

/// Monotonically increasing topology version.
pub type TopologyVersion = u64;

/// Partition number inside a cache group.
pub type PartitionId = u32;

/// Stable numeric identifier of a cache, derived from its name.
pub type CacheId = u32;

/// How a cache distributes its partitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CacheMode {
    /// Each partition has one primary and a configured number of backups.
    Partitioned,
    /// Every server node owns every partition.
    Replicated,
}

impl fmt::Display for CacheMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheMode::Partitioned => write!(f, "PARTITIONED"),
            CacheMode::Replicated => write!(f, "REPLICATED"),
        }
    }
}

/// Update semantics of a cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AtomicityMode {
    /// Single-entry atomic updates.
    Atomic,
    /// Multi-entry transactional updates.
    Transactional,
}

impl fmt::Display for AtomicityMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AtomicityMode::Atomic => write!(f, "ATOMIC"),
            AtomicityMode::Transactional => write!(f, "TRANSACTIONAL"),
        }
    }
}

/// Role of a node in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeRole {
    /// Owns partitions and takes part in affinity.
    Server,
    /// Routes every data operation to server nodes.
    Client,
}

impl NodeRole {
    /// Check if this role owns partitions.
    pub fn is_server(&self) -> bool {
        matches!(self, NodeRole::Server)
    }
}

/// Which local entries a size or peek query looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeekMode {
    /// Entries in partitions this node is primary for.
    Primary,
    /// Entries in partitions this node is backup for.
    Backup,
    /// Every locally held entry.
    All,
}

/// Derive the cache id from a cache name.
pub fn cache_id(name: &str) -> CacheId {
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(name.as_bytes());
    hasher.finish() as CacheId
}

/// Map a serialized key to its partition.
pub fn partition_for_key(key: &[u8], partitions: u32) -> PartitionId {
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(key);
    (hasher.finish() % partitions.max(1) as u64) as PartitionId
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_id_is_stable() {
        assert_eq!(cache_id("cache1"), cache_id("cache1"));
        assert_ne!(cache_id("cache1"), cache_id("cache2"));
    }

    #[test]
    fn test_partition_for_key_in_range() {
        for i in 0..1000u32 {
            let p = partition_for_key(&i.to_be_bytes(), 64);
            assert!(p < 64);
        }
        assert_eq!(partition_for_key(b"key", 0), 0);
    }

    #[test]
    fn test_mode_display() {
        assert_eq!(CacheMode::Partitioned.to_string(), "PARTITIONED");
        assert_eq!(CacheMode::Replicated.to_string(), "REPLICATED");
        assert_eq!(AtomicityMode::Transactional.to_string(), "TRANSACTIONAL");
    }
}
