//! Cache groups and cache descriptors.

use crate::affinity::{AffinityKind, AffinityParams, PartitionAssignment};
use crate::config::CacheConfiguration;
use crate::types::{cache_id, AtomicityMode, CacheId, CacheMode, TopologyVersion};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Lifecycle state of a cache group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GroupState {
    /// Registered by a pending exchange, no assignment yet.
    Creating,
    /// Has a published assignment and at least one member cache.
    Active,
    /// Member set is empty; waiting for an exchange to confirm no
    /// partitions remain.
    Stopping,
    /// Torn down. Stopped groups are removed from the registry.
    Stopped,
}

impl std::fmt::Display for GroupState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GroupState::Creating => write!(f, "creating"),
            GroupState::Active => write!(f, "active"),
            GroupState::Stopping => write!(f, "stopping"),
            GroupState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Caches sharing one partition map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheGroup {
    pub name: String,
    pub partitions: u32,
    pub affinity: AffinityKind,
    pub backups: u32,
    pub cache_mode: CacheMode,
    pub atomicity_mode: AtomicityMode,
    /// Member cache names.
    pub members: BTreeSet<String>,
    pub state: GroupState,
    /// Version of the exchange that registered the group.
    pub start_version: TopologyVersion,
    /// Current partition map, absent until the first exchange completes.
    pub assignment: Option<Arc<PartitionAssignment>>,
}

impl CacheGroup {
    /// Create a group from the configuration of its first cache.
    pub fn from_config(config: &CacheConfiguration, version: TopologyVersion) -> Self {
        Self {
            name: config.group().to_string(),
            partitions: config.partitions,
            affinity: config.affinity,
            backups: config.backups,
            cache_mode: config.cache_mode,
            atomicity_mode: config.atomicity_mode,
            members: BTreeSet::new(),
            state: GroupState::Creating,
            start_version: version,
            assignment: None,
        }
    }

    pub fn affinity_params(&self) -> AffinityParams {
        AffinityParams {
            kind: self.affinity,
            partitions: self.partitions,
            backups: self.backups,
            mode: self.cache_mode,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state == GroupState::Active
    }

    pub fn contains(&self, cache: &str) -> bool {
        self.members.contains(cache)
    }

    pub fn assignment(&self) -> Option<&PartitionAssignment> {
        self.assignment.as_deref()
    }
}

/// A cache registered in a group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheDescriptor {
    pub name: String,
    pub cache_id: CacheId,
    pub group_name: String,
    pub on_heap_cache: bool,
    /// Version of the exchange that created the cache.
    pub start_version: TopologyVersion,
    pub config: CacheConfiguration,
}

impl CacheDescriptor {
    pub fn new(config: CacheConfiguration, version: TopologyVersion) -> Self {
        Self {
            name: config.name.clone(),
            cache_id: cache_id(&config.name),
            group_name: config.group().to_string(),
            on_heap_cache: config.on_heap_cache,
            start_version: version,
            config,
        }
    }
}
