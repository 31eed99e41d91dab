//! Per-node registry of cache groups.
//!
//! The registry publishes one immutable [`RegistryState`] per completed
//! exchange. Readers load the current table lock-free; only the exchange
//! pipeline publishes, always as a whole-table replacement.
//!
//! Client nodes see a group only while one of its caches is started locally.

mod group;
mod state;
mod validator;

pub use group::{CacheDescriptor, CacheGroup, GroupState};
pub use state::RegistryState;
pub use validator::ConsistencyValidator;

use crate::types::{NodeId, NodeRole, TopologyVersion};
use arc_swap::ArcSwap;
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug)]
pub struct CacheGroupRegistry {
    node_id: NodeId,
    role: NodeRole,
    /// Last published table.
    state: ArcSwap<RegistryState>,
    /// Client-only: caches started locally, by group.
    local: RwLock<HashMap<String, BTreeSet<String>>>,
}

impl CacheGroupRegistry {
    pub fn new(node_id: NodeId, role: NodeRole) -> Self {
        Self {
            node_id,
            role,
            state: ArcSwap::from_pointee(RegistryState::default()),
            local: RwLock::new(HashMap::new()),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn role(&self) -> NodeRole {
        self.role
    }

    /// Current published table.
    pub fn snapshot(&self) -> Arc<RegistryState> {
        self.state.load_full()
    }

    /// Version of the last applied exchange.
    pub fn version(&self) -> TopologyVersion {
        self.state.load().version
    }

    /// Replace the published table.
    pub fn publish(&self, state: Arc<RegistryState>) {
        debug!(
            node_id = self.node_id,
            version = state.version,
            groups = state.groups.len(),
            caches = state.caches.len(),
            "Publishing registry"
        );

        if !self.role.is_server() {
            let mut local = self.local.write();
            local.retain(|group, caches| {
                caches.retain(|c| {
                    state
                        .caches
                        .get(c)
                        .map(|d| &d.group_name == group)
                        .unwrap_or(false)
                });
                !caches.is_empty()
            });
        }

        self.state.store(state);
    }

    /// Group visible on this node, if any.
    pub fn cache_group(&self, name: &str) -> Option<CacheGroup> {
        let state = self.snapshot();
        let group = state.group(name)?;
        self.is_visible(group).then(|| group.clone())
    }

    /// All groups visible on this node.
    pub fn groups_snapshot(&self) -> Vec<CacheGroup> {
        let state = self.snapshot();
        state
            .groups
            .values()
            .filter(|g| self.is_visible(g))
            .cloned()
            .collect()
    }

    pub fn cache_descriptor(&self, name: &str) -> Option<CacheDescriptor> {
        self.snapshot().cache(name).cloned()
    }

    /// Record a cache as started on this node. No-op on servers.
    pub fn start_local(&self, descriptor: &CacheDescriptor) {
        if self.role.is_server() {
            return;
        }
        self.local
            .write()
            .entry(descriptor.group_name.clone())
            .or_default()
            .insert(descriptor.name.clone());
    }

    /// Record a cache as stopped on this node. No-op on servers.
    pub fn stop_local(&self, cache: &str) {
        if self.role.is_server() {
            return;
        }
        let mut local = self.local.write();
        local.retain(|_, caches| {
            caches.remove(cache);
            !caches.is_empty()
        });
    }

    fn is_visible(&self, group: &CacheGroup) -> bool {
        if group.state != GroupState::Active {
            return false;
        }
        if self.role.is_server() {
            return true;
        }
        self.local
            .read()
            .get(&group.name)
            .map(|caches| !caches.is_empty())
            .unwrap_or(false)
    }
}
