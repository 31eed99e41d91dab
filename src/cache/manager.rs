//! Per-node state of cache handles.
//!
//! A handle is OPEN after create or get, CLOSED after close, and
//! NOT_PRESENT when the node never opened it or its cache went away.
//! Closing is local: the cache stays registered cluster-wide.

use crate::registry::{CacheDescriptor, RegistryState};
use crate::types::{NodeId, TopologyVersion};
use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandleState {
    NotPresent,
    Open,
    Closed,
}

#[derive(Debug, Clone)]
struct HandleEntry {
    state: HandleState,
    group: String,
    /// Start version of the cache the handle was opened on.
    start_version: TopologyVersion,
}

#[derive(Debug)]
pub struct CacheHandleManager {
    node_id: NodeId,
    handles: RwLock<HashMap<String, HandleEntry>>,
}

impl CacheHandleManager {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            handles: RwLock::new(HashMap::new()),
        }
    }

    pub fn state(&self, cache: &str) -> HandleState {
        self.handles
            .read()
            .get(cache)
            .map(|e| e.state)
            .unwrap_or(HandleState::NotPresent)
    }

    pub fn open(&self, descriptor: &CacheDescriptor) {
        self.handles.write().insert(
            descriptor.name.clone(),
            HandleEntry {
                state: HandleState::Open,
                group: descriptor.group_name.clone(),
                start_version: descriptor.start_version,
            },
        );
        debug!(node_id = self.node_id, cache = %descriptor.name, "Handle opened");
    }

    /// Close an open handle. Returns false if it was not open.
    pub fn close(&self, cache: &str) -> bool {
        let mut handles = self.handles.write();
        match handles.get_mut(cache) {
            Some(entry) if entry.state == HandleState::Open => {
                entry.state = HandleState::Closed;
                debug!(node_id = self.node_id, cache, "Handle closed");
                true
            }
            _ => false,
        }
    }

    /// Drop handles whose cache or group no longer exists.
    ///
    /// An open handle goes away with its cache. A closed one stays closed
    /// until its group is stopped.
    pub fn on_exchange_applied(&self, table: &RegistryState) {
        let mut handles = self.handles.write();
        handles.retain(|name, entry| {
            let keep = match entry.state {
                HandleState::Open => table
                    .cache(name)
                    .map(|d| d.start_version == entry.start_version)
                    .unwrap_or(false),
                HandleState::Closed => table.group(&entry.group).is_some(),
                HandleState::NotPresent => false,
            };
            if !keep {
                debug!(node_id = self.node_id, cache = %name, "Handle no longer present");
            }
            keep
        });
    }
}
