//! Local partition store.
//!
//! Every node keeps the entries of the partitions it holds, per group and
//! partition. Entries of all caches of a group share the group's partitions
//! and are told apart by cache id.

mod heap;
pub mod preload;

pub use heap::HeapCaches;
pub use preload::Preloader;

use crate::network::{PartitionReport, SupplyEntry};
use crate::types::{CacheId, PartitionId, TopologyVersion};
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Local state of a held partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PartitionState {
    /// Assigned here, contents still being preloaded.
    Moving,
    /// Assigned here with complete contents.
    Owning,
    /// No longer assigned here; kept as a preload source until the new
    /// owners hold it.
    Renting,
    /// Cleared and removed.
    Evicted,
}

impl std::fmt::Display for PartitionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PartitionState::Moving => write!(f, "moving"),
            PartitionState::Owning => write!(f, "owning"),
            PartitionState::Renting => write!(f, "renting"),
            PartitionState::Evicted => write!(f, "evicted"),
        }
    }
}

/// Contents and state of one partition on this node.
#[derive(Debug)]
pub struct LocalPartition {
    id: PartitionId,
    /// State and the topology version that set it.
    state: RwLock<(PartitionState, TopologyVersion)>,
    entries: DashMap<(CacheId, Bytes), Bytes>,
}

impl LocalPartition {
    fn new(id: PartitionId, state: PartitionState, epoch: TopologyVersion) -> Self {
        Self {
            id,
            state: RwLock::new((state, epoch)),
            entries: DashMap::new(),
        }
    }

    pub fn id(&self) -> PartitionId {
        self.id
    }

    pub fn state(&self) -> PartitionState {
        self.state.read().0
    }

    /// Version at which the current state was set.
    pub fn epoch(&self) -> TopologyVersion {
        self.state.read().1
    }

    pub fn set_state(&self, state: PartitionState, epoch: TopologyVersion) {
        *self.state.write() = (state, epoch);
    }

    /// Move from MOVING to OWNING if the state was set at `epoch`.
    pub fn finish_moving(&self, epoch: TopologyVersion) -> bool {
        let mut state = self.state.write();
        if *state == (PartitionState::Moving, epoch) {
            state.0 = PartitionState::Owning;
            true
        } else {
            false
        }
    }

    pub fn get(&self, cache_id: CacheId, key: &Bytes) -> Option<Bytes> {
        self.entries
            .get(&(cache_id, key.clone()))
            .map(|v| v.value().clone())
    }

    pub fn put(&self, cache_id: CacheId, key: Bytes, value: Bytes) -> Option<Bytes> {
        self.entries.insert((cache_id, key), value)
    }

    /// Insert unless the key is present. Returns true if inserted.
    pub fn put_if_absent(&self, cache_id: CacheId, key: Bytes, value: Bytes) -> bool {
        let mut inserted = false;
        self.entries.entry((cache_id, key)).or_insert_with(|| {
            inserted = true;
            value
        });
        inserted
    }

    pub fn remove(&self, cache_id: CacheId, key: &Bytes) -> Option<Bytes> {
        self.entries
            .remove(&(cache_id, key.clone()))
            .map(|(_, v)| v)
    }

    /// Entries of one cache.
    pub fn size(&self, cache_id: CacheId) -> u64 {
        self.entries
            .iter()
            .filter(|e| e.key().0 == cache_id)
            .count() as u64
    }

    /// Entries of all caches.
    pub fn len(&self) -> u64 {
        self.entries.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Copy of all entries, for supplying another node.
    pub fn entries(&self) -> Vec<SupplyEntry> {
        self.entries
            .iter()
            .map(|e| SupplyEntry {
                cache_id: e.key().0,
                key: e.key().1.clone(),
                value: e.value().clone(),
            })
            .collect()
    }

    pub fn clear_cache(&self, cache_id: CacheId) {
        self.entries.retain(|(c, _), _| *c != cache_id);
    }
}

#[derive(Debug, Default)]
struct GroupPartitions {
    partitions: DashMap<PartitionId, Arc<LocalPartition>>,
}

/// All partitions held by this node.
#[derive(Debug, Default)]
pub struct PartitionStore {
    groups: DashMap<String, Arc<GroupPartitions>>,
}

impl PartitionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn group(&self, group: &str) -> Option<Arc<GroupPartitions>> {
        self.groups.get(group).map(|g| g.value().clone())
    }

    pub fn partition(&self, group: &str, partition: PartitionId) -> Option<Arc<LocalPartition>> {
        self.group(group)?
            .partitions
            .get(&partition)
            .map(|p| p.value().clone())
    }

    /// Get a partition, creating it in `state` at `epoch` if absent.
    pub fn ensure(
        &self,
        group: &str,
        partition: PartitionId,
        state: PartitionState,
        epoch: TopologyVersion,
    ) -> Arc<LocalPartition> {
        let partitions = self
            .groups
            .entry(group.to_string())
            .or_default()
            .value()
            .clone();
        let local = partitions
            .partitions
            .entry(partition)
            .or_insert_with(|| Arc::new(LocalPartition::new(partition, state, epoch)))
            .value()
            .clone();
        local
    }

    /// Clear and forget a partition.
    pub fn evict(&self, group: &str, partition: PartitionId) {
        if let Some(g) = self.group(group) {
            if let Some((_, local)) = g.partitions.remove(&partition) {
                local.set_state(PartitionState::Evicted, local.epoch());
                local.entries.clear();
                debug!(group, partition, "Evicted partition");
            }
        }
    }

    /// Forget every partition of a group.
    pub fn drop_group(&self, group: &str) {
        if let Some((_, g)) = self.groups.remove(group) {
            for entry in g.partitions.iter() {
                entry.value().set_state(PartitionState::Evicted, entry.value().epoch());
            }
            debug!(group, partitions = g.partitions.len(), "Dropped group partitions");
        }
    }

    /// Remove the entries of a destroyed cache.
    pub fn clear_cache(&self, group: &str, cache_id: CacheId) {
        for local in self.partitions(group) {
            local.clear_cache(cache_id);
        }
    }

    pub fn groups(&self) -> Vec<String> {
        self.groups.iter().map(|g| g.key().clone()).collect()
    }

    pub fn holds_group(&self, group: &str) -> bool {
        self.group(group)
            .map(|g| !g.partitions.is_empty())
            .unwrap_or(false)
    }

    /// Held partitions of a group.
    pub fn partitions(&self, group: &str) -> Vec<Arc<LocalPartition>> {
        self.group(group)
            .map(|g| g.partitions.iter().map(|p| p.value().clone()).collect())
            .unwrap_or_default()
    }

    /// States and sizes of all held partitions, for the exchange.
    pub fn report(&self) -> BTreeMap<String, Vec<PartitionReport>> {
        let mut report = BTreeMap::new();
        for group in self.groups() {
            let mut parts: Vec<PartitionReport> = self
                .partitions(&group)
                .iter()
                .map(|p| PartitionReport {
                    partition: p.id(),
                    state: p.state(),
                    size: p.len(),
                })
                .collect();
            if parts.is_empty() {
                continue;
            }
            parts.sort_by_key(|r| r.partition);
            report.insert(group, parts);
        }
        report
    }

    /// Entries of a cache over the given partitions.
    pub fn size(
        &self,
        group: &str,
        cache_id: CacheId,
        partitions: impl IntoIterator<Item = PartitionId>,
    ) -> u64 {
        let Some(g) = self.group(group) else {
            return 0;
        };
        partitions
            .into_iter()
            .filter_map(|p| g.partitions.get(&p).map(|l| l.value().size(cache_id)))
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    #[test]
    fn test_partition_entries_per_cache() {
        let store = PartitionStore::new();
        let p = store.ensure("g", 3, PartitionState::Owning, 1);
        p.put(1, b("k"), b("v1"));
        p.put(2, b("k"), b("v2"));

        assert_eq!(p.get(1, &b("k")), Some(b("v1")));
        assert_eq!(p.get(2, &b("k")), Some(b("v2")));
        assert_eq!(p.size(1), 1);
        assert_eq!(p.len(), 2);

        assert!(!p.put_if_absent(1, b("k"), b("other")));
        assert!(p.put_if_absent(1, b("k2"), b("v")));
        assert_eq!(p.get(1, &b("k")), Some(b("v1")));

        store.clear_cache("g", 1);
        assert_eq!(p.size(1), 0);
        assert_eq!(p.size(2), 1);
    }

    #[test]
    fn test_ensure_keeps_existing() {
        let store = PartitionStore::new();
        let p = store.ensure("g", 0, PartitionState::Moving, 4);
        p.put(1, b("k"), b("v"));

        let again = store.ensure("g", 0, PartitionState::Owning, 5);
        assert_eq!(again.state(), PartitionState::Moving);
        assert_eq!(again.epoch(), 4);
        assert_eq!(again.len(), 1);
    }

    #[test]
    fn test_finish_moving_checks_epoch() {
        let store = PartitionStore::new();
        let p = store.ensure("g", 0, PartitionState::Moving, 4);
        assert!(!p.finish_moving(3));
        assert!(p.finish_moving(4));
        assert_eq!(p.state(), PartitionState::Owning);
        assert!(!p.finish_moving(4));
    }

    #[test]
    fn test_report_and_eviction() {
        let store = PartitionStore::new();
        store.ensure("g", 2, PartitionState::Owning, 1).put(1, b("a"), b("1"));
        store.ensure("g", 1, PartitionState::Renting, 1);

        let report = store.report();
        let parts = &report["g"];
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].partition, 1);
        assert_eq!(parts[1].size, 1);

        store.evict("g", 1);
        assert!(store.partition("g", 1).is_none());
        assert_eq!(store.size("g", 1, [1, 2]), 1);

        store.drop_group("g");
        assert!(!store.holds_group("g"));
        assert!(store.report().is_empty());
    }
}
