//! The registry table: groups, caches and their partition maps at one version.

use super::group::{CacheDescriptor, CacheGroup, GroupState};
use super::validator::ConsistencyValidator;
use crate::affinity::PartitionAssignment;
use crate::config::CacheConfiguration;
use crate::error::{Error, Result};
use crate::types::{NodeId, TopologyVersion};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// One immutable version of the registry once published.
///
/// The exchange pipeline stages changes on a clone and publishes the clone
/// as a whole.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryState {
    /// Version of the exchange that produced this table.
    pub version: TopologyVersion,
    /// Alive server nodes at that version.
    pub servers: Vec<NodeId>,
    pub groups: BTreeMap<String, CacheGroup>,
    pub caches: BTreeMap<String, CacheDescriptor>,
}

impl RegistryState {
    pub fn group(&self, name: &str) -> Option<&CacheGroup> {
        self.groups.get(name)
    }

    pub fn cache(&self, name: &str) -> Option<&CacheDescriptor> {
        self.caches.get(name)
    }

    /// Group of a cache.
    pub fn group_of(&self, cache: &str) -> Option<&CacheGroup> {
        self.caches
            .get(cache)
            .and_then(|d| self.groups.get(&d.group_name))
    }

    /// Check a cache configuration without mutating anything.
    pub fn check_register(
        &self,
        config: &CacheConfiguration,
        validator: &ConsistencyValidator,
    ) -> Result<()> {
        if self.caches.contains_key(&config.name) {
            return Err(Error::DuplicateCacheName(config.name.clone()));
        }
        if let Some(group) = self.groups.get(config.group()) {
            if group.state != GroupState::Stopping {
                validator.validate(group, config)?;
            }
        }
        Ok(())
    }

    /// Register a cache, creating its group lazily.
    ///
    /// On error nothing is changed.
    pub fn register_cache(
        &mut self,
        config: CacheConfiguration,
        version: TopologyVersion,
        validator: &ConsistencyValidator,
    ) -> Result<()> {
        self.check_register(&config, validator)?;

        let group_name = config.group().to_string();
        let revive = self
            .groups
            .get(&group_name)
            .map(|g| g.state == GroupState::Stopping)
            .unwrap_or(true);
        if revive {
            // A stopping group has no members left; its replacement starts
            // from the new cache's configuration.
            self.groups
                .insert(group_name.clone(), CacheGroup::from_config(&config, version));
        }

        if let Some(group) = self.groups.get_mut(&group_name) {
            group.members.insert(config.name.clone());
        }
        self.caches
            .insert(config.name.clone(), CacheDescriptor::new(config, version));
        Ok(())
    }

    /// Unregister a cache. Returns false if it was not registered.
    ///
    /// A group whose member set becomes empty moves to STOPPING.
    pub fn unregister_cache(&mut self, name: &str) -> bool {
        let Some(descriptor) = self.caches.remove(name) else {
            return false;
        };

        if let Some(group) = self.groups.get_mut(&descriptor.group_name) {
            group.members.remove(name);
            if group.members.is_empty() {
                group.state = GroupState::Stopping;
            }
        }
        true
    }

    /// Names of groups waiting for stop confirmation.
    pub fn stopping_groups(&self) -> Vec<String> {
        self.groups
            .values()
            .filter(|g| g.state == GroupState::Stopping)
            .map(|g| g.name.clone())
            .collect()
    }

    /// Install the partition map of a group and activate it.
    pub fn install_assignment(&mut self, group: &str, assignment: PartitionAssignment) {
        if let Some(g) = self.groups.get_mut(group) {
            g.assignment = Some(Arc::new(assignment));
            if g.state == GroupState::Creating {
                g.state = GroupState::Active;
            }
        }
    }

    /// Remove a group confirmed as stopped.
    pub fn remove_group(&mut self, name: &str) -> Option<CacheGroup> {
        let mut group = self.groups.remove(name)?;
        group.state = GroupState::Stopped;
        Some(group)
    }
}
