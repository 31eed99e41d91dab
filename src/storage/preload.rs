//! Partition preloading: filling partitions newly assigned to this node.
//!
//! After an exchange is applied every newly assigned partition is marked
//! MOVING and demanded from its previous owners, one supplier at a time.
//! A supplier that has not applied the demanded version yet answers
//! `NotReady` and is asked again; one without a complete copy answers
//! `Missing` and the next source is tried. When no source is left the
//! partition becomes OWNING with whatever it holds.

use super::{PartitionState, PartitionStore};
use crate::affinity::PartitionAssignment;
use crate::error::{Error, NetworkError, Result};
use crate::network::{DemandMessage, Message, PendingRequests, Supply, SupplyMessage, Transport};
use crate::registry::RegistryState;
use crate::types::{NodeId, PartitionId, TopologyVersion};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Partition to fill from the given sources.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreloadTask {
    pub group: String,
    pub partition: PartitionId,
    /// Candidate suppliers in the order they are asked.
    pub sources: Vec<NodeId>,
    /// Version whose assignment made this node an owner.
    pub version: TopologyVersion,
}

pub struct Preloader {
    node_id: NodeId,
    store: Arc<PartitionStore>,
    transport: Arc<dyn Transport>,
    pending: PendingRequests<SupplyMessage>,
    retry_interval: Duration,
    request_timeout: Duration,
    stopped: AtomicBool,
}

impl Preloader {
    pub fn new(
        node_id: NodeId,
        store: Arc<PartitionStore>,
        transport: Arc<dyn Transport>,
        retry_interval: Duration,
        request_timeout: Duration,
    ) -> Self {
        Self {
            node_id,
            store,
            transport,
            pending: PendingRequests::new(),
            retry_interval,
            request_timeout,
            stopped: AtomicBool::new(false),
        }
    }

    /// Bring local partition states in line with a newly applied table.
    ///
    /// `prior` holds every group's assignment before this exchange and
    /// `fully_owned` the partitions whose assigned owners all hold them.
    /// Returns the partitions to preload.
    pub fn reconcile(
        &self,
        state: &RegistryState,
        prior: &BTreeMap<String, Option<Arc<PartitionAssignment>>>,
        fully_owned: &BTreeMap<String, Vec<PartitionId>>,
    ) -> Vec<PreloadTask> {
        let version = state.version;
        let mut tasks = Vec::new();

        for group in self.store.groups() {
            if !state.groups.contains_key(&group) {
                self.store.drop_group(&group);
            }
        }

        for (name, group) in &state.groups {
            let Some(assignment) = group.assignment() else {
                continue;
            };
            let previous = prior.get(name).cloned().flatten();
            let owned: BTreeSet<PartitionId> =
                assignment.partitions_of(self.node_id).into_iter().collect();

            for &p in &owned {
                let sources = Self::sources(self.node_id, p, previous.as_deref(), assignment, &state.servers);
                match self.store.partition(name, p) {
                    Some(local) => match local.state() {
                        PartitionState::Owning => {}
                        PartitionState::Moving => {
                            local.set_state(PartitionState::Moving, version);
                            tasks.push(PreloadTask {
                                group: name.clone(),
                                partition: p,
                                sources,
                                version,
                            });
                        }
                        PartitionState::Renting | PartitionState::Evicted => {
                            // Writes made while renting went elsewhere.
                            local.entries.clear();
                            local.set_state(PartitionState::Moving, version);
                            tasks.push(PreloadTask {
                                group: name.clone(),
                                partition: p,
                                sources,
                                version,
                            });
                        }
                    },
                    None if previous.is_none() => {
                        self.store.ensure(name, p, PartitionState::Owning, version);
                    }
                    None => {
                        self.store.ensure(name, p, PartitionState::Moving, version);
                        tasks.push(PreloadTask {
                            group: name.clone(),
                            partition: p,
                            sources,
                            version,
                        });
                    }
                }
            }

            for local in self.store.partitions(name) {
                if owned.contains(&local.id()) {
                    continue;
                }
                match local.state() {
                    PartitionState::Owning => local.set_state(PartitionState::Renting, version),
                    PartitionState::Moving => self.store.evict(name, local.id()),
                    PartitionState::Renting | PartitionState::Evicted => {}
                }
            }

            if let Some(done) = fully_owned.get(name) {
                for &p in done {
                    let renting = self
                        .store
                        .partition(name, p)
                        .map(|l| l.state() == PartitionState::Renting)
                        .unwrap_or(false);
                    if renting {
                        self.store.evict(name, p);
                    }
                }
            }
        }

        if !tasks.is_empty() {
            info!(
                node_id = self.node_id,
                version,
                partitions = tasks.len(),
                "Preloading partitions"
            );
        }
        tasks
    }

    /// Previous owners first, then current ones; never this node.
    fn sources(
        node_id: NodeId,
        partition: PartitionId,
        previous: Option<&PartitionAssignment>,
        current: &PartitionAssignment,
        servers: &[NodeId],
    ) -> Vec<NodeId> {
        let mut sources: Vec<NodeId> = Vec::new();
        let prev_owners = previous.map(|a| a.owners(partition)).unwrap_or(&[]);
        for &n in prev_owners.iter().chain(current.owners(partition)) {
            if n != node_id && servers.contains(&n) && !sources.contains(&n) {
                sources.push(n);
            }
        }
        sources
    }

    /// Spawn one preload per task.
    pub fn start(self: &Arc<Self>, tasks: Vec<PreloadTask>) {
        for task in tasks {
            let preloader = self.clone();
            tokio::spawn(async move {
                preloader.preload(task).await;
            });
        }
    }

    async fn preload(&self, task: PreloadTask) {
        for &source in &task.sources {
            loop {
                if self.stopped.load(Ordering::Relaxed) || !self.is_current(&task) {
                    return;
                }

                match self.demand(source, &task).await {
                    Ok(Supply::Entries(entries)) => {
                        let Some(local) = self.store.partition(&task.group, task.partition) else {
                            return;
                        };
                        let count = entries.len();
                        for e in entries {
                            local.put_if_absent(e.cache_id, e.key, e.value);
                        }
                        if local.finish_moving(task.version) {
                            debug!(
                                node_id = self.node_id,
                                group = %task.group,
                                partition = task.partition,
                                source,
                                entries = count,
                                "Partition preloaded"
                            );
                        }
                        return;
                    }
                    Ok(Supply::NotReady) => {
                        tokio::time::sleep(self.retry_interval).await;
                    }
                    Ok(Supply::Missing) => break,
                    Err(e) => {
                        debug!(
                            node_id = self.node_id,
                            source,
                            partition = task.partition,
                            error = %e,
                            "Demand failed, trying next source"
                        );
                        break;
                    }
                }
            }
        }

        if let Some(local) = self.store.partition(&task.group, task.partition) {
            if local.finish_moving(task.version) && !task.sources.is_empty() {
                warn!(
                    node_id = self.node_id,
                    group = %task.group,
                    partition = task.partition,
                    "No supplier had partition, owning it without preload"
                );
            }
        }
    }

    fn is_current(&self, task: &PreloadTask) -> bool {
        self.store
            .partition(&task.group, task.partition)
            .map(|l| l.state() == PartitionState::Moving && l.epoch() == task.version)
            .unwrap_or(false)
    }

    async fn demand(&self, source: NodeId, task: &PreloadTask) -> Result<Supply> {
        let (request_id, rx) = self.pending.register();
        let msg = Message::Demand(DemandMessage {
            request_id,
            version: task.version,
            group: task.group.clone(),
            partition: task.partition,
        });

        if let Err(e) = self.transport.send(source, &msg) {
            self.pending.cancel(request_id);
            return Err(e);
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(supply)) => Ok(supply.supply),
            Ok(Err(_)) => Err(NetworkError::ChannelClosed.into()),
            Err(_) => {
                self.pending.cancel(request_id);
                Err(Error::Timeout)
            }
        }
    }

    /// Answer a demand from another node.
    pub fn handle_demand(&self, published: TopologyVersion, demand: DemandMessage) -> SupplyMessage {
        let supply = if published < demand.version {
            Supply::NotReady
        } else {
            match self.store.partition(&demand.group, demand.partition) {
                Some(local)
                    if matches!(
                        local.state(),
                        PartitionState::Owning | PartitionState::Renting
                    ) =>
                {
                    Supply::Entries(local.entries())
                }
                _ => Supply::Missing,
            }
        };

        SupplyMessage {
            request_id: demand.request_id,
            group: demand.group,
            partition: demand.partition,
            supply,
        }
    }

    /// Deliver a supply to the waiting preload.
    pub fn handle_supply(&self, supply: SupplyMessage) {
        if !self.pending.complete(supply.request_id, supply) {
            debug!(node_id = self.node_id, "Supply for unknown demand dropped");
        }
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Relaxed);
    }
}
