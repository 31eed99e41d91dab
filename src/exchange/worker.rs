//! The per-node exchange pipeline.
//!
//! One task consumes discovery events in order. Each event (or batch of
//! events after a supersession) is staged on a copy of the applied registry,
//! reported to the coordinator, merged there and applied everywhere before
//! the next one begins.

use super::actions::{CacheChangeKind, ExchangeAction, ExchangeTrigger};
use super::future::{ExchangeRecord, ExchangeState};
use super::merge::{adopt_registry, merge, MergeInput};
use crate::affinity::PartitionAssignment;
use crate::cluster::{CustomEvent, DiscoveryEvent, TopologyEvent, TopologySnapshot};
use crate::error::{Error, Result};
use crate::network::{FullMessage, Message, SingleMessage};
use crate::node::NodeContext;
use crate::registry::RegistryState;
use crate::types::{NodeId, TopologyVersion};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Exchange messages handed over by the dispatcher.
#[derive(Debug)]
pub enum ExchangeInput {
    Single(SingleMessage),
    Full(Box<FullMessage>),
}

/// Outcome of one cache change request staged in an exchange.
struct RequestOutcome {
    id: Uuid,
    initiator: NodeId,
    result: Result<()>,
}

/// The exchange this node is working on.
struct PendingExchange {
    version: TopologyVersion,
    events: Vec<TopologyEvent>,
    topology: TopologySnapshot,
    coordinator: NodeId,
    staged: RegistryState,
    outcomes: Vec<RequestOutcome>,
    actions: Vec<ExchangeAction>,
    /// The batch confirms late assignments.
    confirm: bool,
    merged: bool,
    started: Instant,
}

impl PendingExchange {
    fn trigger(&self) -> ExchangeTrigger {
        ExchangeTrigger::of_batch(self.events.iter().map(|e| &e.event))
            .unwrap_or(ExchangeTrigger::CacheChange)
    }

    /// Whether a leave or failure of `event` removes one of this
    /// exchange's participants.
    fn loses_participant(&self, event: &DiscoveryEvent) -> bool {
        event.is_leave()
            && event
                .node_id()
                .map(|n| self.topology.contains(n))
                .unwrap_or(false)
    }
}

pub struct ExchangeWorker {
    ctx: NodeContext,
    /// No exchange has been applied on this node yet.
    fresh: bool,
    queue: VecDeque<TopologyEvent>,
    current: Option<PendingExchange>,
    /// Reports received as coordinator, by version and sender.
    singles: BTreeMap<TopologyVersion, BTreeMap<NodeId, SingleMessage>>,
    fulls: BTreeMap<TopologyVersion, FullMessage>,
}

impl ExchangeWorker {
    pub(crate) fn new(ctx: NodeContext) -> Self {
        Self {
            ctx,
            fresh: true,
            queue: VecDeque::new(),
            current: None,
            singles: BTreeMap::new(),
            fulls: BTreeMap::new(),
        }
    }

    fn node_id(&self) -> NodeId {
        self.ctx.node_id
    }

    /// Run until shutdown or until discovery drops this node.
    pub async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<TopologyEvent>,
        mut inbox: mpsc::UnboundedReceiver<ExchangeInput>,
        mut shutdown: mpsc::Receiver<()>,
    ) {
        info!(node_id = self.node_id(), "Exchange worker started");

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!(node_id = self.node_id(), "Exchange worker shutting down");
                    break;
                }
                event = events.recv() => match event {
                    Some(event) => {
                        event.log(self.node_id());
                        self.queue.push_back(event);
                    }
                    None => {
                        info!(node_id = self.node_id(), "Discovery closed, exchange worker stopping");
                        break;
                    }
                },
                input = inbox.recv() => match input {
                    Some(ExchangeInput::Single(single)) => self.on_single(single),
                    Some(ExchangeInput::Full(full)) => self.on_full(*full),
                    None => break,
                },
            }
            self.progress();
        }

        self.ctx.preloader.stop();
        self.ctx.futures.close();
    }

    fn on_single(&mut self, single: SingleMessage) {
        let floor = self.current.as_ref().map(|c| c.version).unwrap_or(0);
        if single.version < floor {
            debug!(
                node_id = self.node_id(),
                version = single.version,
                sender = single.sender,
                "Stale partition report dropped"
            );
            return;
        }
        self.singles
            .entry(single.version)
            .or_default()
            .insert(single.sender, single);
    }

    fn on_full(&mut self, full: FullMessage) {
        if full.version <= self.ctx.registry.version() {
            debug!(node_id = self.node_id(), version = full.version, "Stale full map dropped");
            return;
        }
        self.fulls.insert(full.version, full);
    }

    fn progress(&mut self) {
        loop {
            if self.current.is_none() {
                let Some(event) = self.queue.pop_front() else {
                    return;
                };
                self.begin(vec![event]);
                continue;
            }
            if self.try_apply() || self.try_merge() || self.try_supersede() {
                continue;
            }
            return;
        }
    }

    /// Stage a batch of events and report to the coordinator.
    fn begin(&mut self, events: Vec<TopologyEvent>) {
        let Some(last) = events.last() else {
            return;
        };
        let version = last.version;
        let topology = last.topology.clone();
        let node_id = self.node_id();
        self.ctx.metrics.exchanges_started.inc();

        let mut staged = (*self.ctx.registry.snapshot()).clone();
        let mut outcomes = Vec::new();
        let mut actions = Vec::new();
        let mut confirm = false;

        for event in &events {
            match &event.event {
                DiscoveryEvent::Custom(CustomEvent::CacheChange(request)) => {
                    self.ctx.metrics.cache_requests.inc();
                    let result = match &request.kind {
                        CacheChangeKind::Start(config) => {
                            let group = config.group().to_string();
                            staged
                                .register_cache(config.clone(), version, &self.ctx.validator)
                                .map(|()| {
                                    actions.push(ExchangeAction::StartCache {
                                        cache: config.name.clone(),
                                        group,
                                    })
                                })
                        }
                        CacheChangeKind::Stop(cache) => {
                            let group = staged.cache(cache).map(|d| d.group_name.clone());
                            if let Some(group) = group {
                                staged.unregister_cache(cache);
                                let emptied = staged
                                    .group(&group)
                                    .map(|g| g.members.is_empty())
                                    .unwrap_or(false);
                                actions.push(ExchangeAction::StopCache {
                                    cache: cache.clone(),
                                    group: group.clone(),
                                });
                                if emptied {
                                    actions.push(ExchangeAction::StopGroup { group });
                                }
                            }
                            Ok(())
                        }
                    };

                    if let Err(e) = &result {
                        if matches!(e, Error::ConfigurationConflict(_)) {
                            self.ctx.metrics.cache_conflicts.inc();
                        }
                        debug!(
                            node_id,
                            version,
                            cache = request.cache_name(),
                            error = %e,
                            "Cache change rejected"
                        );
                    }
                    outcomes.push(RequestOutcome {
                        id: request.id,
                        initiator: request.initiator,
                        result,
                    });
                }
                DiscoveryEvent::Custom(CustomEvent::AffinityConfirm { .. }) => {
                    confirm = true;
                    actions.push(ExchangeAction::ConfirmAffinity);
                }
                _ => {}
            }
        }
        staged.version = version;
        staged.servers = topology.servers();

        let Some(coordinator) = topology.coordinator() else {
            self.fail(version, &events, outcomes, actions, "no server nodes left in topology");
            return;
        };

        for group in staged.stopping_groups() {
            self.ctx.store.drop_group(&group);
        }

        let has_join = events.iter().any(|e| e.event.is_join());
        let single = SingleMessage {
            version,
            sender: node_id,
            fresh: self.fresh,
            partitions: self.ctx.store.report(),
            registry: (!self.fresh && has_join).then(|| staged.clone()),
        };

        debug!(
            node_id,
            version,
            coordinator,
            events = events.len(),
            "Exchange started"
        );
        self.ctx.futures.set_state(version, ExchangeState::Collecting);

        if coordinator == node_id {
            self.singles.entry(version).or_default().insert(node_id, single);
        } else if let Err(e) = self.ctx.transport.send(coordinator, &Message::Single(single)) {
            // A coordinator that cannot be reached leaves, and its leave
            // supersedes this exchange.
            warn!(node_id, version, coordinator, error = %e, "Failed to send partition report");
        }

        self.current = Some(PendingExchange {
            version,
            events,
            topology,
            coordinator,
            staged,
            outcomes,
            actions,
            confirm,
            merged: false,
            started: Instant::now(),
        });
    }

    /// Complete a batch that cannot converge.
    fn fail(
        &mut self,
        version: TopologyVersion,
        events: &[TopologyEvent],
        outcomes: Vec<RequestOutcome>,
        actions: Vec<ExchangeAction>,
        reason: &str,
    ) {
        let reason = format!("{} at version {}", reason, version);
        warn!(node_id = self.node_id(), version, %reason, "Exchange failed");

        for outcome in outcomes {
            if outcome.initiator == self.node_id() {
                self.ctx
                    .futures
                    .complete_request(outcome.id, Err(Error::ClusterTopology(reason.clone())));
            }
        }
        self.ctx
            .futures
            .complete(version, ExchangeState::Failed(reason.clone()));
        self.ctx.metrics.exchanges_failed.inc();
        self.ctx.futures.record(ExchangeRecord {
            version,
            trigger: ExchangeTrigger::of_batch(events.iter().map(|e| &e.event))
                .unwrap_or(ExchangeTrigger::CacheChange),
            outcome: ExchangeState::Failed(reason),
            duration: std::time::Duration::ZERO,
            actions,
        });
    }

    /// Merge once every participant has reported. Coordinator only.
    fn try_merge(&mut self) -> bool {
        let node_id = self.node_id();
        let Some(current) = self.current.as_mut() else {
            return false;
        };
        if current.merged || current.coordinator != node_id {
            return false;
        }
        let Some(reports) = self.singles.get(&current.version) else {
            return false;
        };
        let participants = current.topology.node_ids();
        if !participants.iter().all(|n| reports.contains_key(n)) {
            return false;
        }

        self.ctx
            .futures
            .set_state(current.version, ExchangeState::Merging);

        let adopted = if self.fresh {
            adopt_registry(reports)
        } else {
            None
        };
        let table = adopted.as_ref().unwrap_or(&current.staged);
        let full = merge(MergeInput {
            version: current.version,
            coordinator: node_id,
            table,
            reports,
            late_assignment: self.ctx.config.affinity.late_assignment,
            confirm: current.confirm,
        });
        current.merged = true;

        info!(
            node_id,
            version = full.version,
            groups = full.assignments.len(),
            stopped = full.stopped.len(),
            late = full.late,
            "Partition maps merged"
        );

        let msg = Message::Full(Box::new(full.clone()));
        for &participant in &participants {
            if participant == node_id {
                continue;
            }
            if let Err(e) = self.ctx.transport.send(participant, &msg) {
                warn!(node_id, participant, error = %e, "Failed to send full map");
            }
        }
        self.fulls.insert(full.version, full);
        true
    }

    /// Supersede the current exchange if a participant left.
    fn try_supersede(&mut self) -> bool {
        let Some(current) = self.current.as_ref() else {
            return false;
        };
        let Some(cut) = self
            .queue
            .iter()
            .rposition(|e| current.loses_participant(&e.event))
        else {
            return false;
        };

        let Some(mut pending) = self.current.take() else {
            return false;
        };
        let absorbed: Vec<TopologyEvent> = self.queue.drain(..=cut).collect();
        let by = absorbed.last().map(|e| e.version).unwrap_or(pending.version);

        warn!(
            node_id = self.node_id(),
            version = pending.version,
            superseded_by = by,
            "Exchange superseded"
        );
        self.ctx.metrics.exchanges_superseded.inc();
        self.ctx.futures.record(ExchangeRecord {
            version: pending.version,
            trigger: pending.trigger(),
            outcome: ExchangeState::Superseded { by },
            duration: pending.started.elapsed(),
            actions: Vec::new(),
        });

        let overtaken =
            std::iter::once(pending.version).chain(absorbed.iter().map(|e| e.version));
        for version in overtaken.filter(|&v| v != by) {
            self.ctx
                .futures
                .complete(version, ExchangeState::Superseded { by });
        }

        self.singles.retain(|&v, _| v >= by);
        self.fulls.retain(|&v, _| v >= by);

        pending.events.extend(absorbed);
        self.begin(pending.events);
        true
    }

    /// Apply the full map of the current exchange if it has arrived.
    fn try_apply(&mut self) -> bool {
        let Some(version) = self.current.as_ref().map(|c| c.version) else {
            return false;
        };
        let Some(full) = self.fulls.remove(&version) else {
            return false;
        };
        let Some(pending) = self.current.take() else {
            return false;
        };
        self.apply(pending, full);
        true
    }

    fn apply(&mut self, pending: PendingExchange, full: FullMessage) {
        let node_id = self.node_id();
        let version = pending.version;
        let previous = self.ctx.registry.snapshot();

        let mut table = match (self.fresh, full.registry) {
            (true, Some(registry)) => registry,
            _ => pending.staged,
        };
        table.version = version;
        table.servers = pending.topology.servers();

        let prior: BTreeMap<String, Option<Arc<PartitionAssignment>>> = table
            .groups
            .iter()
            .map(|(name, g)| (name.clone(), g.assignment.clone()))
            .collect();

        for group in &full.stopped {
            if table.remove_group(group).is_some() {
                debug!(node_id, version, group = %group, "Group stopped");
            }
        }

        let mut changed = Vec::new();
        for (group, assignment) in full.assignments {
            let same = prior
                .get(&group)
                .and_then(|a| a.as_deref())
                .map(|a| a.same_owners(&assignment))
                .unwrap_or(false);
            if !same {
                changed.push(group.clone());
            }
            table.install_assignment(&group, assignment);
        }

        // Caches that were destroyed, or recreated under the same name.
        for (name, old) in &previous.caches {
            let kept = table
                .cache(name)
                .map(|d| d.start_version == old.start_version)
                .unwrap_or(false);
            if !kept {
                self.ctx.store.clear_cache(&old.group_name, old.cache_id);
                self.ctx.heap.remove_cache(old.cache_id);
            }
        }

        let tasks = self
            .ctx
            .preloader
            .reconcile(&table, &prior, &full.fully_owned);
        self.ctx.metrics.partitions_preloaded.inc_by(tasks.len() as u64);

        let table = Arc::new(table);
        self.ctx.registry.publish(table.clone());

        for group in &changed {
            if let Some(g) = table.group(group) {
                for cache in &g.members {
                    if let Some(d) = table.cache(cache) {
                        self.ctx.heap.invalidate_cache(d.cache_id);
                    }
                }
            }
        }

        self.ctx.preloader.start(tasks);
        self.ctx.handles.on_exchange_applied(&table);

        for outcome in pending.outcomes {
            if outcome.initiator == node_id {
                self.ctx.futures.complete_request(outcome.id, outcome.result);
            }
        }

        let duration = pending.started.elapsed();
        self.ctx.futures.complete(version, ExchangeState::Applied);
        self.ctx.metrics.record_exchange_applied(version, duration);

        let trigger = ExchangeTrigger::of_batch(pending.events.iter().map(|e| &e.event))
            .unwrap_or(ExchangeTrigger::CacheChange);
        info!(
            node_id,
            version,
            %trigger,
            groups = table.groups.len(),
            caches = table.caches.len(),
            duration_ms = duration.as_millis() as u64,
            "Exchange applied"
        );
        self.ctx.futures.record(ExchangeRecord {
            version,
            trigger,
            outcome: ExchangeState::Applied,
            duration,
            actions: pending.actions,
        });

        if full.late && full.coordinator == node_id {
            self.schedule_confirm(version);
        }

        self.fresh = false;
        self.singles.retain(|&v, _| v > version);
        self.fulls.retain(|&v, _| v > version);
    }

    /// Send an affinity confirmation after the configured delay.
    fn schedule_confirm(&self, based_on: TopologyVersion) {
        let discovery = self.ctx.discovery.clone();
        let delay = self.ctx.config.affinity.confirm_delay;
        let node_id = self.node_id();
        debug!(node_id, based_on, ?delay, "Scheduling affinity confirmation");

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = discovery.send_custom(CustomEvent::AffinityConfirm { based_on }) {
                debug!(node_id, based_on, error = %e, "Affinity confirmation not sent");
            }
        });
    }
}
