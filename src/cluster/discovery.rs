//! Discovery: totally ordered membership and custom events.
//!
//! [`LocalDiscovery`] is an in-process hub. Every event it accepts gets the
//! next topology version and is delivered to all alive nodes, in the same
//! order, through unbounded channels.

use super::events::{CustomEvent, DiscoveryEvent, TopologyEvent};
use super::topology::{ClusterNode, TopologySnapshot};
use crate::error::{Error, Result};
use crate::types::{NodeId, NodeRole, TopologyVersion};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Discovery as seen by one node.
pub trait Discovery: Send + Sync + 'static {
    /// This node's ID.
    fn local_node(&self) -> NodeId;

    /// Current alive nodes.
    fn topology(&self) -> TopologySnapshot;

    /// Send a custom event to every node, ordered with membership events.
    /// Returns the topology version assigned to the event.
    fn send_custom(&self, event: CustomEvent) -> Result<TopologyVersion>;

    /// Leave the cluster gracefully.
    fn leave(&self);
}

#[derive(Debug, Default)]
struct HubState {
    version: TopologyVersion,
    next_order: u64,
    nodes: Vec<ClusterNode>,
    subscribers: HashMap<NodeId, mpsc::UnboundedSender<TopologyEvent>>,
}

impl HubState {
    fn snapshot(&self) -> TopologySnapshot {
        TopologySnapshot::new(self.version, self.nodes.clone())
    }

    /// Stamp and deliver an event. Must be called with the hub lock held so
    /// that every subscriber sees the same order.
    fn broadcast(&mut self, event: DiscoveryEvent) -> TopologyVersion {
        self.version += 1;
        let stamped = TopologyEvent {
            version: self.version,
            event,
            topology: self.snapshot(),
        };

        for (node_id, tx) in &self.subscribers {
            if tx.send(stamped.clone()).is_err() {
                debug!(node_id, version = self.version, "Subscriber gone, event dropped");
            }
        }
        self.version
    }
}

/// In-process discovery hub shared by all nodes of a test cluster.
#[derive(Debug, Default)]
pub struct LocalDiscovery {
    state: Mutex<HubState>,
}

/// Result of joining a [`LocalDiscovery`] hub.
pub struct DiscoveryJoin {
    pub endpoint: Arc<DiscoveryEndpoint>,
    pub events: mpsc::UnboundedReceiver<TopologyEvent>,
    /// Version of the join event.
    pub version: TopologyVersion,
}

impl LocalDiscovery {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Add a node. Its own join event is the first event it receives.
    pub fn join(self: &Arc<Self>, node_id: NodeId, role: NodeRole) -> Result<DiscoveryJoin> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock();

        if state.nodes.iter().any(|n| n.id == node_id) {
            return Err(Error::Internal(format!("node {} already joined", node_id)));
        }

        state.next_order += 1;
        let order = state.next_order;
        state.nodes.push(ClusterNode {
            id: node_id,
            role,
            order,
        });
        state.subscribers.insert(node_id, tx);
        let version = state.broadcast(DiscoveryEvent::NodeJoined { node_id, role });

        info!(node_id, ?role, version, "Node joined discovery");

        Ok(DiscoveryJoin {
            endpoint: Arc::new(DiscoveryEndpoint {
                hub: self.clone(),
                node_id,
            }),
            events: rx,
            version,
        })
    }

    /// Report a node as failed. Returns false if it was not alive.
    pub fn fail(&self, node_id: NodeId) -> bool {
        self.remove(node_id, true)
    }

    pub fn version(&self) -> TopologyVersion {
        self.state.lock().version
    }

    pub fn topology(&self) -> TopologySnapshot {
        self.state.lock().snapshot()
    }

    fn remove(&self, node_id: NodeId, failed: bool) -> bool {
        let mut state = self.state.lock();
        let before = state.nodes.len();
        state.nodes.retain(|n| n.id != node_id);
        if state.nodes.len() == before {
            return false;
        }
        state.subscribers.remove(&node_id);

        let event = if failed {
            DiscoveryEvent::NodeFailed { node_id }
        } else {
            DiscoveryEvent::NodeLeft { node_id }
        };
        let version = state.broadcast(event);

        if failed {
            warn!(node_id, version, "Node failed");
        } else {
            info!(node_id, version, "Node left discovery");
        }
        true
    }

    fn send_custom(&self, from: NodeId, event: CustomEvent) -> Result<TopologyVersion> {
        let mut state = self.state.lock();
        if !state.nodes.iter().any(|n| n.id == from) {
            return Err(Error::NodeStopped);
        }
        Ok(state.broadcast(DiscoveryEvent::Custom(event)))
    }
}

/// A node's handle on a [`LocalDiscovery`] hub.
#[derive(Debug)]
pub struct DiscoveryEndpoint {
    hub: Arc<LocalDiscovery>,
    node_id: NodeId,
}

impl Discovery for DiscoveryEndpoint {
    fn local_node(&self) -> NodeId {
        self.node_id
    }

    fn topology(&self) -> TopologySnapshot {
        self.hub.topology()
    }

    fn send_custom(&self, event: CustomEvent) -> Result<TopologyVersion> {
        self.hub.send_custom(self.node_id, event)
    }

    fn leave(&self) {
        self.hub.remove(self.node_id, false);
    }
}
