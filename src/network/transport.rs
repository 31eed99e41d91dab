//! Point-to-point message delivery between nodes.
//!
//! [`LocalNetwork`] is an in-process hub. Messages are bincode-encoded on
//! send and decoded by the receiver, so only serializable data crosses node
//! boundaries.

use super::rpc::{encode_message, Message};
use crate::error::{NetworkError, Result};
use crate::types::NodeId;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Outbound side of a node's network.
pub trait Transport: Send + Sync + 'static {
    /// This node's ID.
    fn local_node(&self) -> NodeId;

    /// Send a message. Returns `PeerNotFound` if the destination is gone.
    fn send(&self, to: NodeId, msg: &Message) -> Result<()>;
}

/// An encoded message with its sender.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub from: NodeId,
    pub payload: Bytes,
}

/// In-process network hub.
#[derive(Debug, Default)]
pub struct LocalNetwork {
    inboxes: DashMap<NodeId, mpsc::UnboundedSender<Envelope>>,
    /// Nodes whose traffic is silently dropped in both directions.
    blocked: RwLock<HashSet<NodeId>>,
}

impl LocalNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a node and return its endpoint and inbox.
    pub fn register(
        self: &Arc<Self>,
        node_id: NodeId,
    ) -> (Arc<NetworkEndpoint>, mpsc::UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inboxes.insert(node_id, tx);
        debug!(node_id, "Registered network endpoint");
        (
            Arc::new(NetworkEndpoint {
                hub: self.clone(),
                node_id,
            }),
            rx,
        )
    }

    pub fn unregister(&self, node_id: NodeId) {
        self.inboxes.remove(&node_id);
        self.blocked.write().remove(&node_id);
        debug!(node_id, "Unregistered network endpoint");
    }

    /// Drop all traffic from and to a node.
    pub fn block(&self, node_id: NodeId) {
        self.blocked.write().insert(node_id);
    }

    pub fn unblock(&self, node_id: NodeId) {
        self.blocked.write().remove(&node_id);
    }

    fn deliver(&self, from: NodeId, to: NodeId, msg: &Message) -> Result<()> {
        let Some(inbox) = self.inboxes.get(&to).map(|e| e.value().clone()) else {
            return Err(NetworkError::PeerNotFound(to).into());
        };

        {
            let blocked = self.blocked.read();
            if blocked.contains(&from) || blocked.contains(&to) {
                trace!(from, to, "Dropping message on blocked link");
                return Ok(());
            }
        }

        let payload = encode_message(msg)
            .map_err(|e| NetworkError::Serialization(e.to_string()))?;
        inbox
            .send(Envelope {
                from,
                payload: Bytes::from(payload),
            })
            .map_err(|_| NetworkError::PeerNotFound(to))?;
        Ok(())
    }
}

/// A node's handle on a [`LocalNetwork`].
#[derive(Debug)]
pub struct NetworkEndpoint {
    hub: Arc<LocalNetwork>,
    node_id: NodeId,
}

impl Transport for NetworkEndpoint {
    fn local_node(&self) -> NodeId {
        self.node_id
    }

    fn send(&self, to: NodeId, msg: &Message) -> Result<()> {
        self.hub.deliver(self.node_id, to, msg)
    }
}
