//! Discovery events delivered to every node in the same order.

use super::topology::TopologySnapshot;
use crate::exchange::CacheChangeRequest;
use crate::types::{NodeId, NodeRole, TopologyVersion};
use serde::{Deserialize, Serialize};

/// Membership and custom events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DiscoveryEvent {
    /// A node joined the cluster.
    NodeJoined {
        node_id: NodeId,
        role: NodeRole,
    },

    /// A node left the cluster gracefully.
    NodeLeft { node_id: NodeId },

    /// A node was detected as failed.
    NodeFailed { node_id: NodeId },

    /// A custom event sent through discovery.
    Custom(CustomEvent),
}

/// Custom events ordered together with membership events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CustomEvent {
    /// Start or stop a cache.
    CacheChange(CacheChangeRequest),

    /// Switch late assignments computed at `based_on` to the ideal ones.
    AffinityConfirm { based_on: TopologyVersion },
}

impl DiscoveryEvent {
    /// Node the membership event is about.
    pub fn node_id(&self) -> Option<NodeId> {
        match self {
            DiscoveryEvent::NodeJoined { node_id, .. }
            | DiscoveryEvent::NodeLeft { node_id }
            | DiscoveryEvent::NodeFailed { node_id } => Some(*node_id),
            DiscoveryEvent::Custom(_) => None,
        }
    }

    pub fn is_join(&self) -> bool {
        matches!(self, DiscoveryEvent::NodeJoined { .. })
    }

    /// Check if this is a leave-type event.
    pub fn is_leave(&self) -> bool {
        matches!(
            self,
            DiscoveryEvent::NodeLeft { .. } | DiscoveryEvent::NodeFailed { .. }
        )
    }
}

/// A discovery event stamped with the topology version it created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologyEvent {
    pub version: TopologyVersion,
    pub event: DiscoveryEvent,
    /// Alive nodes after the event.
    pub topology: TopologySnapshot,
}

impl TopologyEvent {
    /// Log the event on behalf of a receiving node.
    pub fn log(&self, local: NodeId) {
        match &self.event {
            DiscoveryEvent::NodeJoined { node_id, role } => {
                tracing::info!(local, node_id, ?role, version = self.version, "Node joined");
            }
            DiscoveryEvent::NodeLeft { node_id } => {
                tracing::info!(local, node_id, version = self.version, "Node left");
            }
            DiscoveryEvent::NodeFailed { node_id } => {
                tracing::warn!(local, node_id, version = self.version, "Node failed");
            }
            DiscoveryEvent::Custom(custom) => {
                tracing::debug!(local, version = self.version, ?custom, "Custom discovery event");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_node_id() {
        let event = DiscoveryEvent::NodeJoined {
            node_id: 42,
            role: NodeRole::Server,
        };
        assert_eq!(event.node_id(), Some(42));

        let custom = DiscoveryEvent::Custom(CustomEvent::AffinityConfirm { based_on: 3 });
        assert_eq!(custom.node_id(), None);
    }

    #[test]
    fn test_event_types() {
        let join = DiscoveryEvent::NodeJoined {
            node_id: 1,
            role: NodeRole::Client,
        };
        assert!(join.is_join());
        assert!(!join.is_leave());

        let failed = DiscoveryEvent::NodeFailed { node_id: 1 };
        assert!(!failed.is_join());
        assert!(failed.is_leave());
        assert!(DiscoveryEvent::NodeLeft { node_id: 1 }.is_leave());
    }
}
