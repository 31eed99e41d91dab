//! Alive node sets as seen by discovery.

use crate::types::{NodeId, NodeRole, TopologyVersion};
use serde::{Deserialize, Serialize};

/// An alive cluster member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterNode {
    pub id: NodeId,
    pub role: NodeRole,
    /// Join order; lower joined earlier.
    pub order: u64,
}

/// Alive nodes at one topology version, oldest first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologySnapshot {
    pub version: TopologyVersion,
    pub nodes: Vec<ClusterNode>,
}

impl TopologySnapshot {
    pub fn new(version: TopologyVersion, mut nodes: Vec<ClusterNode>) -> Self {
        nodes.sort_by_key(|n| n.order);
        Self { version, nodes }
    }

    pub fn contains(&self, node_id: NodeId) -> bool {
        self.nodes.iter().any(|n| n.id == node_id)
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.iter().map(|n| n.id).collect()
    }

    /// Alive server ids, sorted.
    pub fn servers(&self) -> Vec<NodeId> {
        let mut servers: Vec<NodeId> = self
            .nodes
            .iter()
            .filter(|n| n.role.is_server())
            .map(|n| n.id)
            .collect();
        servers.sort_unstable();
        servers
    }

    /// The longest-alive server, which coordinates exchanges.
    pub fn coordinator(&self) -> Option<NodeId> {
        self.nodes
            .iter()
            .find(|n| n.role.is_server())
            .map(|n| n.id)
    }

    pub fn role_of(&self, node_id: NodeId) -> Option<NodeRole> {
        self.nodes.iter().find(|n| n.id == node_id).map(|n| n.role)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: NodeId, role: NodeRole, order: u64) -> ClusterNode {
        ClusterNode { id, role, order }
    }

    #[test]
    fn test_coordinator_is_oldest_server() {
        let topology = TopologySnapshot::new(
            7,
            vec![
                node(3, NodeRole::Server, 5),
                node(9, NodeRole::Client, 1),
                node(2, NodeRole::Server, 4),
            ],
        );
        assert_eq!(topology.coordinator(), Some(2));
        assert_eq!(topology.servers(), vec![2, 3]);
        assert_eq!(topology.node_ids(), vec![9, 2, 3]);
    }

    #[test]
    fn test_no_servers_no_coordinator() {
        let topology = TopologySnapshot::new(2, vec![node(4, NodeRole::Client, 1)]);
        assert_eq!(topology.coordinator(), None);
        assert!(topology.contains(4));
        assert_eq!(topology.role_of(4), Some(NodeRole::Client));
    }
}
