//! Rendezvous (highest random weight) affinity.
//!
//! Every (partition, node) pair gets a pseudo-random weight; the owners of a
//! partition are the nodes with the highest weights. Adding or removing a
//! node only changes partitions where that node ranks among the top copies.

use super::AffinityFunction;
use crate::types::{NodeId, PartitionId};
use std::hash::Hasher;
use twox_hash::XxHash64;

#[derive(Debug, Clone)]
pub struct RendezvousAffinity {
    nodes: Vec<NodeId>,
}

impl RendezvousAffinity {
    pub fn new(nodes: &[NodeId]) -> Self {
        let mut nodes = nodes.to_vec();
        nodes.sort_unstable();
        nodes.dedup();
        Self { nodes }
    }

    /// Weight of a node for a partition.
    pub fn weight(partition: PartitionId, node_id: NodeId) -> u64 {
        let mut hasher = XxHash64::with_seed(0);
        hasher.write(&partition.to_be_bytes());
        hasher.write(&node_id.to_be_bytes());
        hasher.finish()
    }
}

impl AffinityFunction for RendezvousAffinity {
    fn owners(&self, partition: PartitionId, copies: usize) -> Vec<NodeId> {
        let mut ranked: Vec<(u64, NodeId)> = self
            .nodes
            .iter()
            .map(|&node_id| (Self::weight(partition, node_id), node_id))
            .collect();
        // Highest weight first, ties broken by the smaller node id.
        ranked.sort_unstable_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        ranked
            .into_iter()
            .take(copies)
            .map(|(_, node_id)| node_id)
            .collect()
    }
}
