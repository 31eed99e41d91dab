//! Consistent-hash ring affinity with virtual nodes.
//!
//! Each server node is placed on the ring at `vnodes` positions. A partition
//! hashes to a ring position and its owners are the distinct nodes found
//! walking clockwise from there.

use super::AffinityFunction;
use crate::types::{NodeId, PartitionId};
use std::collections::BTreeMap;
use std::hash::Hasher;
use twox_hash::XxHash64;

/// Default number of virtual nodes per server.
pub const DEFAULT_VNODES_PER_NODE: u32 = 256;

/// A consistent hash ring over a fixed node set.
#[derive(Debug, Clone)]
pub struct HashRing {
    /// Ring position to owning node.
    vnodes: BTreeMap<u64, NodeId>,
    /// Distinct nodes on the ring, sorted.
    nodes: Vec<NodeId>,
}

impl HashRing {
    /// Build a ring for the given nodes.
    pub fn build(nodes: &[NodeId], vnodes_per_node: u32) -> Self {
        let mut sorted = nodes.to_vec();
        sorted.sort_unstable();
        sorted.dedup();

        let mut vnodes = BTreeMap::new();
        for &node_id in &sorted {
            for i in 0..vnodes_per_node.max(1) {
                let vnode_key = format!("{}:{}", node_id, i);
                // Position collisions go to the lower node id.
                vnodes
                    .entry(Self::hash_bytes(vnode_key.as_bytes()))
                    .or_insert(node_id);
            }
        }

        Self {
            vnodes,
            nodes: sorted,
        }
    }

    /// Number of distinct nodes on the ring.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Distinct owners of a ring position, primary first.
    pub fn owners_at(&self, hash: u64, count: usize) -> Vec<NodeId> {
        let want = count.min(self.nodes.len());
        let mut owners = Vec::with_capacity(want);
        if want == 0 {
            return owners;
        }

        for (_, &node_id) in self.vnodes.range(hash..).chain(self.vnodes.range(..hash)) {
            if !owners.contains(&node_id) {
                owners.push(node_id);
                if owners.len() == want {
                    break;
                }
            }
        }
        owners
    }

    /// Ring position of a partition.
    pub fn partition_position(partition: PartitionId) -> u64 {
        Self::hash_bytes(&partition.to_be_bytes())
    }

    fn hash_bytes(bytes: &[u8]) -> u64 {
        let mut hasher = XxHash64::with_seed(0);
        hasher.write(bytes);
        hasher.finish()
    }
}

/// Affinity function backed by a [`HashRing`].
#[derive(Debug, Clone)]
pub struct RingAffinity {
    ring: HashRing,
}

impl RingAffinity {
    pub fn new(nodes: &[NodeId], vnodes_per_node: u32) -> Self {
        Self {
            ring: HashRing::build(nodes, vnodes_per_node),
        }
    }
}

impl AffinityFunction for RingAffinity {
    fn owners(&self, partition: PartitionId, copies: usize) -> Vec<NodeId> {
        self.ring
            .owners_at(HashRing::partition_position(partition), copies)
    }
}
