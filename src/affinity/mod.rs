//! Affinity assignment: which server nodes own which partitions.
//!
//! The assignment of a version is a pure function of the alive server set and
//! the group's affinity parameters, so every node that computes it gets the
//! same map.
//!
//! # Example
//!
//! ```rust
//! use cachegroup::affinity::{assign, AffinityKind, AffinityParams};
//! use cachegroup::types::CacheMode;
//!
//! let params = AffinityParams {
//!     kind: AffinityKind::Rendezvous,
//!     partitions: 16,
//!     backups: 1,
//!     mode: CacheMode::Partitioned,
//! };
//! let map = assign(&params, 5, &[3, 1, 2]);
//! assert_eq!(map.partition_count(), 16);
//! assert_eq!(map.owners(0).len(), 2);
//! ```

mod assignment;
mod hashring;
mod rendezvous;

pub use assignment::{MovementKind, PartitionAssignment, PartitionMovement};
pub use hashring::{HashRing, RingAffinity, DEFAULT_VNODES_PER_NODE};
pub use rendezvous::RendezvousAffinity;

use crate::types::{CacheMode, NodeId, PartitionId, TopologyVersion};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Selects the affinity function of a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum AffinityKind {
    /// Highest-random-weight hashing.
    #[default]
    Rendezvous,
    /// Consistent-hash ring with virtual nodes.
    Ring { vnodes: u32 },
}

impl fmt::Display for AffinityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AffinityKind::Rendezvous => write!(f, "Rendezvous"),
            AffinityKind::Ring { vnodes } => write!(f, "Ring(vnodes={})", vnodes),
        }
    }
}

/// Maps a partition to its owners.
pub trait AffinityFunction {
    /// Up to `copies` distinct owners of a partition, primary first.
    fn owners(&self, partition: PartitionId, copies: usize) -> Vec<NodeId>;
}

/// Group-level inputs of the assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AffinityParams {
    pub kind: AffinityKind,
    pub partitions: u32,
    pub backups: u32,
    pub mode: CacheMode,
}

impl AffinityParams {
    /// Number of owners per partition for the given server count.
    pub fn copies(&self, servers: usize) -> usize {
        match self.mode {
            CacheMode::Replicated => servers,
            CacheMode::Partitioned => (self.backups as usize + 1).min(servers),
        }
    }
}

/// Compute the ideal assignment for a set of alive servers.
pub fn assign(
    params: &AffinityParams,
    version: TopologyVersion,
    servers: &[NodeId],
) -> PartitionAssignment {
    let copies = params.copies(servers.len());
    let function: Box<dyn AffinityFunction> = match params.kind {
        AffinityKind::Rendezvous => Box::new(RendezvousAffinity::new(servers)),
        AffinityKind::Ring { vnodes } => Box::new(RingAffinity::new(servers, vnodes)),
    };

    let partitions = (0..params.partitions)
        .map(|p| function.owners(p, copies))
        .collect();
    PartitionAssignment::new(version, partitions)
}

/// Compute the late assignment that keeps previous owners in front.
///
/// For every partition the previous owners that are still alive keep their
/// order, followed by the ideal owners not already present. A partition with
/// no surviving previous owner gets its ideal owners.
pub fn assign_late(
    previous: &PartitionAssignment,
    ideal: &PartitionAssignment,
    servers: &[NodeId],
) -> PartitionAssignment {
    let partitions = ideal
        .iter()
        .map(|(p, ideal_owners)| {
            let mut owners: Vec<NodeId> = previous
                .owners(p)
                .iter()
                .copied()
                .filter(|n| servers.contains(n))
                .collect();
            if owners.is_empty() {
                return ideal_owners.to_vec();
            }
            for &n in ideal_owners {
                if !owners.contains(&n) {
                    owners.push(n);
                }
            }
            owners
        })
        .collect();
    PartitionAssignment::new(ideal.version(), partitions)
}
