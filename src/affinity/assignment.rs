//! Versioned partition-to-owners maps.

use crate::types::{NodeId, PartitionId, TopologyVersion};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Ownership of every partition of a group at one topology version.
///
/// `partitions[p]` lists the owners of partition `p`, primary first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionAssignment {
    version: TopologyVersion,
    partitions: Vec<Vec<NodeId>>,
}

impl PartitionAssignment {
    pub fn new(version: TopologyVersion, partitions: Vec<Vec<NodeId>>) -> Self {
        Self {
            version,
            partitions,
        }
    }

    /// Topology version this assignment was computed for.
    pub fn version(&self) -> TopologyVersion {
        self.version
    }

    /// Number of partitions.
    pub fn partition_count(&self) -> u32 {
        self.partitions.len() as u32
    }

    /// Owners of a partition, primary first.
    pub fn owners(&self, partition: PartitionId) -> &[NodeId] {
        self.partitions
            .get(partition as usize)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn primary(&self, partition: PartitionId) -> Option<NodeId> {
        self.owners(partition).first().copied()
    }

    pub fn backups(&self, partition: PartitionId) -> &[NodeId] {
        self.owners(partition).get(1..).unwrap_or(&[])
    }

    pub fn is_owner(&self, node_id: NodeId, partition: PartitionId) -> bool {
        self.owners(partition).contains(&node_id)
    }

    pub fn is_primary(&self, node_id: NodeId, partition: PartitionId) -> bool {
        self.primary(partition) == Some(node_id)
    }

    /// Partitions a node holds as primary or backup.
    pub fn partitions_of(&self, node_id: NodeId) -> Vec<PartitionId> {
        self.iter()
            .filter(|(_, owners)| owners.contains(&node_id))
            .map(|(p, _)| p)
            .collect()
    }

    /// Partitions a node holds as primary.
    pub fn primary_partitions_of(&self, node_id: NodeId) -> Vec<PartitionId> {
        self.iter()
            .filter(|(_, owners)| owners.first() == Some(&node_id))
            .map(|(p, _)| p)
            .collect()
    }

    /// Every node named by the assignment.
    pub fn nodes(&self) -> BTreeSet<NodeId> {
        self.partitions.iter().flatten().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (PartitionId, &[NodeId])> {
        self.partitions
            .iter()
            .enumerate()
            .map(|(p, owners)| (p as PartitionId, owners.as_slice()))
    }

    /// Same owners for every partition, ignoring the version.
    pub fn same_owners(&self, other: &PartitionAssignment) -> bool {
        self.partitions == other.partitions
    }

    /// Replica movements needed to go from this assignment to `next`.
    pub fn movements(&self, next: &PartitionAssignment) -> Vec<PartitionMovement> {
        let mut movements = Vec::new();
        for (p, new_owners) in next.iter() {
            let old_owners = self.owners(p);
            let from = old_owners.first().copied();

            for &to in new_owners {
                if !old_owners.contains(&to) {
                    movements.push(PartitionMovement {
                        partition: p,
                        from,
                        to,
                        kind: MovementKind::AddReplica,
                    });
                }
            }
            for &gone in old_owners {
                if !new_owners.contains(&gone) {
                    movements.push(PartitionMovement {
                        partition: p,
                        from: Some(gone),
                        to: gone,
                        kind: MovementKind::RemoveReplica,
                    });
                }
            }
            if let (Some(old), Some(&new)) = (from, new_owners.first()) {
                if old != new && old_owners.contains(&new) {
                    movements.push(PartitionMovement {
                        partition: p,
                        from: Some(old),
                        to: new,
                        kind: MovementKind::TransferPrimary,
                    });
                }
            }
        }
        movements
    }
}

/// Kind of replica movement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MovementKind {
    /// A node starts holding the partition.
    AddReplica,
    /// A node stops holding the partition.
    RemoveReplica,
    /// An existing owner becomes primary.
    TransferPrimary,
}

impl std::fmt::Display for MovementKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MovementKind::AddReplica => write!(f, "add_replica"),
            MovementKind::RemoveReplica => write!(f, "remove_replica"),
            MovementKind::TransferPrimary => write!(f, "transfer_primary"),
        }
    }
}

/// One replica movement between consecutive assignments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionMovement {
    pub partition: PartitionId,
    /// Previous primary, or the removed node for removals.
    pub from: Option<NodeId>,
    pub to: NodeId,
    pub kind: MovementKind,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assignment(version: TopologyVersion, parts: &[&[NodeId]]) -> PartitionAssignment {
        PartitionAssignment::new(version, parts.iter().map(|o| o.to_vec()).collect())
    }

    #[test]
    fn test_accessors() {
        let a = assignment(3, &[&[1, 2], &[2, 3], &[3, 1]]);
        assert_eq!(a.version(), 3);
        assert_eq!(a.partition_count(), 3);
        assert_eq!(a.primary(1), Some(2));
        assert_eq!(a.backups(1), &[3]);
        assert_eq!(a.partitions_of(1), vec![0, 2]);
        assert_eq!(a.primary_partitions_of(3), vec![2]);
        assert!(a.owners(99).is_empty());
        assert_eq!(a.nodes().into_iter().collect::<Vec<_>>(), vec![1, 2, 3]);
    }

    #[test]
    fn test_movements() {
        let before = assignment(1, &[&[1, 2], &[2, 1]]);
        let after = assignment(2, &[&[1, 3], &[1, 2]]);

        let moves = before.movements(&after);
        assert!(moves.contains(&PartitionMovement {
            partition: 0,
            from: Some(1),
            to: 3,
            kind: MovementKind::AddReplica,
        }));
        assert!(moves.contains(&PartitionMovement {
            partition: 0,
            from: Some(2),
            to: 2,
            kind: MovementKind::RemoveReplica,
        }));
        assert!(moves.contains(&PartitionMovement {
            partition: 1,
            from: Some(2),
            to: 1,
            kind: MovementKind::TransferPrimary,
        }));
        assert_eq!(moves.len(), 3);
        assert!(before.movements(&before).is_empty());
    }
}
