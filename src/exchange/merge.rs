//! Coordinator-side merge of partition reports into the full map.

use crate::affinity::{assign, assign_late};
use crate::network::{FullMessage, SingleMessage};
use crate::registry::{GroupState, RegistryState};
use crate::storage::PartitionState;
use crate::types::{NodeId, PartitionId, TopologyVersion};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Inputs of one merge.
#[derive(Debug, Clone, Copy)]
pub struct MergeInput<'a> {
    pub version: TopologyVersion,
    pub coordinator: NodeId,
    /// Staged registry with this version's alive servers.
    pub table: &'a RegistryState,
    /// Reports of every participant, by sender.
    pub reports: &'a BTreeMap<NodeId, SingleMessage>,
    pub late_assignment: bool,
    /// The batch confirms late assignments.
    pub confirm: bool,
}

/// Compute assignments, confirmed stops and fully owned partitions.
pub fn merge(input: MergeInput<'_>) -> FullMessage {
    let MergeInput {
        version,
        coordinator,
        table,
        reports,
        late_assignment,
        confirm,
    } = input;
    let servers = &table.servers;

    let mut assignments = BTreeMap::new();
    let mut late = false;
    for (name, group) in &table.groups {
        if group.state == GroupState::Stopping {
            continue;
        }
        let ideal = assign(&group.affinity_params(), version, servers);
        let effective = match group.assignment() {
            Some(previous) if late_assignment && !confirm => {
                let kept = assign_late(previous, &ideal, servers);
                if !kept.same_owners(&ideal) {
                    late = true;
                }
                kept
            }
            _ => ideal,
        };
        assignments.insert(name.clone(), effective);
    }

    let stopped = table
        .stopping_groups()
        .into_iter()
        .filter(|g| reports.values().all(|r| !r.partitions.contains_key(g)))
        .collect();

    // Owning partitions by (node, group).
    let owning: HashMap<(NodeId, &str), HashSet<PartitionId>> = reports
        .iter()
        .flat_map(|(&node, report)| {
            report.partitions.iter().map(move |(group, parts)| {
                let held = parts
                    .iter()
                    .filter(|r| r.state == PartitionState::Owning)
                    .map(|r| r.partition)
                    .collect();
                ((node, group.as_str()), held)
            })
        })
        .collect();

    let fully_owned = assignments
        .iter()
        .filter_map(|(name, assignment)| {
            let done: Vec<PartitionId> = assignment
                .iter()
                .filter(|(p, owners)| {
                    !owners.is_empty()
                        && owners.iter().all(|&o| {
                            owning
                                .get(&(o, name.as_str()))
                                .map(|held| held.contains(p))
                                .unwrap_or(false)
                        })
                })
                .map(|(p, _)| p)
                .collect();
            (!done.is_empty()).then(|| (name.clone(), done))
        })
        .collect();

    let registry = reports.values().any(|r| r.fresh).then(|| table.clone());

    FullMessage {
        version,
        coordinator,
        assignments,
        stopped,
        fully_owned,
        registry,
        late,
    }
}

/// Registry a fresh coordinator adopts: the one reported by the established
/// node with the lowest id.
pub fn adopt_registry(reports: &BTreeMap<NodeId, SingleMessage>) -> Option<RegistryState> {
    reports
        .values()
        .find(|r| !r.fresh && r.registry.is_some())
        .and_then(|r| r.registry.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::affinity::PartitionAssignment;
    use crate::config::CacheConfiguration;
    use crate::network::PartitionReport;
    use crate::registry::ConsistencyValidator;

    fn report(sender: NodeId, group: &str, owning: &[PartitionId]) -> SingleMessage {
        let mut partitions = BTreeMap::new();
        if !owning.is_empty() {
            partitions.insert(
                group.to_string(),
                owning
                    .iter()
                    .map(|&p| PartitionReport {
                        partition: p,
                        state: PartitionState::Owning,
                        size: 0,
                    })
                    .collect(),
            );
        }
        SingleMessage {
            version: 5,
            sender,
            fresh: false,
            partitions,
            registry: None,
        }
    }

    fn table(servers: &[NodeId]) -> RegistryState {
        let mut table = RegistryState {
            version: 5,
            servers: servers.to_vec(),
            ..Default::default()
        };
        table
            .register_cache(
                CacheConfiguration::new("c1")
                    .with_group("g1")
                    .with_partitions(4)
                    .with_backups(1),
                2,
                &ConsistencyValidator::default(),
            )
            .unwrap();
        table
    }

    #[test]
    fn test_new_group_gets_ideal_assignment() {
        let table = table(&[1, 2]);
        let mut reports = BTreeMap::new();
        reports.insert(1, report(1, "g1", &[]));
        reports.insert(2, report(2, "g1", &[]));

        let full = merge(MergeInput {
            version: 5,
            coordinator: 1,
            table: &table,
            reports: &reports,
            late_assignment: true,
            confirm: false,
        });
        let expected = assign(&table.groups["g1"].affinity_params(), 5, &[1, 2]);
        assert_eq!(full.assignments["g1"], expected);
        assert!(!full.late);
        assert!(full.fully_owned.is_empty());
        assert!(full.registry.is_none());
    }

    #[test]
    fn test_late_assignment_keeps_previous_owners() {
        let mut table = table(&[1, 2, 3]);
        table.install_assignment("g1", PartitionAssignment::new(4, vec![vec![1, 2]; 4]));
        let mut reports = BTreeMap::new();
        reports.insert(1, report(1, "g1", &[0, 1, 2, 3]));
        reports.insert(2, report(2, "g1", &[0, 1, 2, 3]));
        reports.insert(3, report(3, "g1", &[]));

        let input = MergeInput {
            version: 5,
            coordinator: 1,
            table: &table,
            reports: &reports,
            late_assignment: true,
            confirm: false,
        };
        let full = merge(input);
        for (_, owners) in full.assignments["g1"].iter() {
            assert_eq!(&owners[..2], &[1, 2]);
        }

        let ideal = assign(&table.groups["g1"].affinity_params(), 5, &[1, 2, 3]);
        assert_eq!(full.late, !ideal.same_owners(&full.assignments["g1"]));

        // Partitions whose late owners are exactly nodes 1 and 2 are fully
        // owned already.
        for p in full.fully_owned.get("g1").into_iter().flatten() {
            assert_eq!(full.assignments["g1"].owners(*p), &[1, 2]);
        }

        let confirmed = merge(MergeInput {
            confirm: true,
            ..input
        });
        assert_eq!(confirmed.assignments["g1"], ideal);
        assert!(!confirmed.late);
    }

    #[test]
    fn test_stopping_group_confirmed_when_no_partitions_remain() {
        let mut table = table(&[1, 2]);
        table.unregister_cache("c1");

        let run = |reports: &BTreeMap<NodeId, SingleMessage>| {
            merge(MergeInput {
                version: 5,
                coordinator: 1,
                table: &table,
                reports,
                late_assignment: false,
                confirm: false,
            })
        };

        let mut reports = BTreeMap::new();
        reports.insert(1, report(1, "g1", &[0]));
        reports.insert(2, report(2, "g1", &[]));
        let full = run(&reports);
        assert!(full.stopped.is_empty());
        assert!(!full.assignments.contains_key("g1"));

        reports.insert(1, report(1, "g1", &[]));
        let full = run(&reports);
        assert_eq!(full.stopped, vec!["g1".to_string()]);
    }

    #[test]
    fn test_registry_adopted_from_lowest_established_node() {
        let table = table(&[1, 2, 3]);
        let mut reports = BTreeMap::new();
        let mut fresh = report(1, "g1", &[]);
        fresh.fresh = true;
        reports.insert(1, fresh);

        let mut established = report(2, "g1", &[]);
        established.registry = Some(table.clone());
        reports.insert(2, established);

        let mut other = report(3, "g1", &[]);
        other.registry = Some(RegistryState::default());
        reports.insert(3, other);

        assert_eq!(adopt_registry(&reports), Some(table.clone()));

        let full = merge(MergeInput {
            version: 5,
            coordinator: 1,
            table: &table,
            reports: &reports,
            late_assignment: false,
            confirm: false,
        });
        assert_eq!(full.registry, Some(table));
    }
}
