//! Multi-node tests of the partition map exchange: ordering, supersession,
//! failure and late affinity.

#[cfg(test)]
mod tests {
    use crate::affinity::assign;
    use crate::config::{AffinityConfig, CacheConfiguration, NodeConfig};
    use crate::error::Error;
    use crate::exchange::{ExchangeState, ExchangeTrigger};
    use crate::testing::utils::wait_for;
    use crate::testing::{TestCluster, SETTLE_TIMEOUT};
    use crate::types::PeekMode;
    use bytes::Bytes;
    use std::time::Duration;
    use test_log::test;

    fn key(i: u64) -> Bytes {
        Bytes::from(i.to_be_bytes().to_vec())
    }

    #[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
    async fn test_history_is_ordered_and_assignments_match() {
        let mut cluster = TestCluster::new();
        for id in 1..=3 {
            cluster.start_server(id).await.unwrap();
        }
        cluster[2]
            .create_cache(CacheConfiguration::new("c1").with_group("g1").with_backups(1))
            .await
            .unwrap();
        cluster.start_server(4).await.unwrap();
        cluster.await_partition_map_exchange().await.unwrap();

        for node in cluster.nodes() {
            let history = node.exchange_history();
            assert!(!history.is_empty());
            assert!(history.windows(2).all(|w| w[0].version < w[1].version));
            assert!(history
                .iter()
                .all(|r| r.outcome == ExchangeState::Applied));
        }

        let reference = cluster[1].cache_group("g1").unwrap();
        let reference = reference.assignment().unwrap();
        for node in cluster.nodes() {
            let group = node.cache_group("g1").unwrap();
            let assignment = group.assignment().unwrap();
            assert_eq!(assignment.version(), reference.version());
            assert!(assignment.same_owners(reference), "node {}", node.node_id());
        }
    }

    #[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
    async fn test_coordinator_failure_supersedes_exchange() {
        let mut cluster = TestCluster::new();
        for id in 1..=3 {
            cluster.start_server(id).await.unwrap();
        }

        // Reports to the coordinator are dropped until discovery fails it.
        cluster.block(1);
        let request_version = cluster.discovery.version() + 1;
        let discovery = cluster.discovery.clone();
        let fail_coordinator = async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            assert!(discovery.fail(1));
        };

        let (created, ()) = tokio::join!(
            cluster[2].create_cache(
                CacheConfiguration::new("c1")
                    .with_group("g1")
                    .with_backups(1)
            ),
            fail_coordinator
        );
        let cache = created.unwrap();

        match cluster[2].await_exchange(request_version).await {
            Err(Error::RetryableTopology {
                version,
                superseded_by,
            }) => {
                assert_eq!(version, request_version);
                assert_eq!(superseded_by, request_version + 1);
            }
            other => panic!("expected a superseded exchange, got {:?}", other),
        }
        cluster[2]
            .await_exchange(request_version + 1)
            .await
            .unwrap();

        cluster.fail_node(1);
        cluster.await_partition_map_exchange().await.unwrap();

        for node in cluster.nodes() {
            assert!(node.cache_group("g1").is_some());
            assert!(node
                .exchange_history()
                .iter()
                .any(|r| matches!(r.outcome, ExchangeState::Superseded { .. })));
            assert!(node.metrics().snapshot().exchanges_superseded >= 1);
        }

        cache.put("k", "v").await.unwrap();
        assert_eq!(
            cluster[3].get_cache("c1").unwrap().get("k").await.unwrap(),
            Some(Bytes::from("v"))
        );
    }

    #[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
    async fn test_client_without_servers_cannot_start() {
        let mut cluster = TestCluster::new();
        let result = cluster.start_client(1).await;
        assert!(matches!(result, Err(Error::ClusterTopology(_))));
    }

    #[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
    async fn test_create_fails_when_no_server_is_left() {
        let mut cluster = TestCluster::new();
        cluster.start_server(1).await.unwrap();
        cluster.start_client(2).await.unwrap();

        let failed_version = cluster.discovery.version() + 1;
        cluster.fail_node(1);
        assert!(matches!(
            cluster[2].await_exchange(failed_version).await,
            Err(Error::ClusterTopology(_))
        ));

        let result = cluster[2]
            .create_cache(CacheConfiguration::new("c1").with_group("g1"))
            .await;
        assert!(matches!(result, Err(Error::ClusterTopology(_))));
        assert!(cluster[2].cache_group("g1").is_none());
        assert!(cluster[2].metrics().snapshot().exchanges_failed >= 2);
    }

    #[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
    async fn test_late_assignment_is_confirmed() {
        let template = NodeConfig::default().with_affinity_config(
            AffinityConfig::default()
                .with_late_assignment(true)
                .with_confirm_delay(Duration::from_secs(1)),
        );
        let mut cluster = TestCluster::with_config(template);
        cluster.start_server(1).await.unwrap();
        cluster.start_server(2).await.unwrap();

        let cache = cluster[1]
            .create_cache(
                CacheConfiguration::new("c1")
                    .with_group("g1")
                    .with_partitions(32),
            )
            .await
            .unwrap();
        for i in 0..50u64 {
            cache.put(key(i), Bytes::from(format!("v{}", i))).await.unwrap();
        }

        cluster.start_server(3).await.unwrap();

        // Previous owners stay primary until the confirmation.
        let group = cluster[3].cache_group("g1").unwrap();
        let late = group.assignment().unwrap();
        assert!(late.primary_partitions_of(3).is_empty());
        assert!(!late.partitions_of(3).is_empty());

        let confirmed = wait_for(
            || {
                cluster.nodes().all(|n| {
                    n.exchange_history()
                        .iter()
                        .any(|r| r.trigger == ExchangeTrigger::AffinityConfirm)
                })
            },
            SETTLE_TIMEOUT,
            Duration::from_millis(50),
        )
        .await;
        assert!(confirmed);
        cluster.await_partition_map_exchange().await.unwrap();

        let group = cluster[1].cache_group("g1").unwrap();
        let assignment = group.assignment().unwrap();
        let ideal = assign(&group.affinity_params(), assignment.version(), &[1, 2, 3]);
        assert!(assignment.same_owners(&ideal));
        assert!(!assignment.primary_partitions_of(3).is_empty());

        for i in 0..50u64 {
            assert_eq!(
                cache.get(key(i)).await.unwrap(),
                Some(Bytes::from(format!("v{}", i)))
            );
        }
        let total: u64 = cluster
            .nodes()
            .map(|n| {
                n.get_cache("c1")
                    .unwrap()
                    .local_size(PeekMode::Primary)
                    .unwrap()
            })
            .sum();
        assert_eq!(total, 50);
    }

    #[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
    async fn test_exchange_metrics() {
        let mut cluster = TestCluster::new();
        cluster.start_server(1).await.unwrap();
        cluster.start_server(2).await.unwrap();
        cluster[1]
            .create_cache(CacheConfiguration::new("c1").with_group("g1"))
            .await
            .unwrap();
        cluster.await_partition_map_exchange().await.unwrap();

        let version = cluster.discovery.version();
        for node in cluster.nodes() {
            let metrics = node.metrics().snapshot();
            assert_eq!(metrics.topology_version, version as i64);
            assert!(metrics.exchanges_applied >= 2);
            assert_eq!(metrics.exchanges_failed, 0);
        }
        assert_eq!(cluster[1].metrics().snapshot().cache_requests, 1);

        let text = cluster[1].metrics().to_prometheus();
        assert!(text.contains("exchanges_applied"));
    }
}
