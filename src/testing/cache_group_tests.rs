//! Multi-node tests of cache group creation, validation and destruction.

#[cfg(test)]
mod tests {
    use crate::config::CacheConfiguration;
    use crate::error::{ConflictField, Error};
    use crate::testing::utils::wait_for;
    use crate::testing::{TestCluster, SETTLE_TIMEOUT};
    use crate::types::{AtomicityMode, CacheMode, PeekMode};
    use bytes::Bytes;
    use rand::Rng;
    use std::time::Duration;
    use test_log::test;

    fn key(i: u64) -> Bytes {
        Bytes::from(i.to_be_bytes().to_vec())
    }

    async fn servers(ids: &[u64]) -> TestCluster {
        let mut cluster = TestCluster::new();
        for &id in ids {
            cluster.start_server(id).await.unwrap();
        }
        cluster
    }

    #[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
    async fn test_put_get_then_join_keeps_all_entries() {
        let mut cluster = servers(&[1, 2]).await;

        let cache = cluster[1]
            .create_cache(
                CacheConfiguration::new("c1")
                    .with_group("g1")
                    .with_backups(2)
                    .with_partitions(64),
            )
            .await
            .unwrap();

        let mut rng = rand::thread_rng();
        let mut written = Vec::new();
        for i in 0..10u64 {
            let k = key(rng.gen::<u64>());
            let v = Bytes::from(format!("value-{}", i));
            cache.put(k.clone(), v.clone()).await.unwrap();
            assert_eq!(cache.get(k.clone()).await.unwrap(), Some(v.clone()));
            written.push((k, v));
        }

        cluster.start_server(3).await.unwrap();
        cluster.await_partition_map_exchange().await.unwrap();

        let total: u64 = cluster
            .nodes()
            .map(|n| {
                n.get_cache("c1")
                    .unwrap()
                    .local_size(PeekMode::Primary)
                    .unwrap()
            })
            .sum();
        assert_eq!(total, written.len() as u64);

        // Two backups on three servers: every node holds every partition.
        let joined = cluster[3].get_cache("c1").unwrap();
        assert_eq!(
            joined.local_size(PeekMode::All).unwrap(),
            written.len() as u64
        );
        assert_eq!(joined.size().await.unwrap(), written.len() as u64);
        for (k, v) in &written {
            assert_eq!(joined.get(k.clone()).await.unwrap().as_ref(), Some(v));
        }
    }

    #[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
    async fn test_backups_conflict_names_group() {
        let cluster = servers(&[1, 2]).await;

        cluster[1]
            .create_cache(CacheConfiguration::new("c1").with_group("grp1").with_backups(1))
            .await
            .unwrap();
        cluster.await_partition_map_exchange().await.unwrap();

        for node in [1, 2] {
            let err = cluster[node]
                .create_cache(CacheConfiguration::new("c2").with_group("grp1").with_backups(2))
                .await
                .unwrap_err();
            match err {
                Error::ConfigurationConflict(conflict) => {
                    assert_eq!(conflict.group, "grp1");
                    assert_eq!(conflict.field, ConflictField::Backups);
                    assert_eq!(conflict.existing_cache, "c1");
                }
                other => panic!("expected configuration conflict, got {:?}", other),
            }
        }

        // Nothing was registered by the rejected requests.
        for node in cluster.nodes() {
            assert_eq!(node.cache_names(), vec!["c1".to_string()]);
            assert_eq!(
                node.cache_group("grp1").unwrap().members.len(),
                1
            );
        }
    }

    #[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
    async fn test_cache_mode_conflict() {
        let cluster = servers(&[1, 2]).await;

        cluster[2]
            .create_cache(
                CacheConfiguration::new("c1")
                    .with_group("g1")
                    .with_cache_mode(CacheMode::Replicated),
            )
            .await
            .unwrap();
        cluster.await_partition_map_exchange().await.unwrap();

        let err = cluster[1]
            .create_cache(
                CacheConfiguration::new("c2")
                    .with_group("g1")
                    .with_cache_mode(CacheMode::Partitioned),
            )
            .await
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("Cache mode mismatch for caches related to the same group [groupName=g1"));
        assert!(msg.contains("existingCacheMode=REPLICATED"));
        assert!(msg.contains("startCacheMode=PARTITIONED"));
        assert_eq!(cluster[1].metrics().snapshot().cache_conflicts, 1);
    }

    #[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
    async fn test_conflicting_requests_in_flight() {
        let cluster = servers(&[1, 2]).await;

        // Both pass the local check; the exchange orders them and rejects
        // the later one on every node.
        let first = CacheConfiguration::new("c1")
            .with_group("g1")
            .with_atomicity_mode(AtomicityMode::Atomic);
        let second = CacheConfiguration::new("c2")
            .with_group("g1")
            .with_atomicity_mode(AtomicityMode::Transactional);

        let (a, b) = tokio::join!(
            cluster[1].create_cache(first),
            cluster[2].create_cache(second)
        );
        assert!(a.is_ok() != b.is_ok(), "exactly one create must win");
        let err = a.err().or(b.err()).unwrap();
        assert!(matches!(err, Error::ConfigurationConflict(_)));

        cluster.await_partition_map_exchange().await.unwrap();
        let names: Vec<_> = cluster.nodes().map(|n| n.cache_names()).collect();
        assert_eq!(names[0].len(), 1);
        assert_eq!(names[0], names[1]);
    }

    #[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
    async fn test_data_ops_right_after_create() {
        let cluster = servers(&[1, 2, 3]).await;

        // Remote primaries may not have applied the create yet.
        let cache = cluster[1]
            .create_cache(
                CacheConfiguration::new("c1")
                    .with_group("g1")
                    .with_backups(1)
                    .with_partitions(64),
            )
            .await
            .unwrap();
        for i in 0..30u64 {
            cache.put(key(i), Bytes::from(format!("v{}", i))).await.unwrap();
        }
        for i in 0..30u64 {
            assert_eq!(
                cache.get(key(i)).await.unwrap(),
                Some(Bytes::from(format!("v{}", i)))
            );
        }
        assert_eq!(cache.size().await.unwrap(), 30);

        let written = cluster[1].metrics().snapshot();
        assert_eq!(written.backup_failures, 0);
    }

    #[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
    async fn test_duplicate_cache_name() {
        let cluster = servers(&[1]).await;
        cluster[1]
            .create_cache(CacheConfiguration::new("c1"))
            .await
            .unwrap();

        let err = cluster[1]
            .create_cache(CacheConfiguration::new("c1"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateCacheName(ref n) if n == "c1"));
    }

    #[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
    async fn test_destroy_one_of_two_caches() {
        let cluster = servers(&[1, 2]).await;

        let c1 = cluster[1]
            .create_cache(CacheConfiguration::new("c1").with_group("g1").with_backups(1))
            .await
            .unwrap();
        let c2 = cluster[1]
            .create_cache(CacheConfiguration::new("c2").with_group("g1").with_backups(1))
            .await
            .unwrap();

        for i in 0..20 {
            c1.put(key(i), Bytes::from_static(b"one")).await.unwrap();
            c2.put(key(i), Bytes::from_static(b"two")).await.unwrap();
        }

        cluster.await_partition_map_exchange().await.unwrap();
        cluster[2].destroy_cache("c1").await.unwrap();
        cluster.await_partition_map_exchange().await.unwrap();

        for node in cluster.nodes() {
            let group = node.cache_group("g1").unwrap();
            assert!(group.is_active());
            assert!(group.contains("c2"));
            assert!(!group.contains("c1"));
            assert!(matches!(node.get_cache("c1"), Err(Error::CacheNotFound(_))));

            let c2 = node.get_cache("c2").unwrap();
            assert_eq!(c2.size().await.unwrap(), 20);
            assert_eq!(
                c2.get(key(7)).await.unwrap(),
                Some(Bytes::from_static(b"two"))
            );
        }

        // The handle of the destroyed cache went away with it.
        assert!(matches!(c1.get(key(1)).await, Err(Error::CacheNotFound(_))));
    }

    #[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
    async fn test_destroy_last_cache_stops_group() {
        let cluster = servers(&[1, 2, 3]).await;

        cluster[1]
            .create_cache(CacheConfiguration::new("c1").with_group("g1"))
            .await
            .unwrap();
        cluster[1]
            .create_cache(CacheConfiguration::new("other").with_group("g2"))
            .await
            .unwrap();

        cluster.await_partition_map_exchange().await.unwrap();
        cluster[3].destroy_cache("c1").await.unwrap();
        cluster.await_partition_map_exchange().await.unwrap();

        for node in cluster.nodes() {
            assert!(node.cache_group("g1").is_none());
            assert!(node.registry().snapshot().group("g1").is_none());
            assert!(node.cache_group("g2").is_some());
        }

        // Destroying an absent cache is a no-op.
        let version = cluster.discovery.version();
        cluster.await_partition_map_exchange().await.unwrap();
        cluster[2].destroy_cache("c1").await.unwrap();
        assert_eq!(cluster.discovery.version(), version);
    }

    #[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
    async fn test_recreated_cache_starts_empty() {
        let cluster = servers(&[1, 2]).await;
        let config = CacheConfiguration::new("c1").with_group("g1").with_backups(1);

        let cache = cluster[1].create_cache(config.clone()).await.unwrap();
        for i in 0..10 {
            cache.put(key(i), Bytes::from_static(b"v")).await.unwrap();
        }
        cluster[1].destroy_cache("c1").await.unwrap();
        cluster.await_partition_map_exchange().await.unwrap();

        let cache = cluster[2].create_cache(config).await.unwrap();
        cluster.await_partition_map_exchange().await.unwrap();
        assert_eq!(cache.size().await.unwrap(), 0);
        assert_eq!(cache.get(key(3)).await.unwrap(), None);
    }

    #[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
    async fn test_create_destroy_iterations() {
        for nodes in [1u64, 5] {
            let ids: Vec<u64> = (1..=nodes).collect();
            let cluster = servers(&ids).await;

            for iteration in 0..3 {
                for (i, name) in ["cache1", "cache2"].into_iter().enumerate() {
                    let creator = ids[(iteration + i) % ids.len()];
                    let cache = cluster[creator]
                        .create_cache(
                            CacheConfiguration::new(name)
                                .with_group("grp1")
                                .with_backups(1)
                                .with_partitions(32),
                        )
                        .await
                        .unwrap();
                    cache.put(key(iteration as u64), Bytes::from_static(b"x")).await.unwrap();
                }
                cluster.await_partition_map_exchange().await.unwrap();
                for node in cluster.nodes() {
                    let group = node.cache_group("grp1").unwrap();
                    assert_eq!(group.members.len(), 2);
                    assert_eq!(node.get_cache("cache2").unwrap().size().await.unwrap(), 1);
                }

                let destroyer = ids[iteration % ids.len()];
                cluster[destroyer].destroy_cache("cache1").await.unwrap();
                cluster[destroyer].destroy_cache("cache2").await.unwrap();
                cluster.await_partition_map_exchange().await.unwrap();
                for node in cluster.nodes() {
                    assert!(node.cache_group("grp1").is_none());
                    assert!(node.cache_names().is_empty());
                }
            }
        }
    }

    #[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
    async fn test_single_node_group_then_join() {
        let mut cluster = servers(&[1]).await;

        let c1 = cluster[1]
            .create_cache(CacheConfiguration::new("c1").with_group("grp1").with_backups(1))
            .await
            .unwrap();
        let c2 = cluster[1]
            .create_cache(CacheConfiguration::new("c2").with_group("grp1").with_backups(1))
            .await
            .unwrap();
        c1.put(key(1), Bytes::from_static(b"1")).await.unwrap();
        c2.put(key(1), Bytes::from_static(b"2")).await.unwrap();

        cluster.start_server(2).await.unwrap();
        cluster.await_partition_map_exchange().await.unwrap();

        // One backup on two servers: both nodes own every partition.
        let node2 = &cluster[2];
        for (name, value) in [("c1", "1"), ("c2", "2")] {
            let cache = node2.get_cache(name).unwrap();
            assert_eq!(
                cache.local_peek(key(1), PeekMode::All).unwrap(),
                Some(Bytes::from(value))
            );
            assert_eq!(cache.local_size(PeekMode::All).unwrap(), 1);
        }
    }

    #[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
    async fn test_leave_keeps_data_with_backup() {
        let mut cluster = servers(&[1, 2, 3]).await;
        let cache = cluster[1]
            .create_cache(
                CacheConfiguration::new("c1")
                    .with_group("g1")
                    .with_backups(1)
                    .with_partitions(32),
            )
            .await
            .unwrap();
        for i in 0..50 {
            cache.put(key(i), Bytes::from(format!("{}", i))).await.unwrap();
        }

        cluster.stop_node(2);
        cluster.await_partition_map_exchange().await.unwrap();

        let ok = wait_for(
            || cluster.nodes().all(|n| n.moving_partitions() == 0),
            SETTLE_TIMEOUT,
            Duration::from_millis(20),
        )
        .await;
        assert!(ok);
        assert_eq!(cache.size().await.unwrap(), 50);
        for i in 0..50 {
            assert_eq!(
                cache.get(key(i)).await.unwrap(),
                Some(Bytes::from(format!("{}", i)))
            );
        }
    }
}
