//! Testing utilities for cache groups.
//!
//! [`TestCluster`] runs several [`GridNode`]s in one process over a shared
//! [`LocalDiscovery`] and [`LocalNetwork`], and lets tests stop, fail and
//! isolate nodes.
//!
//! # Example
//!
//! ```rust,ignore
//! let mut cluster = TestCluster::new();
//! cluster.start_server(1).await?;
//! cluster.start_server(2).await?;
//!
//! let cache = cluster[1]
//!     .create_cache(CacheConfiguration::new("c1").with_group("g1"))
//!     .await?;
//! cache.put("k", "v").await?;
//! cluster.await_partition_map_exchange().await?;
//! ```

mod cache_group_tests;
mod exchange_tests;
pub(crate) mod utils;

use crate::cluster::LocalDiscovery;
use crate::config::NodeConfig;
use crate::error::{Error, Result};
use crate::network::LocalNetwork;
use crate::node::GridNode;
use crate::types::{NodeId, NodeRole};
use std::collections::BTreeMap;
use std::ops::Index;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Default wait for exchanges and preloading to settle.
pub const SETTLE_TIMEOUT: Duration = Duration::from_secs(10);

/// An in-process cluster of grid nodes.
pub struct TestCluster {
    pub discovery: Arc<LocalDiscovery>,
    pub network: Arc<LocalNetwork>,
    nodes: BTreeMap<NodeId, GridNode>,
    /// Configuration every started node is derived from.
    template: NodeConfig,
}

impl Default for TestCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl TestCluster {
    pub fn new() -> Self {
        Self::with_config(NodeConfig::default())
    }

    /// Create a cluster whose nodes start from `template`.
    pub fn with_config(template: NodeConfig) -> Self {
        Self {
            discovery: LocalDiscovery::new(),
            network: LocalNetwork::new(),
            nodes: BTreeMap::new(),
            template,
        }
    }

    pub async fn start_server(&mut self, node_id: NodeId) -> Result<&GridNode> {
        self.start_node(node_id, NodeRole::Server).await
    }

    pub async fn start_client(&mut self, node_id: NodeId) -> Result<&GridNode> {
        self.start_node(node_id, NodeRole::Client).await
    }

    pub async fn start_node(&mut self, node_id: NodeId, role: NodeRole) -> Result<&GridNode> {
        let config = self
            .template
            .clone()
            .with_node_id(node_id)
            .with_role(role);
        let node = GridNode::start(config, &self.discovery, &self.network).await?;
        Ok(self.nodes.entry(node_id).or_insert(node))
    }

    pub fn node(&self, node_id: NodeId) -> Option<&GridNode> {
        self.nodes.get(&node_id)
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.keys().copied().collect()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &GridNode> {
        self.nodes.values()
    }

    /// Stop a node gracefully.
    pub fn stop_node(&mut self, node_id: NodeId) -> bool {
        match self.nodes.remove(&node_id) {
            Some(node) => {
                node.stop();
                true
            }
            None => false,
        }
    }

    /// Crash a node and let discovery report it as failed.
    pub fn fail_node(&mut self, node_id: NodeId) -> bool {
        let Some(node) = self.nodes.remove(&node_id) else {
            return false;
        };
        info!(node_id, "Failing node");
        self.discovery.fail(node_id);
        node.halt();
        true
    }

    /// Drop all network traffic of a node. Discovery still reaches it.
    pub fn block(&self, node_id: NodeId) {
        self.network.block(node_id);
    }

    pub fn unblock(&self, node_id: NodeId) {
        self.network.unblock(node_id);
    }

    /// Wait until every node applied the latest topology version and has no
    /// partition left to preload.
    pub async fn await_partition_map_exchange(&self) -> Result<()> {
        let target = self.discovery.version();
        let settled = utils::wait_for(
            || {
                self.nodes
                    .values()
                    .all(|n| n.topology_version() >= target && n.moving_partitions() == 0)
            },
            SETTLE_TIMEOUT,
            Duration::from_millis(20),
        )
        .await;

        if settled {
            Ok(())
        } else {
            Err(Error::Timeout)
        }
    }
}

impl Index<NodeId> for TestCluster {
    type Output = GridNode;

    fn index(&self, node_id: NodeId) -> &GridNode {
        &self.nodes[&node_id]
    }
}
