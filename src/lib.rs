//! Cache groups for a partitioned in-memory data grid.
//!
//! Caches that share one partition map and affinity function form a cache
//! group. Every node keeps its own registry of groups, and all nodes agree
//! on group membership and partition ownership through a partition map
//! exchange run for each topology version.
//!
//! # Features
//!
//! - Deterministic affinity: identical inputs give identical assignments on
//!   every node
//! - Group-wide configuration checks (cache mode, backups and optional
//!   extra rules) with conflicts reported on every node
//! - Strictly ordered exchanges; a coordinator failure supersedes the
//!   running exchange instead of interrupting it
//! - Per-node cache handles that open and close without an exchange
//! - Query field accessors over serialized keys and values
//!
//! # Example
//!
//! ```rust,ignore
//! use cachegroup::{CacheConfiguration, GridNode, LocalDiscovery, LocalNetwork, NodeConfig};
//!
//! let discovery = LocalDiscovery::new();
//! let network = LocalNetwork::new();
//! let node = GridNode::start(NodeConfig::server(1), &discovery, &network).await?;
//!
//! let cache = node
//!     .create_cache(CacheConfiguration::new("c1").with_group("g1").with_backups(1))
//!     .await?;
//! cache.put("user:123", "Alice").await?;
//! assert!(cache.get("user:123").await?.is_some());
//!
//! node.destroy_cache("c1").await?;
//! node.stop();
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                  GridNode                    │
//! │  create / destroy / get / close cache        │
//! └──────────────────────────────────────────────┘
//!          │                       │
//!          ▼                       ▼
//! ┌──────────────────┐   ┌──────────────────────┐
//! │ Exchange worker  │   │ Cache handles        │
//! │ (one per node)   │   │ request router       │
//! └──────────────────┘   └──────────────────────┘
//!          │                       │
//!     ┌────┴─────────┬─────────────┤
//!     ▼              ▼             ▼
//! ┌──────────┐ ┌──────────┐ ┌────────────┐
//! │ Registry │ │ Affinity │ │ Partition  │
//! │ snapshot │ │ function │ │ store      │
//! └──────────┘ └──────────┘ └────────────┘
//! ```

pub mod affinity;
pub mod cache;
pub mod cluster;
pub mod config;
pub mod error;
pub mod exchange;
pub mod metrics;
pub mod network;
pub mod node;
pub mod query;
pub mod registry;
pub mod storage;
pub mod testing;
pub mod types;

// Re-export main types for convenience
pub use cache::{CacheHandle, HandleState};
pub use config::{
    AffinityConfig, CacheConfiguration, ExchangeConfig, NodeConfig, RouterConfig,
    ValidationRules,
};
pub use error::{ConfigurationConflict, Error, Result};
pub use node::GridNode;
pub use types::{AtomicityMode, CacheMode, NodeId, NodeRole, PeekMode, TopologyVersion};

// Re-export cluster types
pub use cluster::{Discovery, DiscoveryEvent, LocalDiscovery};
pub use network::LocalNetwork;

// Re-export registry and affinity types
pub use affinity::{AffinityKind, PartitionAssignment};
pub use registry::{CacheDescriptor, CacheGroup, CacheGroupRegistry, GroupState};

// Re-export exchange types
pub use exchange::{ExchangeRecord, ExchangeState, ExchangeTrigger};

// Re-export query types
pub use query::{FieldType, FieldValue, QueryProperty, RecordBuilder};

// Re-export metrics types
pub use metrics::{GridMetrics, MetricsSnapshot};

// Re-export testing types
pub use testing::TestCluster;
