//! Configuration types for cache-group nodes and caches.

use crate::affinity::AffinityKind;
use crate::query::FieldType;
use crate::types::{AtomicityMode, CacheMode, NodeId, NodeRole};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Partition count used when a cache does not set one.
pub const DEFAULT_PARTITIONS: u32 = 1024;

/// Main configuration for a grid node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Unique identifier for this node.
    pub node_id: NodeId,

    /// Whether this node owns partitions.
    pub role: NodeRole,

    /// Maximum number of entries kept by each on-heap entry cache.
    pub on_heap_capacity: u64,

    /// Partition map exchange configuration.
    pub exchange: ExchangeConfig,

    /// Affinity assignment configuration.
    pub affinity: AffinityConfig,

    /// Data request routing configuration.
    pub router: RouterConfig,

    /// Group-level configuration checks.
    pub validation: ValidationRules,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            role: NodeRole::Server,
            on_heap_capacity: 10_000,
            exchange: ExchangeConfig::default(),
            affinity: AffinityConfig::default(),
            router: RouterConfig::default(),
            validation: ValidationRules::default(),
        }
    }
}

impl NodeConfig {
    /// Create a new configuration for a server node.
    pub fn server(node_id: NodeId) -> Self {
        Self {
            node_id,
            ..Default::default()
        }
    }

    /// Create a new configuration for a client node.
    pub fn client(node_id: NodeId) -> Self {
        Self {
            node_id,
            role: NodeRole::Client,
            ..Default::default()
        }
    }

    /// Set the node ID.
    pub fn with_node_id(mut self, node_id: NodeId) -> Self {
        self.node_id = node_id;
        self
    }

    /// Set the node role.
    pub fn with_role(mut self, role: NodeRole) -> Self {
        self.role = role;
        self
    }

    /// Set the capacity of on-heap entry caches.
    pub fn with_on_heap_capacity(mut self, capacity: u64) -> Self {
        self.on_heap_capacity = capacity;
        self
    }

    /// Set exchange configuration.
    pub fn with_exchange_config(mut self, exchange: ExchangeConfig) -> Self {
        self.exchange = exchange;
        self
    }

    /// Set affinity configuration.
    pub fn with_affinity_config(mut self, affinity: AffinityConfig) -> Self {
        self.affinity = affinity;
        self
    }

    /// Set router configuration.
    pub fn with_router_config(mut self, router: RouterConfig) -> Self {
        self.router = router;
        self
    }

    /// Set validation rules.
    pub fn with_validation_rules(mut self, validation: ValidationRules) -> Self {
        self.validation = validation;
        self
    }
}

/// Partition map exchange configuration.
#[derive(Debug, Clone)]
pub struct ExchangeConfig {
    /// Upper bound for a caller waiting on an exchange or a cache request.
    /// The exchange itself keeps running after the caller gives up.
    pub await_timeout: Duration,

    /// Number of completed exchanges kept in the history.
    pub history_size: usize,

    /// Pause before re-demanding a partition from a supplier that has not
    /// reached the demanded topology version yet.
    pub preload_retry_interval: Duration,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            await_timeout: Duration::from_secs(30),
            history_size: 256,
            preload_retry_interval: Duration::from_millis(20),
        }
    }
}

impl ExchangeConfig {
    /// Set the await timeout.
    pub fn with_await_timeout(mut self, timeout: Duration) -> Self {
        self.await_timeout = timeout;
        self
    }

    /// Set the history size.
    pub fn with_history_size(mut self, size: usize) -> Self {
        self.history_size = size.max(1);
        self
    }

    /// Set the preload retry interval.
    pub fn with_preload_retry_interval(mut self, interval: Duration) -> Self {
        self.preload_retry_interval = interval;
        self
    }
}

/// Affinity assignment configuration.
#[derive(Debug, Clone)]
pub struct AffinityConfig {
    /// Keep previous owners in front of the ideal ones until a confirmation
    /// event switches to the ideal assignment.
    pub late_assignment: bool,

    /// Delay between publishing a late assignment and confirming it.
    pub confirm_delay: Duration,
}

impl Default for AffinityConfig {
    fn default() -> Self {
        Self {
            late_assignment: false,
            confirm_delay: Duration::from_millis(500),
        }
    }
}

impl AffinityConfig {
    /// Enable or disable late assignment.
    pub fn with_late_assignment(mut self, enabled: bool) -> Self {
        self.late_assignment = enabled;
        self
    }

    /// Set the confirmation delay.
    pub fn with_confirm_delay(mut self, delay: Duration) -> Self {
        self.confirm_delay = delay;
        self
    }
}

/// Data request routing configuration.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Attempts before a retryable failure becomes a topology error.
    pub max_attempts: u32,

    /// Base pause between attempts, multiplied by the attempt number.
    pub retry_backoff: Duration,

    /// Timeout of a single remote request.
    pub request_timeout: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            retry_backoff: Duration::from_millis(50),
            request_timeout: Duration::from_secs(5),
        }
    }
}

impl RouterConfig {
    /// Set maximum attempts.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Set retry backoff.
    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Set request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

/// Which group-level fields must match between caches of one group.
///
/// Cache mode and backups are always checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidationRules {
    pub check_atomicity: bool,
    pub check_partitions: bool,
    pub check_affinity: bool,
}

impl Default for ValidationRules {
    fn default() -> Self {
        Self {
            check_atomicity: true,
            check_partitions: true,
            check_affinity: true,
        }
    }
}

impl ValidationRules {
    /// Enable or disable the atomicity mode check.
    pub fn with_atomicity_check(mut self, enabled: bool) -> Self {
        self.check_atomicity = enabled;
        self
    }

    /// Enable or disable the partition count check.
    pub fn with_partitions_check(mut self, enabled: bool) -> Self {
        self.check_partitions = enabled;
        self
    }

    /// Enable or disable the affinity function check.
    pub fn with_affinity_check(mut self, enabled: bool) -> Self {
        self.check_affinity = enabled;
        self
    }
}

/// A field exposed for indexing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryField {
    /// Field name; dots address fields of nested records.
    pub name: String,
    /// Declared type.
    pub field_type: FieldType,
    /// Whether the field lives in the key.
    pub key_field: bool,
}

/// Configuration of a single cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfiguration {
    /// Cache name, unique cluster-wide.
    pub name: String,
    /// Group name; caches without one get a group named after themselves.
    pub group_name: Option<String>,
    pub cache_mode: CacheMode,
    pub atomicity_mode: AtomicityMode,
    /// Backup copies per partition. Ignored for replicated caches.
    pub backups: u32,
    pub partitions: u32,
    pub affinity: AffinityKind,
    /// Keep recently used primary entries in an on-heap cache.
    pub on_heap_cache: bool,
    pub query_fields: Vec<QueryField>,
}

impl CacheConfiguration {
    /// Create a partitioned, atomic cache with no backups.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            group_name: None,
            cache_mode: CacheMode::Partitioned,
            atomicity_mode: AtomicityMode::Atomic,
            backups: 0,
            partitions: DEFAULT_PARTITIONS,
            affinity: AffinityKind::default(),
            on_heap_cache: false,
            query_fields: Vec::new(),
        }
    }

    /// Name of the group this cache belongs to.
    pub fn group(&self) -> &str {
        self.group_name.as_deref().unwrap_or(&self.name)
    }

    /// Set the group name.
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group_name = Some(group.into());
        self
    }

    /// Set the cache mode.
    pub fn with_cache_mode(mut self, mode: CacheMode) -> Self {
        self.cache_mode = mode;
        self
    }

    /// Set the atomicity mode.
    pub fn with_atomicity_mode(mut self, mode: AtomicityMode) -> Self {
        self.atomicity_mode = mode;
        self
    }

    /// Set the backup count.
    pub fn with_backups(mut self, backups: u32) -> Self {
        self.backups = backups;
        self
    }

    /// Set the partition count.
    pub fn with_partitions(mut self, partitions: u32) -> Self {
        self.partitions = partitions.max(1);
        self
    }

    /// Set the affinity function.
    pub fn with_affinity(mut self, affinity: AffinityKind) -> Self {
        self.affinity = affinity;
        self
    }

    /// Enable or disable the on-heap entry cache.
    pub fn with_on_heap_cache(mut self, enabled: bool) -> Self {
        self.on_heap_cache = enabled;
        self
    }

    /// Expose a value field for indexing.
    pub fn with_query_field(mut self, name: impl Into<String>, field_type: FieldType) -> Self {
        self.query_fields.push(QueryField {
            name: name.into(),
            field_type,
            key_field: false,
        });
        self
    }

    /// Expose a key field for indexing.
    pub fn with_key_field(mut self, name: impl Into<String>, field_type: FieldType) -> Self {
        self.query_fields.push(QueryField {
            name: name.into(),
            field_type,
            key_field: true,
        });
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = NodeConfig::default();
        assert_eq!(config.node_id, 1);
        assert!(config.role.is_server());
        assert_eq!(config.router.max_attempts, 10);
        assert!(!config.affinity.late_assignment);
        assert!(config.validation.check_atomicity);
    }

    #[test]
    fn test_config_builder() {
        let config = NodeConfig::client(42)
            .with_router_config(RouterConfig::default().with_max_attempts(3))
            .with_exchange_config(ExchangeConfig::default().with_await_timeout(Duration::from_secs(2)));

        assert_eq!(config.node_id, 42);
        assert_eq!(config.role, NodeRole::Client);
        assert_eq!(config.router.max_attempts, 3);
        assert_eq!(config.exchange.await_timeout, Duration::from_secs(2));
    }

    #[test]
    fn test_implicit_group_is_cache_name() {
        let config = CacheConfiguration::new("c1");
        assert_eq!(config.group(), "c1");
        assert_eq!(config.partitions, DEFAULT_PARTITIONS);

        let config = config.with_group("g1").with_backups(2);
        assert_eq!(config.group(), "g1");
        assert_eq!(config.backups, 2);
    }
}
