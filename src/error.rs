//! Error types for the cache-group subsystem.

use crate::types::{NodeId, PartitionId, TopologyVersion};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Result type alias for cache-group operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// Group-level configuration of a new cache conflicts with its group.
    #[error(transparent)]
    ConfigurationConflict(#[from] ConfigurationConflict),

    /// A cache with this name already exists.
    #[error("cache already exists: {0}")]
    DuplicateCacheName(String),

    /// No cache with this name exists.
    #[error("cache not found: {0}")]
    CacheNotFound(String),

    /// The local handle of the cache was closed.
    #[error("cache handle closed: {0}")]
    CacheClosed(String),

    /// The exchange could not converge.
    #[error("cluster topology error: {0}")]
    ClusterTopology(String),

    /// The local exchange future was superseded; retry at the newer version.
    #[error("topology version {version} superseded by {superseded_by}, retry")]
    RetryableTopology {
        version: TopologyVersion,
        superseded_by: TopologyVersion,
    },

    /// Target partition is mid-rebalance or currently unowned.
    #[error("partition {partition} of group {group} unavailable")]
    PartitionUnavailable { group: String, partition: PartitionId },

    /// A stored entry could not be interpreted as a field record.
    #[error("invalid record: {0}")]
    InvalidRecord(String),

    /// Network communication errors.
    #[error("network error: {0}")]
    Network(#[from] NetworkError),

    /// The caller's wait timed out; the exchange keeps running.
    #[error("operation timed out")]
    Timeout,

    /// The node has been stopped.
    #[error("node stopped")]
    NodeStopped,

    /// Generic internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Check if the request-routing layer may retry this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::RetryableTopology { .. } | Error::PartitionUnavailable { .. }
        )
    }
}

/// Group-level field that differs between a new cache and its group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConflictField {
    CacheMode,
    AtomicityMode,
    Backups,
    Partitions,
    Affinity,
}

impl ConflictField {
    fn label(&self) -> &'static str {
        match self {
            ConflictField::CacheMode => "Cache mode",
            ConflictField::AtomicityMode => "Atomicity mode",
            ConflictField::Backups => "Backups",
            ConflictField::Partitions => "Partitions count",
            ConflictField::Affinity => "Affinity function",
        }
    }

    fn key(&self) -> &'static str {
        match self {
            ConflictField::CacheMode => "CacheMode",
            ConflictField::AtomicityMode => "AtomicityMode",
            ConflictField::Backups => "Backups",
            ConflictField::Partitions => "Partitions",
            ConflictField::Affinity => "Affinity",
        }
    }
}

/// A new cache disagrees with the group it wants to join.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigurationConflict {
    /// Group name.
    pub group: String,
    /// Mismatched field.
    pub field: ConflictField,
    /// Cache already in the group that was compared against.
    pub existing_cache: String,
    /// Value of the field in the group.
    pub existing: String,
    /// Value of the field in the new cache.
    pub requested: String,
}

impl fmt::Display for ConfigurationConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} mismatch for caches related to the same group [groupName={}, existingCache={}, existing{}={}, start{}={}]",
            self.field.label(),
            self.group,
            self.existing_cache,
            self.field.key(),
            self.existing,
            self.field.key(),
            self.requested,
        )
    }
}

/// Network communication errors.
#[derive(Error, Debug, Clone)]
pub enum NetworkError {
    /// The destination node is not reachable.
    #[error("peer not found: {0}")]
    PeerNotFound(NodeId),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Deserialization error.
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// The response channel was dropped.
    #[error("response channel closed")]
    ChannelClosed,
}

/// Error returned by a remote node for a data request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteError {
    PartitionUnavailable { group: String, partition: PartitionId },
    RetryableTopology {
        version: TopologyVersion,
        superseded_by: TopologyVersion,
    },
    CacheNotFound(String),
    Timeout,
    Failed(String),
}

impl From<RemoteError> for Error {
    fn from(e: RemoteError) -> Self {
        match e {
            RemoteError::PartitionUnavailable { group, partition } => {
                Error::PartitionUnavailable { group, partition }
            }
            RemoteError::RetryableTopology {
                version,
                superseded_by,
            } => Error::RetryableTopology {
                version,
                superseded_by,
            },
            RemoteError::CacheNotFound(name) => Error::CacheNotFound(name),
            RemoteError::Timeout => Error::Timeout,
            RemoteError::Failed(msg) => Error::Internal(msg),
        }
    }
}

impl From<Error> for RemoteError {
    fn from(e: Error) -> Self {
        match e {
            Error::PartitionUnavailable { group, partition } => {
                RemoteError::PartitionUnavailable { group, partition }
            }
            Error::RetryableTopology {
                version,
                superseded_by,
            } => RemoteError::RetryableTopology {
                version,
                superseded_by,
            },
            Error::CacheNotFound(name) => RemoteError::CacheNotFound(name),
            Error::Timeout => RemoteError::Timeout,
            other => RemoteError::Failed(other.to_string()),
        }
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Network(NetworkError::Serialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_message_names_group_and_field() {
        let conflict = ConfigurationConflict {
            group: "grp1".to_string(),
            field: ConflictField::Backups,
            existing_cache: "c1".to_string(),
            existing: "1".to_string(),
            requested: "2".to_string(),
        };
        let msg = Error::from(conflict).to_string();
        assert!(msg.contains("Backups mismatch for caches related to the same group [groupName=grp1"));
        assert!(msg.contains("existingBackups=1"));
        assert!(msg.contains("startBackups=2"));
    }

    #[test]
    fn test_retryable_classification() {
        assert!(Error::PartitionUnavailable {
            group: "g".into(),
            partition: 1
        }
        .is_retryable());
        assert!(Error::RetryableTopology {
            version: 3,
            superseded_by: 4
        }
        .is_retryable());
        assert!(!Error::CacheNotFound("c".into()).is_retryable());
        assert!(!Error::Timeout.is_retryable());
    }

    #[test]
    fn test_remote_error_round_trip() {
        let err: Error = RemoteError::CacheNotFound("c1".into()).into();
        assert!(matches!(err, Error::CacheNotFound(ref n) if n == "c1"));

        let remote: RemoteError = Error::PartitionUnavailable {
            group: "g".into(),
            partition: 7,
        }
        .into();
        assert_eq!(
            remote,
            RemoteError::PartitionUnavailable {
                group: "g".into(),
                partition: 7
            }
        );
    }
}
