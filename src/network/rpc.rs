//! Message types exchanged between nodes.

use crate::affinity::PartitionAssignment;
use crate::error::RemoteError;
use crate::registry::RegistryState;
use crate::storage::PartitionState;
use crate::types::{CacheId, NodeId, PartitionId, TopologyVersion};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Network message wrapper for all node-to-node communication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    /// Local partition report sent to the exchange coordinator.
    Single(SingleMessage),

    /// Merged partition map broadcast by the coordinator.
    Full(Box<FullMessage>),

    /// Request for the contents of a partition.
    Demand(DemandMessage),

    /// Answer to a demand.
    Supply(SupplyMessage),

    /// Data operation routed to a partition owner.
    Request(DataRequest),

    /// Answer to a data operation.
    Response(DataResponse),
}

/// State of one locally held partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionReport {
    pub partition: PartitionId,
    pub state: PartitionState,
    pub size: u64,
}

/// A node's contribution to the exchange of one version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SingleMessage {
    pub version: TopologyVersion,
    pub sender: NodeId,
    /// Sender has not completed any exchange yet.
    pub fresh: bool,
    /// Held partitions by group.
    pub partitions: BTreeMap<String, Vec<PartitionReport>>,
    /// Sender's staged registry, sent by established nodes when the batch
    /// contains a join so that fresh nodes can adopt it.
    pub registry: Option<RegistryState>,
}

/// The coordinator's merged result for one version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FullMessage {
    pub version: TopologyVersion,
    pub coordinator: NodeId,
    /// Effective assignment of every group that is not stopping.
    pub assignments: BTreeMap<String, PartitionAssignment>,
    /// Stopping groups confirmed to hold no partitions anywhere.
    pub stopped: Vec<String>,
    /// Partitions whose every assigned owner reported them as owning.
    pub fully_owned: BTreeMap<String, Vec<PartitionId>>,
    /// Registry for fresh nodes to adopt.
    pub registry: Option<RegistryState>,
    /// Some assignment differs from the ideal one.
    pub late: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DemandMessage {
    pub request_id: u64,
    pub version: TopologyVersion,
    pub group: String,
    pub partition: PartitionId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupplyEntry {
    pub cache_id: CacheId,
    pub key: Bytes,
    pub value: Bytes,
}

/// Supplier's answer to a demand.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Supply {
    /// Full partition contents.
    Entries(Vec<SupplyEntry>),
    /// Supplier has not applied the demanded version yet.
    NotReady,
    /// Supplier does not hold a complete copy.
    Missing,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupplyMessage {
    pub request_id: u64,
    pub group: String,
    pub partition: PartitionId,
    pub supply: Supply,
}

/// Data operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataOp {
    Put { key: Bytes, value: Bytes },
    Get { key: Bytes },
    Remove { key: Bytes },
    /// Entries this node holds as primary.
    Size,
    /// Primary-to-backup copy of a write.
    BackupPut {
        partition: PartitionId,
        key: Bytes,
        value: Bytes,
    },
    /// Primary-to-backup copy of a removal.
    BackupRemove { partition: PartitionId, key: Bytes },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataReply {
    Done,
    Value(Option<Bytes>),
    Removed(bool),
    Size(u64),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataRequest {
    pub request_id: u64,
    /// Topology version the sender routed with.
    pub version: TopologyVersion,
    pub cache: String,
    pub op: DataOp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataResponse {
    pub request_id: u64,
    pub result: std::result::Result<DataReply, RemoteError>,
}

impl DataResponse {
    pub fn new(request_id: u64, result: crate::error::Result<DataReply>) -> Self {
        Self {
            request_id,
            result: result.map_err(RemoteError::from),
        }
    }
}

/// Encode a message to bytes.
pub fn encode_message(msg: &Message) -> Result<Vec<u8>, bincode::Error> {
    bincode::serialize(msg)
}

/// Decode a message from bytes.
pub fn decode_message(data: &[u8]) -> Result<Message, bincode::Error> {
    bincode::deserialize(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn test_full_message_serialization() {
        let mut assignments = BTreeMap::new();
        assignments.insert(
            "g1".to_string(),
            PartitionAssignment::new(4, vec![vec![1, 2], vec![2, 1]]),
        );
        let msg = Message::Full(Box::new(FullMessage {
            version: 4,
            coordinator: 1,
            assignments,
            stopped: vec!["g0".to_string()],
            fully_owned: BTreeMap::new(),
            registry: Some(RegistryState::default()),
            late: false,
        }));

        let decoded = decode_message(&encode_message(&msg).unwrap()).unwrap();
        let Message::Full(full) = decoded else {
            panic!("Wrong message type");
        };
        assert_eq!(full.version, 4);
        assert_eq!(full.assignments["g1"].owners(1), &[2, 1]);
        assert_eq!(full.stopped, vec!["g0".to_string()]);
    }

    #[test]
    fn test_response_carries_remote_error() {
        let resp = DataResponse::new(
            7,
            Err(Error::PartitionUnavailable {
                group: "g".into(),
                partition: 3,
            }),
        );
        let decoded = decode_message(&encode_message(&Message::Response(resp)).unwrap()).unwrap();
        let Message::Response(resp) = decoded else {
            panic!("Wrong message type");
        };
        assert_eq!(resp.request_id, 7);
        let err: Error = resp.result.unwrap_err().into();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_response_keeps_retryable_topology() {
        let resp = DataResponse::new(
            1,
            Err(Error::RetryableTopology {
                version: 3,
                superseded_by: 2,
            }),
        );
        let decoded = decode_message(&encode_message(&Message::Response(resp)).unwrap()).unwrap();
        let Message::Response(resp) = decoded else {
            panic!("Wrong message type");
        };
        let err: Error = resp.result.unwrap_err().into();
        assert!(err.is_retryable());
        assert!(matches!(
            err,
            Error::RetryableTopology {
                version: 3,
                superseded_by: 2
            }
        ));

        let timeout = DataResponse::new(2, Err(Error::Timeout));
        let err: Error = timeout.result.unwrap_err().into();
        assert!(matches!(err, Error::Timeout));
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(decode_message(&[0xff, 0xff, 0xff, 0xff, 0x01]).is_err());
    }
}
