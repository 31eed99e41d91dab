//! Network communication layer.

pub mod pending;
pub mod rpc;
pub mod transport;

pub use pending::PendingRequests;
pub use rpc::{
    decode_message, encode_message, DataOp, DataReply, DataRequest, DataResponse, DemandMessage,
    FullMessage, Message, PartitionReport, SingleMessage, Supply, SupplyEntry, SupplyMessage,
};
pub use transport::{Envelope, LocalNetwork, NetworkEndpoint, Transport};
