//! Cluster membership and discovery.

pub mod discovery;
pub mod events;
pub mod topology;

pub use discovery::{Discovery, DiscoveryEndpoint, DiscoveryJoin, LocalDiscovery};
pub use events::{CustomEvent, DiscoveryEvent, TopologyEvent};
pub use topology::{ClusterNode, TopologySnapshot};
