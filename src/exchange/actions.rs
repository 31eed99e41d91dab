//! What starts an exchange and what it does.

use crate::cluster::{CustomEvent, DiscoveryEvent};
use crate::config::CacheConfiguration;
use crate::types::NodeId;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Cache start or stop sent through discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheChangeRequest {
    pub id: Uuid,
    /// Node whose caller waits for the outcome.
    pub initiator: NodeId,
    pub kind: CacheChangeKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheChangeKind {
    Start(CacheConfiguration),
    Stop(String),
}

impl CacheChangeRequest {
    pub fn start(initiator: NodeId, config: CacheConfiguration) -> Self {
        Self {
            id: Uuid::new_v4(),
            initiator,
            kind: CacheChangeKind::Start(config),
        }
    }

    pub fn stop(initiator: NodeId, cache: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            initiator,
            kind: CacheChangeKind::Stop(cache.into()),
        }
    }

    pub fn cache_name(&self) -> &str {
        match &self.kind {
            CacheChangeKind::Start(config) => &config.name,
            CacheChangeKind::Stop(name) => name,
        }
    }
}

/// Event that produced an exchange version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeTrigger {
    NodeJoined(NodeId),
    NodeLeft(NodeId),
    NodeFailed(NodeId),
    CacheChange,
    AffinityConfirm,
    /// Several events batched after a supersession.
    Merged { events: usize },
}

impl ExchangeTrigger {
    pub fn from_event(event: &DiscoveryEvent) -> Self {
        match event {
            DiscoveryEvent::NodeJoined { node_id, .. } => ExchangeTrigger::NodeJoined(*node_id),
            DiscoveryEvent::NodeLeft { node_id } => ExchangeTrigger::NodeLeft(*node_id),
            DiscoveryEvent::NodeFailed { node_id } => ExchangeTrigger::NodeFailed(*node_id),
            DiscoveryEvent::Custom(CustomEvent::CacheChange(_)) => ExchangeTrigger::CacheChange,
            DiscoveryEvent::Custom(CustomEvent::AffinityConfirm { .. }) => {
                ExchangeTrigger::AffinityConfirm
            }
        }
    }

    /// Trigger of a batch of events.
    pub fn of_batch<'a>(events: impl IntoIterator<Item = &'a DiscoveryEvent>) -> Option<Self> {
        let events: Vec<&DiscoveryEvent> = events.into_iter().collect();
        match events.as_slice() {
            [] => None,
            [single] => Some(Self::from_event(single)),
            many => Some(ExchangeTrigger::Merged { events: many.len() }),
        }
    }
}

impl fmt::Display for ExchangeTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExchangeTrigger::NodeJoined(n) => write!(f, "node {} joined", n),
            ExchangeTrigger::NodeLeft(n) => write!(f, "node {} left", n),
            ExchangeTrigger::NodeFailed(n) => write!(f, "node {} failed", n),
            ExchangeTrigger::CacheChange => write!(f, "cache change"),
            ExchangeTrigger::AffinityConfirm => write!(f, "affinity confirm"),
            ExchangeTrigger::Merged { events } => write!(f, "{} merged events", events),
        }
    }
}

/// Registry change made by an applied exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExchangeAction {
    StartCache { cache: String, group: String },
    StopCache { cache: String, group: String },
    StopGroup { group: String },
    ConfirmAffinity,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_trigger() {
        let join = DiscoveryEvent::NodeJoined {
            node_id: 2,
            role: crate::types::NodeRole::Server,
        };
        let failed = DiscoveryEvent::NodeFailed { node_id: 1 };

        assert_eq!(ExchangeTrigger::of_batch([]), None);
        assert_eq!(
            ExchangeTrigger::of_batch([&join]),
            Some(ExchangeTrigger::NodeJoined(2))
        );
        assert_eq!(
            ExchangeTrigger::of_batch([&join, &failed]),
            Some(ExchangeTrigger::Merged { events: 2 })
        );
        assert_eq!(ExchangeTrigger::NodeFailed(1).to_string(), "node 1 failed");
    }

    #[test]
    fn test_request_names_cache() {
        let start = CacheChangeRequest::start(1, CacheConfiguration::new("c1").with_group("g"));
        let stop = CacheChangeRequest::stop(1, "c1");
        assert_eq!(start.cache_name(), "c1");
        assert_eq!(stop.cache_name(), "c1");
        assert_ne!(start.id, stop.id);
    }
}
