//! Exchange futures: one completion per topology version.
//!
//! Callers wait on a version through a `watch` channel. The pipeline moves
//! each version through its states and completes it exactly once. Cache
//! start/stop callers wait separately, by request id, for the outcome
//! computed when their request is applied.

use super::actions::{ExchangeAction, ExchangeTrigger};
use crate::error::{Error, Result};
use crate::types::TopologyVersion;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tracing::debug;
use uuid::Uuid;

/// State of the exchange of one version on this node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExchangeState {
    Pending,
    /// Reports are being collected by the coordinator.
    Collecting,
    /// The coordinator is merging reports.
    Merging,
    Applied,
    /// Overtaken by the exchange of a newer version.
    Superseded { by: TopologyVersion },
    /// Could not converge.
    Failed(String),
}

impl ExchangeState {
    pub fn is_done(&self) -> bool {
        matches!(
            self,
            ExchangeState::Applied | ExchangeState::Superseded { .. } | ExchangeState::Failed(_)
        )
    }
}

impl fmt::Display for ExchangeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExchangeState::Pending => write!(f, "pending"),
            ExchangeState::Collecting => write!(f, "collecting"),
            ExchangeState::Merging => write!(f, "merging"),
            ExchangeState::Applied => write!(f, "applied"),
            ExchangeState::Superseded { by } => write!(f, "superseded by {}", by),
            ExchangeState::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

/// A finished exchange, kept in the bounded history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeRecord {
    pub version: TopologyVersion,
    pub trigger: ExchangeTrigger,
    pub outcome: ExchangeState,
    pub duration: Duration,
    pub actions: Vec<ExchangeAction>,
}

#[derive(Debug)]
pub struct ExchangeFutures {
    states: Mutex<BTreeMap<TopologyVersion, watch::Sender<ExchangeState>>>,
    /// Versions at or below this were completed and forgotten.
    pruned_through: Mutex<TopologyVersion>,
    requests: Mutex<HashMap<Uuid, oneshot::Sender<Result<()>>>>,
    history: Mutex<VecDeque<ExchangeRecord>>,
    history_size: usize,
}

impl ExchangeFutures {
    pub fn new(history_size: usize) -> Self {
        Self {
            states: Mutex::new(BTreeMap::new()),
            pruned_through: Mutex::new(0),
            requests: Mutex::new(HashMap::new()),
            history: Mutex::new(VecDeque::new()),
            history_size: history_size.max(1),
        }
    }

    fn subscribe(&self, version: TopologyVersion) -> watch::Receiver<ExchangeState> {
        if version <= *self.pruned_through.lock() {
            let (tx, rx) = watch::channel(ExchangeState::Applied);
            drop(tx);
            return rx;
        }
        self.states
            .lock()
            .entry(version)
            .or_insert_with(|| watch::channel(ExchangeState::Pending).0)
            .subscribe()
    }

    /// Current state of a version, if it is tracked.
    pub fn state(&self, version: TopologyVersion) -> Option<ExchangeState> {
        self.states.lock().get(&version).map(|tx| tx.borrow().clone())
    }

    /// Move a version to a new state. Completed versions do not change.
    pub fn set_state(&self, version: TopologyVersion, state: ExchangeState) {
        let mut states = self.states.lock();
        let tx = states
            .entry(version)
            .or_insert_with(|| watch::channel(ExchangeState::Pending).0);
        tx.send_if_modified(|current| {
            if current.is_done() || *current == state {
                return false;
            }
            *current = state.clone();
            true
        });
    }

    /// Complete a version and forget the oldest completed ones beyond the
    /// history size.
    pub fn complete(&self, version: TopologyVersion, outcome: ExchangeState) {
        debug_assert!(outcome.is_done());
        self.set_state(version, outcome);

        let mut states = self.states.lock();
        while states.len() > self.history_size {
            let Some((&oldest, tx)) = states.iter().next() else {
                break;
            };
            if !tx.borrow().is_done() {
                break;
            }
            states.remove(&oldest);
            let mut pruned = self.pruned_through.lock();
            *pruned = (*pruned).max(oldest);
        }
    }

    /// Wait for a version to complete.
    ///
    /// A superseded version fails with a retryable error naming the newer
    /// version; a failed one with a cluster topology error.
    pub async fn wait(&self, version: TopologyVersion, timeout: Duration) -> Result<()> {
        let mut rx = self.subscribe(version);
        let wait = async move {
            loop {
                let state = rx.borrow_and_update().clone();
                match state {
                    ExchangeState::Applied => return Ok(()),
                    ExchangeState::Superseded { by } => {
                        return Err(Error::RetryableTopology {
                            version,
                            superseded_by: by,
                        })
                    }
                    ExchangeState::Failed(reason) => return Err(Error::ClusterTopology(reason)),
                    _ => {}
                }
                if rx.changed().await.is_err() {
                    return Err(Error::NodeStopped);
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| Error::Timeout)?
    }

    /// Wait until `version` or the version that superseded it is applied.
    pub async fn wait_ready(&self, mut version: TopologyVersion, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let left = deadline.saturating_duration_since(tokio::time::Instant::now());
            match self.wait(version, left).await {
                Err(Error::RetryableTopology { superseded_by, .. }) => {
                    debug!(version, superseded_by, "Following superseding exchange");
                    version = superseded_by;
                }
                other => return other,
            }
        }
    }

    /// Register the caller of a cache change before sending it.
    pub fn register_request(&self, id: Uuid) -> oneshot::Receiver<Result<()>> {
        let (tx, rx) = oneshot::channel();
        self.requests.lock().insert(id, tx);
        rx
    }

    /// Deliver the outcome of a cache change. Returns false if nobody waits.
    pub fn complete_request(&self, id: Uuid, outcome: Result<()>) -> bool {
        match self.requests.lock().remove(&id) {
            Some(tx) => tx.send(outcome).is_ok(),
            None => false,
        }
    }

    pub fn cancel_request(&self, id: Uuid) {
        self.requests.lock().remove(&id);
    }

    pub fn record(&self, record: ExchangeRecord) {
        let mut history = self.history.lock();
        history.push_back(record);
        while history.len() > self.history_size {
            history.pop_front();
        }
    }

    /// Completed exchanges, oldest first.
    pub fn history(&self) -> Vec<ExchangeRecord> {
        self.history.lock().iter().cloned().collect()
    }

    /// Fail every waiter; used when the node stops.
    pub fn close(&self) {
        for (_, tx) in self.requests.lock().drain() {
            let _ = tx.send(Err(Error::NodeStopped));
        }
        self.states.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const WAIT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_wait_applied() {
        let futures = Arc::new(ExchangeFutures::new(16));
        let waiter = {
            let futures = futures.clone();
            tokio::spawn(async move { futures.wait(3, WAIT).await })
        };

        futures.set_state(3, ExchangeState::Collecting);
        futures.complete(3, ExchangeState::Applied);
        assert!(waiter.await.unwrap().is_ok());

        // Completed versions keep their outcome.
        futures.set_state(3, ExchangeState::Merging);
        assert_eq!(futures.state(3), Some(ExchangeState::Applied));
    }

    #[tokio::test]
    async fn test_superseded_and_failed() {
        let futures = ExchangeFutures::new(16);
        futures.complete(4, ExchangeState::Superseded { by: 6 });
        futures.complete(6, ExchangeState::Failed("no servers".into()));

        let err = futures.wait(4, WAIT).await.unwrap_err();
        assert!(matches!(
            err,
            Error::RetryableTopology {
                version: 4,
                superseded_by: 6
            }
        ));
        assert!(err.is_retryable());

        let err = futures.wait(6, WAIT).await.unwrap_err();
        assert!(matches!(err, Error::ClusterTopology(ref r) if r == "no servers"));

        let err = futures.wait_ready(4, WAIT).await.unwrap_err();
        assert!(matches!(err, Error::ClusterTopology(_)));
    }

    #[tokio::test]
    async fn test_wait_times_out() {
        let futures = ExchangeFutures::new(16);
        let err = futures.wait(9, Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, Error::Timeout));
        assert_eq!(futures.state(9), Some(ExchangeState::Pending));
    }

    #[tokio::test]
    async fn test_pruned_versions_count_as_applied() {
        let futures = ExchangeFutures::new(2);
        for v in 1..=4 {
            futures.complete(v, ExchangeState::Applied);
        }
        assert_eq!(futures.state(1), None);
        assert!(futures.wait(1, WAIT).await.is_ok());
    }

    #[tokio::test]
    async fn test_requests_and_close() {
        let futures = ExchangeFutures::new(4);
        let id = Uuid::new_v4();
        let rx = futures.register_request(id);
        assert!(futures.complete_request(id, Ok(())));
        assert!(rx.await.unwrap().is_ok());
        assert!(!futures.complete_request(id, Ok(())));

        let pending = futures.register_request(Uuid::new_v4());
        futures.close();
        assert!(matches!(pending.await.unwrap(), Err(Error::NodeStopped)));
    }

    #[test]
    fn test_history_is_bounded() {
        let futures = ExchangeFutures::new(2);
        for version in 1..=3 {
            futures.record(ExchangeRecord {
                version,
                trigger: ExchangeTrigger::CacheChange,
                outcome: ExchangeState::Applied,
                duration: Duration::ZERO,
                actions: vec![],
            });
        }
        let versions: Vec<_> = futures.history().iter().map(|r| r.version).collect();
        assert_eq!(versions, vec![2, 3]);
    }
}
