//! Request/response correlation by request ID.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::oneshot;

/// Outstanding requests awaiting a response of type `T`.
#[derive(Debug)]
pub struct PendingRequests<T> {
    pending: Mutex<HashMap<u64, oneshot::Sender<T>>>,
    next_request_id: AtomicU64,
}

impl<T> Default for PendingRequests<T> {
    fn default() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            next_request_id: AtomicU64::new(1),
        }
    }
}

impl<T> PendingRequests<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a request ID and the receiver its response will arrive on.
    pub fn register(&self) -> (u64, oneshot::Receiver<T>) {
        let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);
        (id, rx)
    }

    /// Deliver a response. Returns false for unknown or abandoned requests.
    pub fn complete(&self, id: u64, response: T) -> bool {
        match self.pending.lock().remove(&id) {
            Some(tx) => tx.send(response).is_ok(),
            None => false,
        }
    }

    /// Forget a request, e.g. after its wait timed out.
    pub fn cancel(&self, id: u64) {
        self.pending.lock().remove(&id);
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
