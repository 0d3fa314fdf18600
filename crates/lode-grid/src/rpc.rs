//! Request/response correlation.
//!
//! Outgoing requests get a fresh id and a oneshot channel parked in the
//! pending table. The inbound loop completes the channel when a response
//! with the same id arrives; callers that time out remove their entry.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use lode_cluster::Response;
use tokio::sync::oneshot;

#[derive(Debug, Default)]
pub(crate) struct PendingCalls {
    next_id: AtomicU64,
    pending: DashMap<u64, oneshot::Sender<Response>>,
}

impl PendingCalls {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Allocates an id and the channel its response will arrive on.
    pub(crate) fn register(&self) -> (u64, oneshot::Receiver<Response>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);
        (id, rx)
    }

    /// Hands `response` to whoever is waiting on `id`. Returns false for
    /// unknown ids (late replies to calls that already timed out).
    pub(crate) fn complete(&self, id: u64, response: Response) -> bool {
        match self.pending.remove(&id) {
            Some((_, tx)) => tx.send(response).is_ok(),
            None => false,
        }
    }

    pub(crate) fn cancel(&self, id: u64) {
        self.pending.remove(&id);
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }
}
