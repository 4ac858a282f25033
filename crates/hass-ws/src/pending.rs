//! Correlation table for outstanding request/response exchanges

use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::debug;

use crate::messages::IncomingMessage;

/// Tracks every sent identifiable message still awaiting its response
///
/// Entries are created under the send gate (so the registration cannot race
/// the response) and removed either by the read loop settling them or by the
/// caller abandoning its wait. Dropping a sender cancels the waiting caller.
#[derive(Default)]
pub(crate) struct PendingRequests {
    awaiters: DashMap<u64, oneshot::Sender<IncomingMessage>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an expectation for the response with the given id
    pub fn register(&self, id: u64, sender: oneshot::Sender<IncomingMessage>) {
        self.awaiters.insert(id, sender);
    }

    /// Settle the request matching the message id, if one is outstanding
    ///
    /// Returns false when no caller is waiting for this id; such responses
    /// are stale (typically from before a reconnection) and get discarded.
    pub fn settle(&self, id: u64, message: IncomingMessage) -> bool {
        match self.awaiters.remove(&id) {
            Some((_, sender)) => {
                // The caller may have just abandoned its wait; nothing to do.
                let _ = sender.send(message);
                true
            }
            None => {
                debug!(id, "no pending request for response; discarding");
                false
            }
        }
    }

    /// Remove an entry without settling it (caller abandoned the wait)
    pub fn remove(&self, id: u64) -> bool {
        self.awaiters.remove(&id).is_some()
    }

    /// Cancel every outstanding request by dropping its sender
    pub fn cancel_all(&self) {
        self.awaiters.clear();
    }

    /// Number of requests currently awaiting a response
    pub fn len(&self) -> usize {
        self.awaiters.len()
    }
}
