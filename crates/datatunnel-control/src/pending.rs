//! Pending call tracker
//!
//! Tracks REQUESTs sent on one control stream and routes each RESPONSE back
//! to the task awaiting it. This is the only mutable state shared between
//! the read loop and calling tasks.

use crate::error::RpcError;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use datatunnel_proto::ControlStreamMessage;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::debug;

/// Tracks in-flight requests awaiting responses, keyed by message id
#[derive(Clone, Default)]
pub struct PendingCalls {
    calls: Arc<DashMap<u64, oneshot::Sender<ControlStreamMessage>>>,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new pending call
    /// Returns a receiver that will receive the response
    pub fn register(&self, id: u64) -> Result<oneshot::Receiver<ControlStreamMessage>, RpcError> {
        match self.calls.entry(id) {
            Entry::Occupied(_) => Err(RpcError::DuplicateCallId(id)),
            Entry::Vacant(slot) => {
                let (tx, rx) = oneshot::channel();
                slot.insert(tx);
                debug!(id, "Registered pending call");
                Ok(rx)
            }
        }
    }

    /// Deliver a response to its pending call
    /// Returns true if the response was delivered, false if no caller waits for it
    pub fn respond(&self, id: u64, response: ControlStreamMessage) -> bool {
        match self.calls.remove(&id) {
            Some((_, tx)) => tx.send(response).is_ok(),
            None => false,
        }
    }

    /// Remove a pending call (timeout, cancellation, dropped caller)
    pub fn cancel(&self, id: u64) {
        if self.calls.remove(&id).is_some() {
            debug!(id, "Cancelled pending call");
        }
    }

    /// Drop every pending call; their receivers observe a closed channel
    pub fn fail_all(&self) {
        let count = self.calls.len();
        self.calls.clear();
        if count > 0 {
            debug!(count, "Failed all pending calls");
        }
    }

    /// Get count of pending calls
    pub fn count(&self) -> usize {
        self.calls.len()
    }
}
