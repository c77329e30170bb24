//! Correlation-id allocation and response routing.
//!
//! Every correlated request registers a oneshot waiter keyed by the id it
//! put on the wire; the reader task completes the waiter when the matching
//! response arrives. Draining the table drops all senders, so outstanding
//! callers observe closure instead of suspending past the connection's
//! lifetime.

use std::sync::atomic::{AtomicU32, Ordering};

use dashmap::DashMap;
use tokio::sync::oneshot;

use crate::codec::Response;

/// Concurrent table of response waiters keyed by correlation id.
#[derive(Debug)]
pub(crate) struct CorrelationTable {
    next_id: AtomicU32,
    waiters: DashMap<u32, oneshot::Sender<Response>>,
}

impl CorrelationTable {
    pub(crate) fn new() -> Self {
        Self {
            // Ids start at 1; some brokers log correlation id 0 as suspect.
            next_id: AtomicU32::new(1),
            waiters: DashMap::new(),
        }
    }

    /// Allocate the next correlation id without registering a waiter.
    ///
    /// Used by the handshake, which reads its replies inline rather than
    /// through the dispatch loop.
    pub(crate) fn next_id(&self) -> u32 { self.next_id.fetch_add(1, Ordering::Relaxed) }

    /// Allocate an id and register a waiter for its response.
    pub(crate) fn register(&self) -> (u32, oneshot::Receiver<Response>) {
        let correlation_id = self.next_id();
        let (tx, rx) = oneshot::channel();
        self.waiters.insert(correlation_id, tx);
        (correlation_id, rx)
    }

    /// Complete the waiter for `correlation_id`, if one is registered.
    ///
    /// Returns `false` for unmatched responses so the caller can log them.
    pub(crate) fn complete(&self, correlation_id: u32, response: Response) -> bool {
        match self.waiters.remove(&correlation_id) {
            Some((_, tx)) => tx.send(response).is_ok(),
            None => false,
        }
    }

    /// Discard the waiter for `correlation_id`, typically after a timeout.
    pub(crate) fn forget(&self, correlation_id: u32) { self.waiters.remove(&correlation_id); }

    /// Drop every registered waiter, closing their receivers.
    pub(crate) fn drain(&self) { self.waiters.clear(); }

    #[cfg(test)]
    pub(crate) fn outstanding(&self) -> usize { self.waiters.len() }
}
