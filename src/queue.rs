//! In-memory queue of randomness requests awaiting fulfillment.

use alloy::primitives::U256;
use alloy::rpc::types::Log;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

/// A `RequestReceived` event waiting to be fulfilled.
#[derive(Debug, Clone)]
pub struct RandomnessRequest {
    pub request_id: U256,
    /// Block the request was emitted in, when the node reports it.
    pub source_block: Option<u64>,
    /// The log the request was decoded from.
    pub log: Log,
}

impl RandomnessRequest {
    pub fn from_log(request_id: U256, log: Log) -> Self {
        Self { request_id, source_block: log.block_number, log }
    }
}

/// FIFO of pending requests. Failed requests are put back at the head so
/// they are retried before anything newer.
///
/// Every operation takes the lock once, so producers and the processor never
/// observe a partially applied append, take or prepend. Uniqueness is not
/// enforced here; see [`crate::dedup::DedupTracker`].
#[derive(Debug, Default)]
pub struct RequestQueue {
    items: Mutex<VecDeque<RandomnessRequest>>,
}

impl RequestQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<RandomnessRequest>> {
        self.items.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append requests at the tail, keeping their order.
    pub fn append(&self, requests: impl IntoIterator<Item = RandomnessRequest>) {
        self.lock().extend(requests);
    }

    /// Remove and return up to `max` requests from the head.
    pub fn take(&self, max: usize) -> Vec<RandomnessRequest> {
        let mut items = self.lock();
        let n = max.min(items.len());
        items.drain(..n).collect()
    }

    /// Insert requests at the head, keeping their order.
    pub fn prepend(&self, requests: Vec<RandomnessRequest>) {
        let mut items = self.lock();
        for request in requests.into_iter().rev() {
            items.push_front(request);
        }
    }

    /// Number of queued requests, duplicates included.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether nothing is waiting for fulfillment.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Request ids from head to tail.
    #[cfg(test)]
    pub fn request_ids(&self) -> Vec<U256> {
        self.lock().iter().map(|r| r.request_id).collect()
    }
}
