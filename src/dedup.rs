//! Tracker of recently fulfilled request ids.
//!
//! Requests reach the queue through both the live stream and reconciliation,
//! so the same id is routinely queued twice. The tracker makes fulfillment
//! idempotent: an id with a completion record is skipped, and an id with an
//! attempt already in flight cannot be claimed a second time.

use alloy::primitives::U256;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

/// Outcome of [`DedupTracker::try_claim`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// The caller now owns the only in-flight attempt for this id.
    Acquired,
    /// A fulfillment for this id was already confirmed.
    AlreadyFulfilled,
    /// Another attempt for this id is in flight.
    InFlight,
}

#[derive(Debug, Default)]
struct Entries {
    completed: HashMap<U256, Instant>,
    in_flight: HashSet<U256>,
}

#[derive(Debug)]
pub struct DedupTracker {
    retention: Duration,
    entries: Mutex<Entries>,
}

impl DedupTracker {
    /// Create a tracker that remembers completions for `retention`.
    pub fn new(retention: Duration) -> Self {
        Self { retention, entries: Mutex::new(Entries::default()) }
    }

    fn lock(&self) -> MutexGuard<'_, Entries> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_live(&self, completed_at: Instant, now: Instant) -> bool {
        now.saturating_duration_since(completed_at) <= self.retention
    }

    /// Whether a confirmed fulfillment for `request_id` is still within the
    /// retention window.
    #[cfg(test)]
    pub fn is_fulfilled(&self, request_id: U256) -> bool {
        let now = Instant::now();
        self.lock()
            .completed
            .get(&request_id)
            .is_some_and(|at| self.is_live(*at, now))
    }

    /// Claim `request_id` for a fulfillment attempt.
    pub fn try_claim(&self, request_id: U256) -> Claim {
        let now = Instant::now();
        let mut entries = self.lock();
        if entries.completed.get(&request_id).is_some_and(|at| self.is_live(*at, now)) {
            return Claim::AlreadyFulfilled;
        }
        if !entries.in_flight.insert(request_id) {
            return Claim::InFlight;
        }
        Claim::Acquired
    }

    /// Record a confirmed fulfillment and release the claim.
    pub fn record_fulfilled(&self, request_id: U256) {
        let mut entries = self.lock();
        entries.in_flight.remove(&request_id);
        entries.completed.insert(request_id, Instant::now());
    }

    /// Release a claim after a failed attempt.
    pub fn release(&self, request_id: U256) {
        self.lock().in_flight.remove(&request_id);
    }

    /// Delete completion records older than `retention`. Returns how many
    /// were removed.
    pub fn evict_older_than(&self, retention: Duration) -> usize {
        let now = Instant::now();
        let mut entries = self.lock();
        let before = entries.completed.len();
        entries
            .completed
            .retain(|_, at| now.saturating_duration_since(*at) <= retention);
        before - entries.completed.len()
    }

    /// Configured completion retention.
    pub fn retention(&self) -> Duration {
        self.retention
    }

    /// Number of completion records currently held.
    pub fn len(&self) -> usize {
        self.lock().completed.len()
    }

    /// Ids with an attempt in flight.
    #[cfg(test)]
    pub fn in_flight(&self) -> usize {
        self.lock().in_flight.len()
    }
}
