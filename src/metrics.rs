//! Counters for the oracle pipeline.
//!
//! All counters are backed by atomics for lock-free concurrent access.

use std::sync::atomic::{AtomicU64, Ordering};

/// Aggregated metrics for the randomizer oracle.
///
/// Thread-safe via atomics; shared via `Arc<Metrics>`.
#[derive(Default)]
pub struct Metrics {
    /// Requests enqueued from the live websocket subscription.
    pub live_requests_enqueued: AtomicU64,
    /// Requests enqueued by reconciliation runs.
    pub reconciled_requests_enqueued: AtomicU64,
    /// Fulfillment transactions confirmed on-chain.
    pub requests_fulfilled: AtomicU64,
    /// Fulfillment attempts that failed and went back to the queue head.
    pub requests_requeued: AtomicU64,
    /// Queue entries dropped because the id was fulfilled or already in flight.
    pub duplicates_skipped: AtomicU64,
    /// `setGasPriceWei` transactions confirmed.
    pub gas_price_injections: AtomicU64,
    /// Live sessions that ended and scheduled a reconnect: closed streams,
    /// failed or unanswered probes, and refused connection attempts.
    pub live_reconnects: AtomicU64,
    /// Sum of fulfillment latencies in milliseconds (for computing average).
    pub fulfillment_latency_sum_ms: AtomicU64,
}

impl Metrics {
    /// Create a new zeroed metrics instance.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a request enqueued from the websocket subscription.
    pub fn record_live_request(&self) {
        self.live_requests_enqueued.fetch_add(1, Ordering::Relaxed);
    }

    /// Record `count` requests enqueued by one reconciliation run.
    pub fn record_reconciled_requests(&self, count: u64) {
        self.reconciled_requests_enqueued.fetch_add(count, Ordering::Relaxed);
    }

    /// Record a confirmed fulfillment with its latency.
    pub fn record_fulfillment(&self, latency_ms: u64) {
        self.requests_fulfilled.fetch_add(1, Ordering::Relaxed);
        self.fulfillment_latency_sum_ms.fetch_add(latency_ms, Ordering::Relaxed);
    }

    /// Record a failed attempt whose request went back to the queue head.
    pub fn record_requeue(&self) {
        self.requests_requeued.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a queue entry skipped by the dedup tracker.
    pub fn record_duplicate(&self) {
        self.duplicates_skipped.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a confirmed `setGasPriceWei` transaction.
    pub fn record_gas_injection(&self) {
        self.gas_price_injections.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a live session ending before a reconnect.
    pub fn record_reconnect(&self) {
        self.live_reconnects.fetch_add(1, Ordering::Relaxed);
    }

    /// Average fulfillment latency in milliseconds, or 0 if none.
    pub fn avg_latency_ms(&self) -> u64 {
        let count = self.requests_fulfilled.load(Ordering::Relaxed);
        if count == 0 {
            return 0;
        }
        self.fulfillment_latency_sum_ms.load(Ordering::Relaxed) / count
    }

    /// Serialize metrics as a JSON value.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "live_requests_enqueued": self.live_requests_enqueued.load(Ordering::Relaxed),
            "reconciled_requests_enqueued":
                self.reconciled_requests_enqueued.load(Ordering::Relaxed),
            "requests_fulfilled": self.requests_fulfilled.load(Ordering::Relaxed),
            "requests_requeued": self.requests_requeued.load(Ordering::Relaxed),
            "duplicates_skipped": self.duplicates_skipped.load(Ordering::Relaxed),
            "gas_price_injections": self.gas_price_injections.load(Ordering::Relaxed),
            "live_reconnects": self.live_reconnects.load(Ordering::Relaxed),
            "avg_fulfillment_latency_ms": self.avg_latency_ms(),
        })
    }
}
