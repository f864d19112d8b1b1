//! Fulfillment engine. Drains the request queue in bounded batches and
//! submits `randomizerCallback` transactions.
//!
//! Each processing tick takes up to `concurrency` requests from the queue
//! head and fulfills them concurrently. Per request:
//!
//! 1. Skip it if the id was already fulfilled or has an attempt in flight.
//! 2. Draw a random number and submit `randomizerCallback(requestId, n)`.
//! 3. On confirmation, record the id as fulfilled.
//! 4. On any failure, put the request back at the queue head.
//!
//! Failed requests are retried on every tick with no attempt limit.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

use crate::chain::{ChainClient, ContractCall};
use crate::dedup::{Claim, DedupTracker};
use crate::metrics::Metrics;
use crate::queue::{RandomnessRequest, RequestQueue};
use crate::randomness::draw_random_number;

/// What happened to one dequeued request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Fulfilled,
    Requeued,
    Skipped,
}

/// Tally of one processing tick.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchReport {
    pub fulfilled: usize,
    pub requeued: usize,
    pub skipped: usize,
    /// The tick found the previous batch still running and did nothing.
    pub overlapped: bool,
}

impl BatchReport {
    fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Fulfilled => self.fulfilled += 1,
            Outcome::Requeued => self.requeued += 1,
            Outcome::Skipped => self.skipped += 1,
        }
    }

    /// Requests taken from the queue by this tick.
    pub fn total(&self) -> usize {
        self.fulfilled + self.requeued + self.skipped
    }
}

/// Resets the run flag when a batch finishes, even if it unwinds.
struct RunGuard<'a>(&'a AtomicBool);

impl<'a> RunGuard<'a> {
    fn try_acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// A claimed request whose attempt has not settled yet. Dropping it without
/// [`Attempt::fulfilled`] releases the claim and puts the request back at the
/// queue head, so a failed or panicked attempt is retried.
struct Attempt<'a> {
    queue: &'a RequestQueue,
    dedup: &'a DedupTracker,
    request: Option<RandomnessRequest>,
}

impl Attempt<'_> {
    fn fulfilled(mut self) {
        if let Some(request) = self.request.take() {
            self.dedup.record_fulfilled(request.request_id);
        }
    }
}

impl Drop for Attempt<'_> {
    fn drop(&mut self) {
        let Some(request) = self.request.take() else {
            return;
        };
        self.dedup.release(request.request_id);
        self.queue.prepend(vec![request]);
    }
}

/// Fulfills one request at a time; shared by the batch's tasks.
struct Worker<C> {
    chain: Arc<C>,
    queue: Arc<RequestQueue>,
    dedup: Arc<DedupTracker>,
    metrics: Arc<Metrics>,
}

impl<C: ChainClient> Worker<C> {
    #[instrument(skip_all, fields(request_id = %request.request_id))]
    async fn fulfill(&self, request: RandomnessRequest) -> Outcome {
        let request_id = request.request_id;

        match self.dedup.try_claim(request_id) {
            Claim::Acquired => {}
            Claim::AlreadyFulfilled => {
                debug!("Request already fulfilled, skipping");
                self.metrics.record_duplicate();
                return Outcome::Skipped;
            }
            Claim::InFlight => {
                debug!("Request already in flight, dropping duplicate");
                self.metrics.record_duplicate();
                return Outcome::Skipped;
            }
        }

        let source_block = request.source_block;
        let source_tx = request.log.transaction_hash;
        let attempt =
            Attempt { queue: &self.queue, dedup: &self.dedup, request: Some(request) };

        let start = Instant::now();
        let random_number = draw_random_number();
        let call = ContractCall::RandomizerCallback { request_id, random_number };

        match self.chain.send_and_confirm(call).await {
            Ok(tx_hash) => {
                attempt.fulfilled();
                let latency_ms = start.elapsed().as_millis() as u64;
                self.metrics.record_fulfillment(latency_ms);
                info!(
                    tx_hash = %tx_hash,
                    random_number,
                    latency_ms,
                    block = ?source_block,
                    "Executed randomizerCallback on the contract"
                );
                Outcome::Fulfilled
            }
            Err(e) => {
                drop(attempt);
                self.metrics.record_requeue();
                error!(
                    error = %e,
                    request_tx = ?source_tx,
                    "Failed to fulfill request, put back at head of queue"
                );
                Outcome::Requeued
            }
        }
    }
}

pub struct FulfillmentProcessor<C> {
    worker: Arc<Worker<C>>,
    queue: Arc<RequestQueue>,
    concurrency: usize,
    permits: Arc<Semaphore>,
    running: AtomicBool,
}

impl<C: ChainClient> FulfillmentProcessor<C> {
    /// `concurrency` bounds both the batch size and the in-flight attempts;
    /// values below 1 are raised to 1.
    pub fn new(
        chain: Arc<C>,
        queue: Arc<RequestQueue>,
        dedup: Arc<DedupTracker>,
        metrics: Arc<Metrics>,
        concurrency: usize,
    ) -> Self {
        let concurrency = concurrency.max(1);
        let worker = Arc::new(Worker { chain, queue: queue.clone(), dedup, metrics });
        Self {
            worker,
            queue,
            concurrency,
            permits: Arc::new(Semaphore::new(concurrency)),
            running: AtomicBool::new(false),
        }
    }

    /// Fulfillment attempts currently holding a concurrency permit.
    pub fn in_flight(&self) -> usize {
        self.concurrency - self.permits.available_permits()
    }

    /// Take up to `concurrency` requests from the queue head and fulfill them.
    ///
    /// A call made while another batch is still running returns immediately
    /// with [`BatchReport::overlapped`] set and leaves the queue untouched.
    pub async fn process_batch(&self) -> BatchReport {
        let mut report = BatchReport::default();

        let Some(_guard) = RunGuard::try_acquire(&self.running) else {
            debug!("Previous batch still running, skipping tick");
            report.overlapped = true;
            return report;
        };

        if self.queue.is_empty() {
            return report;
        }
        let batch = self.queue.take(self.concurrency);
        debug!(size = batch.len(), queued = self.queue.len(), "Processing batch");

        let mut tasks = JoinSet::new();
        for request in batch {
            let permit = match self.permits.clone().acquire_owned().await {
                Ok(p) => p,
                Err(_) => {
                    error!("Semaphore closed, returning request to queue");
                    self.queue.prepend(vec![request]);
                    break;
                }
            };
            let worker = self.worker.clone();

            tasks.spawn(async move {
                let _permit = permit;
                worker.fulfill(request).await
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => report.record(outcome),
                Err(e) => warn!(error = %e, "Fulfillment task aborted, request returned to queue"),
            }
        }

        info!(
            total = report.total(),
            fulfilled = report.fulfilled,
            requeued = report.requeued,
            skipped = report.skipped,
            "Batch processed"
        );
        report
    }
}
