//! Startup sequencing and supervision of the oracle's recurring tasks.
//!
//! Startup order:
//!
//! 1. Start the live listener and wait for its first connection attempt.
//! 2. Run the initial reconciliation over the long look-back window.
//! 3. Register the recurring tasks: processing, gas injection,
//!    reconciliation and dedup eviction.
//!
//! Every recurring task runs in its own loop. An invocation that fails or
//! panics is logged and the next tick still fires; a slow invocation delays
//! the next tick instead of overlapping with it.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::FutureExt;
use serde::Serialize;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::chain::{ChainClient, EventStreamConnector};
use crate::config::AppConfig;
use crate::dedup::DedupTracker;
use crate::fulfiller::{BatchReport, FulfillmentProcessor};
use crate::gas::GasPriceGovernor;
use crate::listener::{ConnectionState, LiveListener, Reconciler};
use crate::metrics::Metrics;
use crate::queue::RequestQueue;

pub const PROCESSING_INTERVAL: Duration = Duration::from_secs(2);
pub const GAS_INJECTION_INTERVAL: Duration = Duration::from_secs(10 * 60);
pub const DEDUP_EVICTION_INTERVAL: Duration = Duration::from_secs(10 * 60);

fn minutes(n: u64) -> Duration {
    Duration::from_secs(n.saturating_mul(60))
}

/// Timing knobs of the pipeline.
#[derive(Debug, Clone)]
pub struct Schedule {
    pub processing_interval: Duration,
    pub gas_injection_interval: Duration,
    pub dedup_eviction_interval: Duration,
    pub dedup_retention: Duration,
    pub initial_lookback_minutes: u64,
    /// Look-back window and interval of the recurring reconciliation; 0 disables it.
    pub recurring_lookback_minutes: u64,
}

impl Schedule {
    /// Fixed intervals plus the configured windows.
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            processing_interval: PROCESSING_INTERVAL,
            gas_injection_interval: GAS_INJECTION_INTERVAL,
            dedup_eviction_interval: DEDUP_EVICTION_INTERVAL,
            dedup_retention: minutes(config.dedup_retention_minutes),
            initial_lookback_minutes: config.initial_lookback_minutes,
            recurring_lookback_minutes: config.recurring_lookback_minutes,
        }
    }
}

/// Run `task` every `period` until `cancel` fires.
///
/// With `run_immediately` the first invocation happens right away, otherwise
/// after one period. Each invocation is awaited before the next tick; errors
/// and panics are logged and do not stop the loop.
pub fn spawn_recurring<F, Fut>(
    tasks: &mut JoinSet<()>,
    name: &'static str,
    period: Duration,
    run_immediately: bool,
    cancel: CancellationToken,
    mut task: F,
) where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    tasks.spawn(async move {
        let start = if run_immediately { Instant::now() } else { Instant::now() + period };
        let mut ticker = tokio::time::interval_at(start, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(task = name, period = ?period, "Registered recurring task");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                outcome = AssertUnwindSafe(task()).catch_unwind() => match outcome {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        error!(task = name, error = %format!("{e:#}"), "Recurring task failed")
                    }
                    Err(_) => error!(task = name, "Recurring task panicked"),
                },
            }
        }

        info!(task = name, "Recurring task stopped");
    });
}

/// Snapshot served by the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct OracleStatus {
    pub connection: ConnectionState,
    pub queued_requests: usize,
    pub in_flight_fulfillments: usize,
    pub recently_fulfilled: usize,
}

/// Owns the pipeline state and every component built on it.
pub struct Oracle<C, S> {
    queue: Arc<RequestQueue>,
    dedup: Arc<DedupTracker>,
    metrics: Arc<Metrics>,
    listener: Arc<LiveListener<S>>,
    reconciler: Arc<Reconciler<C>>,
    processor: Arc<FulfillmentProcessor<C>>,
    governor: Arc<GasPriceGovernor<C>>,
    schedule: Schedule,
}

impl<C: ChainClient, S: EventStreamConnector> Oracle<C, S> {
    pub fn new(
        chain: Arc<C>,
        connector: S,
        metrics: Arc<Metrics>,
        blocks_per_minute: u64,
        concurrency: usize,
        schedule: Schedule,
    ) -> Self {
        let queue = Arc::new(RequestQueue::new());
        let dedup = Arc::new(DedupTracker::new(schedule.dedup_retention));

        let listener = Arc::new(LiveListener::new(connector, queue.clone(), metrics.clone()));
        let reconciler = Arc::new(Reconciler::new(
            chain.clone(),
            queue.clone(),
            metrics.clone(),
            blocks_per_minute,
        ));
        let processor = Arc::new(FulfillmentProcessor::new(
            chain.clone(),
            queue.clone(),
            dedup.clone(),
            metrics.clone(),
            concurrency,
        ));
        let governor = Arc::new(GasPriceGovernor::new(chain, metrics.clone()));

        Self { queue, dedup, metrics, listener, reconciler, processor, governor, schedule }
    }

    /// Counters shared by every component.
    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Point-in-time view of the pipeline for the status endpoint.
    pub fn status(&self) -> OracleStatus {
        OracleStatus {
            connection: self.listener.state(),
            queued_requests: self.queue.len(),
            in_flight_fulfillments: self.processor.in_flight(),
            recently_fulfilled: self.dedup.len(),
        }
    }

    /// Keep the live subscription running until `cancel` fires.
    pub async fn ingest_live(&self, cancel: CancellationToken) {
        self.listener.run(cancel).await;
    }

    /// Enqueue unfulfilled requests from the last `lookback_minutes`.
    pub async fn reconcile(&self, lookback_minutes: u64) -> Result<usize> {
        self.reconciler.reconcile(lookback_minutes).await
    }

    /// Run one fulfillment batch from the queue head.
    pub async fn process_batch(&self) -> BatchReport {
        self.processor.process_batch().await
    }

    /// Push the doubled network gas price to the contract when the hold
    /// policy allows. Returns the injected value, if any.
    pub async fn inject_gas_price(&self) -> Result<Option<u128>> {
        self.governor.inject_gas_price().await
    }

    /// Drop completion records older than `retention_minutes`.
    pub fn evict_expired_dedup(&self, retention_minutes: u64) -> usize {
        let evicted = self.dedup.evict_older_than(minutes(retention_minutes));
        if evicted > 0 {
            info!(evicted, remaining = self.dedup.len(), "Evicted expired dedup records");
        }
        evicted
    }

    /// Start the pipeline and supervise it until `cancel` fires.
    ///
    /// Fails only if the live listener could not be started.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        let mut tasks = JoinSet::new();

        let mut state = self.listener.subscribe_state();
        {
            let oracle = self.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move { oracle.ingest_live(cancel).await });
        }
        state
            .wait_for(|s| *s != ConnectionState::Disconnected)
            .await
            .map(|_| ())
            .context("live listener exited before its first connection attempt")?;

        info!(lookback_minutes = self.schedule.initial_lookback_minutes, "Initial reconciliation");
        match self.reconcile(self.schedule.initial_lookback_minutes).await {
            Ok(count) => info!(enqueued = count, "Initial reconciliation done"),
            Err(e) => error!(error = %format!("{e:#}"), "Initial reconciliation failed"),
        }

        self.register_recurring(&mut tasks, &cancel);

        cancel.cancelled().await;
        info!("Shutting down oracle tasks");
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "Oracle task ended abnormally");
            }
        }
        Ok(())
    }

    fn register_recurring(self: &Arc<Self>, tasks: &mut JoinSet<()>, cancel: &CancellationToken) {
        let schedule = self.schedule.clone();

        let oracle = self.clone();
        spawn_recurring(
            tasks,
            "process_requests",
            schedule.processing_interval,
            true,
            cancel.clone(),
            move || {
                let oracle = oracle.clone();
                async move {
                    oracle.process_batch().await;
                    Ok(())
                }
            },
        );

        let oracle = self.clone();
        spawn_recurring(
            tasks,
            "inject_gas_price",
            schedule.gas_injection_interval,
            true,
            cancel.clone(),
            move || {
                let oracle = oracle.clone();
                async move { oracle.inject_gas_price().await.map(|_| ()) }
            },
        );

        let lookback = schedule.recurring_lookback_minutes;
        if lookback > 0 {
            let oracle = self.clone();
            spawn_recurring(tasks, "reconcile", minutes(lookback), false, cancel.clone(), move || {
                let oracle = oracle.clone();
                async move { oracle.reconcile(lookback).await.map(|_| ()) }
            });
        } else {
            warn!("Recurring reconciliation disabled");
        }

        let retention_minutes = self.dedup.retention().as_secs() / 60;
        let oracle = self.clone();
        spawn_recurring(
            tasks,
            "evict_dedup",
            schedule.dedup_eviction_interval,
            false,
            cancel.clone(),
            move || {
                let oracle = oracle.clone();
                async move {
                    oracle.evict_expired_dedup(retention_minutes);
                    Ok(())
                }
            },
        );
    }
}
