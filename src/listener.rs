//! On-chain event ingestion for the RandomizerProxy contract.
//!
//! Two complementary producers feed the [`RequestQueue`]:
//!
//! 1. **Live stream** ([`LiveListener`]): subscribes to the contract's logs
//!    over a websocket, keeps the connection honest with a liveness probe,
//!    and reconnects forever after any close.
//!
//! 2. **Reconciliation** ([`Reconciler`]): re-reads a recent block range
//!    over JSON-RPC and enqueues every `RequestReceived` without a matching
//!    `RequestFulfilled`. Covers downtime at startup and messages the live
//!    stream missed afterwards.
//!
//! Both paths may enqueue the same request; the fulfiller deduplicates.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::U256;
use alloy::rpc::types::Log;
use anyhow::{Context, Result};
use futures_util::StreamExt;
use futures_util::stream::FuturesUnordered;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::chain::{ChainClient, EventStreamConnector, LiveConnection, LivenessProbe};
use crate::contract::{REQUEST_FULFILLED_TOPIC, REQUEST_RECEIVED_TOPIC, RandomizerEvent, parse_log};
use crate::metrics::Metrics;
use crate::queue::{RandomnessRequest, RequestQueue};

/// Interval between liveness probes on an open connection.
pub const PROBE_INTERVAL: Duration = Duration::from_millis(7_500);
/// A probe not acknowledged within this bound marks the connection dead.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(15);
/// Delay before reconnecting after a connection closes.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(3);

/// Lifecycle of the live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Tearing down a closed connection before the reconnect backoff.
    Draining,
}

/// Why a connected session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    ConnectFailed,
    StreamClosed,
    ProbeFailed,
    ProbeTimedOut,
    Shutdown,
}

pub struct LiveListener<S> {
    connector: S,
    queue: Arc<RequestQueue>,
    metrics: Arc<Metrics>,
    state: watch::Sender<ConnectionState>,
}

impl<S: EventStreamConnector> LiveListener<S> {
    pub fn new(connector: S, queue: Arc<RequestQueue>, metrics: Arc<Metrics>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self { connector, queue, metrics, state }
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Receiver notified on every state transition.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    fn transition(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(from = ?previous, to = ?next, "Live connection state changed");
        }
    }

    /// Keep a live subscription open until `cancel` fires, reconnecting after
    /// every close.
    pub async fn run(&self, cancel: CancellationToken) {
        loop {
            self.transition(ConnectionState::Connecting);
            info!("Connecting to websocket");

            let end = tokio::select! {
                _ = cancel.cancelled() => SessionEnd::Shutdown,
                connected = self.connector.connect() => match connected {
                    Ok(mut connection) => {
                        self.transition(ConnectionState::Connected);
                        info!("Websocket connected, subscribed to contract logs");
                        let end = self.drive(&mut connection, &cancel).await;
                        self.transition(ConnectionState::Draining);
                        drop(connection);
                        end
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to connect to websocket");
                        SessionEnd::ConnectFailed
                    }
                },
            };

            self.transition(ConnectionState::Disconnected);

            if end == SessionEnd::Shutdown {
                info!("Live listener stopped");
                return;
            }
            self.metrics.record_reconnect();

            info!(
                delay = ?RECONNECT_DELAY,
                reason = ?end,
                "Websocket closed, reconnecting shortly"
            );
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Live listener stopped");
                    return;
                }
                _ = tokio::time::sleep(RECONNECT_DELAY) => {}
            }
        }
    }

    async fn drive(
        &self,
        connection: &mut LiveConnection<S::Probe>,
        cancel: &CancellationToken,
    ) -> SessionEnd {
        let mut keepalive =
            tokio::time::interval_at(Instant::now() + PROBE_INTERVAL, PROBE_INTERVAL);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut probes = FuturesUnordered::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return SessionEnd::Shutdown,

                _ = keepalive.tick() => {
                    let probe = connection.probe.clone();
                    probes.push(async move {
                        tokio::time::timeout(PROBE_TIMEOUT, probe.ping()).await
                    });
                }

                Some(outcome) = probes.next(), if !probes.is_empty() => match outcome {
                    Ok(Ok(())) => debug!("Liveness probe acknowledged"),
                    Ok(Err(e)) => {
                        warn!(error = %e, "Liveness probe failed, closing websocket");
                        return SessionEnd::ProbeFailed;
                    }
                    Err(_) => {
                        info!(
                            timeout = ?PROBE_TIMEOUT,
                            "No probe acknowledgment, closing websocket"
                        );
                        return SessionEnd::ProbeTimedOut;
                    }
                },

                log = connection.logs.next() => match log {
                    Some(log) => self.handle_log(log),
                    None => {
                        warn!("Websocket stream ended");
                        return SessionEnd::StreamClosed;
                    }
                },
            }
        }
    }

    fn handle_log(&self, log: Log) {
        match parse_log(&log) {
            Ok(RandomizerEvent::RequestReceived { request_id }) => {
                self.queue.append([RandomnessRequest::from_log(request_id, log)]);
                self.metrics.record_live_request();
                info!(
                    request_id = %request_id,
                    source = "websocket",
                    event = "RequestReceived",
                    "Queued randomness request"
                );
            }
            Ok(RandomizerEvent::RequestFulfilled { request_id, random_number }) => {
                info!(
                    request_id = %request_id,
                    random_number = %random_number,
                    source = "websocket",
                    event = "RequestFulfilled",
                    "Observed fulfillment"
                );
            }
            Err(e) => {
                warn!(
                    error = %e,
                    tx = ?log.transaction_hash,
                    "Failed to parse contract log, dropping"
                );
            }
        }
    }
}

/// Enqueues unfulfilled requests found in recent block history.
pub struct Reconciler<C> {
    chain: Arc<C>,
    queue: Arc<RequestQueue>,
    metrics: Arc<Metrics>,
    blocks_per_minute: u64,
}

impl<C: ChainClient> Reconciler<C> {
    pub fn new(
        chain: Arc<C>,
        queue: Arc<RequestQueue>,
        metrics: Arc<Metrics>,
        blocks_per_minute: u64,
    ) -> Self {
        Self { chain, queue, metrics, blocks_per_minute }
    }

    /// First block covered by a `lookback_minutes` window ending at `latest`.
    ///
    /// One extra minute of blocks is included to absorb block time jitter.
    pub fn window_start(&self, latest: u64, lookback_minutes: u64) -> u64 {
        let span = lookback_minutes.saturating_add(1).saturating_mul(self.blocks_per_minute);
        latest.saturating_sub(span)
    }

    /// Scan the last `lookback_minutes` of blocks and enqueue every request
    /// that has no fulfillment in that range. Returns the number enqueued.
    #[instrument(skip(self))]
    pub async fn reconcile(&self, lookback_minutes: u64) -> Result<usize> {
        if lookback_minutes == 0 {
            return Ok(0);
        }

        let latest = self
            .chain
            .latest_block_number()
            .await
            .context("failed to fetch latest block number")?;
        let from = self.window_start(latest, lookback_minutes);

        let received = self
            .chain
            .get_logs(from, latest, REQUEST_RECEIVED_TOPIC)
            .await
            .context("failed to fetch RequestReceived logs")?;
        let fulfilled = self
            .chain
            .get_logs(from, latest, REQUEST_FULFILLED_TOPIC)
            .await
            .context("failed to fetch RequestFulfilled logs")?;

        let fulfilled_ids: HashSet<U256> = fulfilled
            .iter()
            .filter_map(|log| match parse_log(log) {
                Ok(RandomizerEvent::RequestFulfilled { request_id, .. }) => Some(request_id),
                Ok(other) => {
                    debug!(
                        request_id = %other.request_id(),
                        "Unexpected event in RequestFulfilled query"
                    );
                    None
                }
                Err(e) => {
                    warn!(error = %e, "Failed to parse RequestFulfilled log, skipping");
                    None
                }
            })
            .collect();

        let mut pending = Vec::new();
        for log in received {
            let request_id = match parse_log(&log) {
                Ok(RandomizerEvent::RequestReceived { request_id }) => request_id,
                Ok(other) => {
                    debug!(
                        request_id = %other.request_id(),
                        "Unexpected event in RequestReceived query"
                    );
                    continue;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to parse RequestReceived log, skipping");
                    continue;
                }
            };
            if fulfilled_ids.contains(&request_id) {
                continue;
            }
            info!(
                request_id = %request_id,
                source = "rpc",
                event = "RequestReceived",
                "Queued unfulfilled request"
            );
            pending.push(RandomnessRequest::from_log(request_id, log));
        }

        let count = pending.len();
        self.queue.append(pending);
        self.metrics.record_reconciled_requests(count as u64);

        debug!(
            from,
            to = latest,
            fulfilled = fulfilled_ids.len(),
            enqueued = count,
            "Reconciliation done"
        );
        Ok(count)
    }
}
