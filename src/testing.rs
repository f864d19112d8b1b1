//! In-memory chain and event stream doubles for unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use alloy::primitives::{Address, B256, TxHash, U256};
use alloy::rpc::types::Log;
use alloy::sol_types::SolEvent;
use futures_util::StreamExt;
use tokio::sync::mpsc;

use crate::chain::{
    ChainClient, ChainError, ContractCall, EventStreamConnector, LiveConnection, LivenessProbe,
};
use crate::contract::IRandomizerProxy;
use crate::queue::RandomnessRequest;

pub fn received_log(request_id: u64, block: u64) -> Log {
    let event = IRandomizerProxy::RequestReceived { requestId: U256::from(request_id) };
    Log {
        inner: alloy::primitives::Log { address: Address::ZERO, data: event.encode_log_data() },
        block_number: Some(block),
        ..Default::default()
    }
}

pub fn fulfilled_log(request_id: u64, random_number: u64, block: u64) -> Log {
    let event = IRandomizerProxy::RequestFulfilled {
        requestId: U256::from(request_id),
        randomNumber: U256::from(random_number),
    };
    Log {
        inner: alloy::primitives::Log { address: Address::ZERO, data: event.encode_log_data() },
        block_number: Some(block),
        ..Default::default()
    }
}

pub fn request(request_id: u64) -> RandomnessRequest {
    RandomnessRequest::from_log(U256::from(request_id), received_log(request_id, 100))
}

/// Names of mock calls in the order they were made, shared across doubles.
pub type Journal = Arc<Mutex<Vec<&'static str>>>;

fn note(journal: &Mutex<Option<Journal>>, call: &'static str) {
    if let Some(journal) = journal.lock().unwrap().as_ref() {
        journal.lock().unwrap().push(call);
    }
}

fn tx_hash(n: usize) -> TxHash {
    TxHash::from(U256::from(n + 1).to_be_bytes::<32>())
}

/// Scriptable [`ChainClient`].
#[derive(Default)]
pub struct MockChain {
    pub block_number: Mutex<u64>,
    pub logs: Mutex<HashMap<B256, Vec<Log>>>,
    pub gas_price: Mutex<u128>,
    /// Request ids whose fulfillment fails.
    pub failing: Mutex<HashSet<U256>>,
    /// Request ids whose next fulfillment attempt panics.
    pub panicking: Mutex<HashSet<U256>>,
    pub fail_gas_injection: AtomicBool,
    pub fail_block_number: AtomicBool,
    /// How long `send_and_confirm` takes to confirm.
    pub confirm_delay: Mutex<Duration>,
    /// Every call passed to `send_and_confirm`, in submission order.
    pub submitted: Mutex<Vec<ContractCall>>,
    /// Calls that confirmed successfully.
    pub confirmed: Mutex<Vec<ContractCall>>,
    /// `(from, to, topic)` of every log query.
    pub log_queries: Mutex<Vec<(u64, u64, B256)>>,
    /// How long each log query takes.
    pub log_delay: Mutex<Duration>,
    journal: Mutex<Option<Journal>>,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
}

impl MockChain {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record_into(&self, journal: Journal) {
        *self.journal.lock().unwrap() = Some(journal);
    }

    pub fn set_logs(&self, topic: B256, logs: Vec<Log>) {
        self.logs.lock().unwrap().insert(topic, logs);
    }

    pub fn fail_request(&self, request_id: u64) {
        self.failing.lock().unwrap().insert(U256::from(request_id));
    }

    pub fn panic_once(&self, request_id: u64) {
        self.panicking.lock().unwrap().insert(U256::from(request_id));
    }

    pub fn heal_request(&self, request_id: u64) {
        self.failing.lock().unwrap().remove(&U256::from(request_id));
    }

    /// Request ids in the order their fulfillment was attempted.
    pub fn attempted_ids(&self) -> Vec<U256> {
        callback_ids(&self.submitted.lock().unwrap())
    }

    pub fn fulfilled_ids(&self) -> Vec<U256> {
        callback_ids(&self.confirmed.lock().unwrap())
    }

    pub fn gas_injections(&self) -> Vec<u128> {
        self.confirmed
            .lock()
            .unwrap()
            .iter()
            .filter_map(|call| match call {
                ContractCall::SetGasPriceWei { value, .. } => Some(*value),
                _ => None,
            })
            .collect()
    }
}

fn callback_ids(calls: &[ContractCall]) -> Vec<U256> {
    calls
        .iter()
        .filter_map(|call| match call {
            ContractCall::RandomizerCallback { request_id, .. } => Some(*request_id),
            _ => None,
        })
        .collect()
}

impl ChainClient for MockChain {
    async fn latest_block_number(&self) -> Result<u64, ChainError> {
        note(&self.journal, "latest_block_number");
        if self.fail_block_number.load(Ordering::SeqCst) {
            return Err(ChainError::Connection("node unavailable".into()));
        }
        Ok(*self.block_number.lock().unwrap())
    }

    async fn get_logs(
        &self,
        from_block: u64,
        to_block: u64,
        topic: B256,
    ) -> Result<Vec<Log>, ChainError> {
        note(&self.journal, "get_logs");
        self.log_queries.lock().unwrap().push((from_block, to_block, topic));
        let delay = *self.log_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(self.logs.lock().unwrap().get(&topic).cloned().unwrap_or_default())
    }

    async fn gas_price(&self) -> Result<u128, ChainError> {
        note(&self.journal, "gas_price");
        Ok(*self.gas_price.lock().unwrap())
    }

    async fn send_and_confirm(&self, call: ContractCall) -> Result<TxHash, ChainError> {
        note(&self.journal, "send_and_confirm");
        let index = {
            let mut submitted = self.submitted.lock().unwrap();
            submitted.push(call.clone());
            submitted.len()
        };

        if let ContractCall::RandomizerCallback { request_id, .. } = &call {
            let panics = self.panicking.lock().unwrap().remove(request_id);
            if panics {
                panic!("node client crashed while submitting {request_id}");
            }
        }

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let delay = *self.confirm_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let failed = match &call {
            ContractCall::RandomizerCallback { request_id, .. } => {
                self.failing.lock().unwrap().contains(request_id)
            }
            ContractCall::SetGasPriceWei { .. } => self.fail_gas_injection.load(Ordering::SeqCst),
        };
        if failed {
            return Err(ChainError::Reverted(tx_hash(index)));
        }

        self.confirmed.lock().unwrap().push(call);
        Ok(tx_hash(index))
    }
}

/// How a [`MockProbe`] answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeMode {
    Acknowledge,
    /// Never answers.
    Silent,
    /// Answers with an error.
    Fail,
}

#[derive(Clone)]
pub struct MockProbe {
    mode: ProbeMode,
}

impl LivenessProbe for MockProbe {
    async fn ping(&self) -> Result<(), ChainError> {
        match self.mode {
            ProbeMode::Acknowledge => Ok(()),
            ProbeMode::Silent => std::future::pending().await,
            ProbeMode::Fail => Err(ChainError::Connection("socket reset".into())),
        }
    }
}

/// Scriptable [`EventStreamConnector`]. Each successful connect hands out a
/// fresh log channel; the test pushes logs through [`MockConnector::push`].
pub struct MockConnector {
    pub connects: AtomicUsize,
    probe_mode: ProbeMode,
    fail_connect: AtomicBool,
    sender: Mutex<Option<mpsc::UnboundedSender<Log>>>,
    journal: Mutex<Option<Journal>>,
}

impl MockConnector {
    /// Connector whose probes acknowledge when `responsive`, else never answer.
    pub fn new(responsive: bool) -> Arc<Self> {
        Self::with_probe(if responsive { ProbeMode::Acknowledge } else { ProbeMode::Silent })
    }

    pub fn with_probe(probe_mode: ProbeMode) -> Arc<Self> {
        Arc::new(Self {
            connects: AtomicUsize::new(0),
            probe_mode,
            fail_connect: AtomicBool::new(false),
            sender: Mutex::new(None),
            journal: Mutex::new(None),
        })
    }

    pub fn record_into(&self, journal: Journal) {
        *self.journal.lock().unwrap() = Some(journal);
    }

    pub fn set_fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Deliver a log on the current connection.
    pub fn push(&self, log: Log) {
        if let Some(sender) = self.sender.lock().unwrap().as_ref() {
            let _ = sender.send(log);
        }
    }

    /// End the current connection's stream.
    pub fn close(&self) {
        self.sender.lock().unwrap().take();
    }
}

impl EventStreamConnector for Arc<MockConnector> {
    type Probe = MockProbe;

    async fn connect(&self) -> Result<LiveConnection<MockProbe>, ChainError> {
        note(&self.journal, "connect");
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(ChainError::Connection("refused".into()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        *self.sender.lock().unwrap() = Some(tx);
        Ok(LiveConnection {
            logs: futures_util::stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|log| (log, rx))
            })
            .boxed(),
            probe: MockProbe { mode: self.probe_mode },
        })
    }
}
