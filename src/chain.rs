//! Chain access for the oracle.
//!
//! Two seams live here:
//!
//! - [`ChainClient`]: request/response access over JSON-RPC: block height,
//!   log queries, gas price, and contract calls that are submitted and then
//!   awaited until mined.
//! - [`EventStreamConnector`]: the persistent websocket side: opens a log
//!   subscription for the contract together with a liveness probe that runs
//!   over the same connection.
//!
//! The alloy-backed implementations ([`AlloyChain`], [`WsEventSource`]) are
//! what the binary runs; tests substitute in-memory doubles.

use std::future::Future;

use alloy::network::{Ethereum, EthereumWallet};
use alloy::primitives::{Address, B256, TxHash, U256};
use alloy::providers::{DynProvider, PendingTransactionBuilder, Provider, ProviderBuilder};
use alloy::rpc::types::{Filter, Log};
use alloy::transports::ws::WsConnect;
use anyhow::Context;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use thiserror::Error;
use tracing::debug;

use crate::config::AppConfig;
use crate::contract::{IRandomizerProxy, REQUEST_FULFILLED_TOPIC, REQUEST_RECEIVED_TOPIC};

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("rpc request failed: {0}")]
    Rpc(#[from] alloy::transports::TransportError),

    #[error("contract call failed: {0}")]
    Contract(#[from] alloy::contract::Error),

    #[error("waiting for transaction failed: {0}")]
    Pending(#[from] alloy::providers::PendingTransactionError),

    #[error("transaction {0} reverted")]
    Reverted(TxHash),

    #[error("connection failed: {0}")]
    Connection(String),
}

/// A state-changing call on the RandomizerProxy contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContractCall {
    RandomizerCallback { request_id: U256, random_number: u64 },
    SetGasPriceWei { value: u128, trigger_fee_recompute: bool },
}

impl ContractCall {
    pub fn name(&self) -> &'static str {
        match self {
            Self::RandomizerCallback { .. } => "randomizerCallback",
            Self::SetGasPriceWei { .. } => "setGasPriceWei",
        }
    }
}

/// Request/response access to the chain and the RandomizerProxy contract.
pub trait ChainClient: Send + Sync + 'static {
    fn latest_block_number(&self) -> impl Future<Output = Result<u64, ChainError>> + Send;

    /// Logs emitted by the contract with the given topic0 in `[from_block, to_block]`.
    fn get_logs(
        &self,
        from_block: u64,
        to_block: u64,
        topic: B256,
    ) -> impl Future<Output = Result<Vec<Log>, ChainError>> + Send;

    fn gas_price(&self) -> impl Future<Output = Result<u128, ChainError>> + Send;

    /// Submit `call` and wait until it is mined. A mined-but-failed receipt is
    /// reported as [`ChainError::Reverted`].
    fn send_and_confirm(
        &self,
        call: ContractCall,
    ) -> impl Future<Output = Result<TxHash, ChainError>> + Send;
}

/// Liveness probe for a live connection. A completed `ping` is the
/// acknowledgment; a ping that never completes means the peer is gone.
pub trait LivenessProbe: Clone + Send + Sync + 'static {
    fn ping(&self) -> impl Future<Output = Result<(), ChainError>> + Send;
}

/// An open log subscription. Dropping it closes the underlying connection.
pub struct LiveConnection<P> {
    pub logs: BoxStream<'static, Log>,
    pub probe: P,
}

/// Opens live log subscriptions on the RandomizerProxy contract.
pub trait EventStreamConnector: Send + Sync + 'static {
    type Probe: LivenessProbe;

    fn connect(
        &self,
    ) -> impl Future<Output = Result<LiveConnection<Self::Probe>, ChainError>> + Send;
}

fn contract_filter(address: Address) -> Filter {
    Filter::new()
        .address(address)
        .event_signature(vec![REQUEST_RECEIVED_TOPIC, REQUEST_FULFILLED_TOPIC])
}

/// JSON-RPC client signing as the operator wallet.
pub struct AlloyChain {
    provider: DynProvider,
    contract: IRandomizerProxy::IRandomizerProxyInstance<DynProvider>,
}

impl AlloyChain {
    pub fn new(config: &AppConfig) -> anyhow::Result<Self> {
        let url = config
            .rpc_url
            .parse()
            .with_context(|| format!("invalid RPC_URL: {}", config.rpc_url))?;
        let wallet = EthereumWallet::from(config.operator_signer.as_ref().clone());

        let provider = match config.chain_id {
            Some(chain_id) => ProviderBuilder::new()
                .with_chain_id(chain_id)
                .wallet(wallet)
                .connect_http(url)
                .erased(),
            None => ProviderBuilder::new().wallet(wallet).connect_http(url).erased(),
        };

        let contract = IRandomizerProxy::new(config.contract_address, provider.clone());
        Ok(Self { provider, contract })
    }

    async fn confirm(
        call: &'static str,
        pending: PendingTransactionBuilder<Ethereum>,
    ) -> Result<TxHash, ChainError> {
        let tx_hash = *pending.tx_hash();
        debug!(call, tx_hash = %tx_hash, "Transaction submitted, waiting for receipt");
        let receipt = pending.get_receipt().await?;
        if !receipt.status() {
            return Err(ChainError::Reverted(receipt.transaction_hash));
        }
        Ok(receipt.transaction_hash)
    }
}

impl ChainClient for AlloyChain {
    async fn latest_block_number(&self) -> Result<u64, ChainError> {
        Ok(self.provider.get_block_number().await?)
    }

    async fn get_logs(
        &self,
        from_block: u64,
        to_block: u64,
        topic: B256,
    ) -> Result<Vec<Log>, ChainError> {
        let filter = Filter::new()
            .address(*self.contract.address())
            .event_signature(topic)
            .from_block(from_block)
            .to_block(to_block);
        Ok(self.provider.get_logs(&filter).await?)
    }

    async fn gas_price(&self) -> Result<u128, ChainError> {
        Ok(self.provider.get_gas_price().await?)
    }

    async fn send_and_confirm(&self, call: ContractCall) -> Result<TxHash, ChainError> {
        let name = call.name();
        let pending = match call {
            ContractCall::RandomizerCallback { request_id, random_number } => {
                self.contract
                    .randomizerCallback(request_id, U256::from(random_number))
                    .send()
                    .await?
            }
            ContractCall::SetGasPriceWei { value, trigger_fee_recompute } => {
                self.contract
                    .setGasPriceWei(U256::from(value), trigger_fee_recompute)
                    .send()
                    .await?
            }
        };
        Self::confirm(name, pending).await
    }
}

/// Websocket log subscription for the contract.
#[derive(Clone)]
pub struct WsEventSource {
    ws_url: String,
    address: Address,
}

impl WsEventSource {
    pub fn new(ws_url: impl Into<String>, address: Address) -> Self {
        Self { ws_url: ws_url.into(), address }
    }
}

/// Probes the websocket with an `eth_blockNumber` round-trip. Holding the
/// provider keeps the connection open.
#[derive(Clone)]
pub struct WsProbe {
    provider: DynProvider,
}

impl LivenessProbe for WsProbe {
    async fn ping(&self) -> Result<(), ChainError> {
        self.provider.get_block_number().await?;
        Ok(())
    }
}

impl EventStreamConnector for WsEventSource {
    type Probe = WsProbe;

    async fn connect(&self) -> Result<LiveConnection<WsProbe>, ChainError> {
        let provider = ProviderBuilder::new()
            .connect_ws(WsConnect::new(self.ws_url.clone()))
            .await
            .map_err(|e| ChainError::Connection(e.to_string()))?
            .erased();

        let subscription = provider.subscribe_logs(&contract_filter(self.address)).await?;

        Ok(LiveConnection {
            logs: subscription.into_stream().boxed(),
            probe: WsProbe { provider },
        })
    }
}
