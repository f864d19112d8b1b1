//! Gas price injection into the RandomizerProxy contract.
//!
//! The contract estimates its callback fee from a gas price the oracle
//! pushes with `setGasPriceWei`. Every push costs a transaction, so the
//! governor reacts to increases immediately but holds back decreases for
//! [`DECREASE_HOLD`] after the previous push.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::chain::{ChainClient, ContractCall};
use crate::metrics::Metrics;

/// Multiplier applied to the network gas price before injecting it.
pub const GAS_PRICE_MULTIPLIER: u128 = 2;
/// Minimum time between a push and a following lower push.
pub const DECREASE_HOLD: Duration = Duration::from_secs(2 * 60 * 60);

/// Last gas price confirmed on the contract.
#[derive(Debug, Clone, Copy, Default)]
pub struct GasPriceState {
    pub last_injected_gas_price: Option<u128>,
    pub last_injected_at: Option<Instant>,
}

/// Result of comparing a candidate price against [`GasPriceState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Same value as the last push.
    Unchanged,
    /// Lower than the last push, which is too recent.
    HoldDecrease,
    Inject,
}

impl GasPriceState {
    /// Decide whether `candidate` should be pushed at `now`.
    ///
    /// Increases always go through. A decrease waits until [`DECREASE_HOLD`]
    /// has passed since the previous push.
    pub fn decide(&self, candidate: u128, now: Instant) -> Decision {
        let Some(last) = self.last_injected_gas_price else {
            return Decision::Inject;
        };
        if candidate == last {
            return Decision::Unchanged;
        }
        let recent = self
            .last_injected_at
            .is_some_and(|at| now.saturating_duration_since(at) < DECREASE_HOLD);
        if candidate < last && recent {
            return Decision::HoldDecrease;
        }
        Decision::Inject
    }
}

pub struct GasPriceGovernor<C> {
    chain: Arc<C>,
    metrics: Arc<Metrics>,
    state: Mutex<GasPriceState>,
}

impl<C: ChainClient> GasPriceGovernor<C> {
    /// Create a governor that has not injected anything yet.
    pub fn new(chain: Arc<C>, metrics: Arc<Metrics>) -> Self {
        Self { chain, metrics, state: Mutex::new(GasPriceState::default()) }
    }

    #[cfg(test)]
    pub async fn state(&self) -> GasPriceState {
        *self.state.lock().await
    }

    /// Read the network gas price and push it to the contract when the
    /// policy allows. Returns the injected value, if any.
    ///
    /// Injections are serialized; state only changes after confirmation.
    pub async fn inject_gas_price(&self) -> Result<Option<u128>> {
        let mut state = self.state.lock().await;

        let network = self.chain.gas_price().await.context("failed to fetch gas price")?;
        let gas_price_wei = network.saturating_mul(GAS_PRICE_MULTIPLIER);

        match state.decide(gas_price_wei, Instant::now()) {
            Decision::Unchanged => {
                debug!(gas_price_wei, "Gas price unchanged, not injecting");
                return Ok(None);
            }
            Decision::HoldDecrease => {
                debug!(
                    gas_price_wei,
                    last = ?state.last_injected_gas_price,
                    "Gas price decreased within hold window, not injecting"
                );
                return Ok(None);
            }
            Decision::Inject => {}
        }

        let tx_hash = self
            .chain
            .send_and_confirm(ContractCall::SetGasPriceWei {
                value: gas_price_wei,
                trigger_fee_recompute: true,
            })
            .await
            .context("setGasPriceWei failed")?;

        *state = GasPriceState {
            last_injected_gas_price: Some(gas_price_wei),
            last_injected_at: Some(Instant::now()),
        };
        self.metrics.record_gas_injection();
        info!(gas_price_wei, tx_hash = %tx_hash, "Executed setGasPriceWei on the contract");
        Ok(Some(gas_price_wei))
    }
}
