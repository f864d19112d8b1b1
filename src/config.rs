//! Application configuration loaded from environment variables.
//!
//! Required: `RANDOMIZER_PROXY_ADDRESS`, and one of `OPERATOR_PRIVATE_KEY` /
//!           `OPERATOR_KEY_PATH`
//! Optional: `RPC_URL`, `WS_URL`, `CHAIN_ID`, `BLOCKS_PER_MINUTE`,
//!           `INITIAL_LOOKBACK_MINUTES`, `RECURRING_LOOKBACK_MINUTES`,
//!           `FULFILLMENT_CONCURRENCY`, `DEDUP_RETENTION_MINUTES`, `HTTP_PORT`

use alloy::primitives::Address;
use alloy::signers::local::PrivateKeySigner;
use anyhow::{Context, Result, ensure};
use std::str::FromStr;
use std::sync::Arc;

/// Application configuration for the randomizer oracle.
#[derive(Clone)]
pub struct AppConfig {
    /// JSON-RPC endpoint (HTTP) used for queries and transactions.
    pub rpc_url: String,
    /// Websocket endpoint for the live log subscription.
    pub ws_url: String,
    /// Deployed RandomizerProxy contract.
    pub contract_address: Address,
    /// Operator key that signs fulfillment and gas price transactions.
    pub operator_signer: Arc<PrivateKeySigner>,
    /// Chain id to sign with; fetched from the node when unset.
    pub chain_id: Option<u64>,
    /// Block production estimate used to turn minutes into block ranges.
    pub blocks_per_minute: u64,
    /// Look-back window of the reconciliation run at startup.
    pub initial_lookback_minutes: u64,
    /// Look-back window and interval of the recurring reconciliation.
    pub recurring_lookback_minutes: u64,
    /// Maximum concurrent fulfillment transactions.
    pub fulfillment_concurrency: usize,
    /// How long a fulfilled request id is remembered.
    pub dedup_retention_minutes: u64,
    /// HTTP status server port.
    pub http_port: u16,
}

/// Parse `key` when set, falling back to `default` when it is absent.
/// A value that is present but malformed is an error.
fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(v) => v.trim().parse().with_context(|| format!("invalid {key}: {v}")),
        Err(_) => Ok(default),
    }
}

fn load_operator_key() -> Result<PrivateKeySigner> {
    let raw = match std::env::var("OPERATOR_PRIVATE_KEY") {
        Ok(key) => key,
        Err(_) => {
            let path = std::env::var("OPERATOR_KEY_PATH")
                .context("OPERATOR_PRIVATE_KEY or OPERATOR_KEY_PATH env var must be set")?;
            let path = shellexpand::tilde(&path).to_string();
            std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read operator key from {path}"))?
        }
    };

    PrivateKeySigner::from_str(raw.trim()).context("invalid operator private key")
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let rpc_url = std::env::var("RPC_URL").unwrap_or_else(|_| "http://127.0.0.1:8545".into());
        let ws_url = std::env::var("WS_URL").unwrap_or_else(|_| "ws://127.0.0.1:8546".into());

        let address_str = std::env::var("RANDOMIZER_PROXY_ADDRESS")
            .context("RANDOMIZER_PROXY_ADDRESS env var must be set")?;
        let contract_address = Address::from_str(&address_str)
            .with_context(|| format!("invalid RANDOMIZER_PROXY_ADDRESS: {address_str}"))?;

        let operator_signer = load_operator_key()?;

        let chain_id = match std::env::var("CHAIN_ID") {
            Ok(v) => Some(v.trim().parse().with_context(|| format!("invalid CHAIN_ID: {v}"))?),
            Err(_) => None,
        };

        let config = Self {
            rpc_url,
            ws_url,
            contract_address,
            operator_signer: Arc::new(operator_signer),
            chain_id,
            blocks_per_minute: env_or("BLOCKS_PER_MINUTE", 30)?,
            initial_lookback_minutes: env_or("INITIAL_LOOKBACK_MINUTES", 60)?,
            recurring_lookback_minutes: env_or("RECURRING_LOOKBACK_MINUTES", 5)?,
            fulfillment_concurrency: env_or("FULFILLMENT_CONCURRENCY", 4)?,
            dedup_retention_minutes: env_or("DEDUP_RETENTION_MINUTES", 30)?,
            http_port: env_or("HTTP_PORT", 8080)?,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        ensure!(self.fulfillment_concurrency >= 1, "FULFILLMENT_CONCURRENCY must be at least 1");
        ensure!(self.blocks_per_minute >= 1, "BLOCKS_PER_MINUTE must be at least 1");
        ensure!(self.dedup_retention_minutes >= 1, "DEDUP_RETENTION_MINUTES must be at least 1");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> AppConfig {
        AppConfig {
            rpc_url: "http://127.0.0.1:8545".into(),
            ws_url: "ws://127.0.0.1:8546".into(),
            contract_address: Address::ZERO,
            operator_signer: Arc::new(PrivateKeySigner::random()),
            chain_id: None,
            blocks_per_minute: 30,
            initial_lookback_minutes: 60,
            recurring_lookback_minutes: 5,
            fulfillment_concurrency: 4,
            dedup_retention_minutes: 30,
            http_port: 8080,
        }
    }

    #[test]
    fn env_or_uses_default_only_when_unset() {
        assert_eq!(env_or("RANDOMIZER_ORACLE_TEST_UNSET_VAR", 17u64).unwrap(), 17);

        // SAFETY: no other test reads these variables.
        unsafe {
            std::env::set_var("RANDOMIZER_ORACLE_TEST_NUMBER", " 42 ");
            std::env::set_var("RANDOMIZER_ORACLE_TEST_GARBAGE", "5m");
        }
        assert_eq!(env_or("RANDOMIZER_ORACLE_TEST_NUMBER", 1u64).unwrap(), 42);

        let err = env_or("RANDOMIZER_ORACLE_TEST_GARBAGE", 5u64).unwrap_err();
        assert!(format!("{err:#}").contains("invalid RANDOMIZER_ORACLE_TEST_GARBAGE: 5m"));
    }

    #[test]
    fn from_env_rejects_malformed_concurrency() {
        let key = alloy::hex::encode(PrivateKeySigner::random().to_bytes());
        // SAFETY: the only test that calls `from_env` or sets these variables.
        unsafe {
            std::env::set_var("RANDOMIZER_PROXY_ADDRESS", Address::ZERO.to_string());
            std::env::set_var("OPERATOR_PRIVATE_KEY", key);
            std::env::set_var("FULFILLMENT_CONCURRENCY", "four");
        }

        let err = AppConfig::from_env().err().expect("malformed concurrency accepted");
        assert!(format!("{err:#}").contains("invalid FULFILLMENT_CONCURRENCY: four"));

        unsafe { std::env::set_var("FULFILLMENT_CONCURRENCY", "3") };
        let config = AppConfig::from_env().unwrap();
        assert_eq!(config.fulfillment_concurrency, 3);
    }

    #[test]
    fn rejects_zero_concurrency() {
        let mut config = valid_config();
        assert!(config.validate().is_ok());

        config.fulfillment_concurrency = 0;
        assert!(config.validate().is_err());
    }
}
