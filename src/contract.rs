//! ABI bindings for the RandomizerProxy contract and log decoding.
//!
//! Only the surface the oracle touches is declared: the two request
//! lifecycle events and the two operator functions.

use alloy::primitives::{B256, U256};
use alloy::rpc::types::Log;
use alloy::sol;
use alloy::sol_types::SolEvent;
use thiserror::Error;

sol! {
    #[sol(rpc)]
    #[derive(Debug)]
    interface IRandomizerProxy {
        event RequestReceived(uint256 indexed requestId);
        event RequestFulfilled(uint256 indexed requestId, uint256 randomNumber);

        function setGasPriceWei(uint256 value, bool triggerFeeRecompute) external;
        function randomizerCallback(uint256 requestId, uint256 randomNumber) external;
    }
}

/// Topic0 of `RequestReceived(uint256)`.
pub const REQUEST_RECEIVED_TOPIC: B256 = IRandomizerProxy::RequestReceived::SIGNATURE_HASH;
/// Topic0 of `RequestFulfilled(uint256,uint256)`.
pub const REQUEST_FULFILLED_TOPIC: B256 = IRandomizerProxy::RequestFulfilled::SIGNATURE_HASH;

/// A decoded RandomizerProxy event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RandomizerEvent {
    RequestReceived { request_id: U256 },
    RequestFulfilled { request_id: U256, random_number: U256 },
}

impl RandomizerEvent {
    pub fn request_id(&self) -> U256 {
        match self {
            Self::RequestReceived { request_id } | Self::RequestFulfilled { request_id, .. } => {
                *request_id
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum EventError {
    #[error("log has no topics")]
    MissingTopic,

    #[error("unknown event topic {0}")]
    UnknownTopic(B256),

    #[error("failed to decode event: {0}")]
    Decode(#[from] alloy::sol_types::Error),
}

/// Decode a raw log emitted by the RandomizerProxy contract.
pub fn parse_log(log: &Log) -> Result<RandomizerEvent, EventError> {
    let topic = *log.topic0().ok_or(EventError::MissingTopic)?;

    if topic == REQUEST_RECEIVED_TOPIC {
        let decoded = log.log_decode::<IRandomizerProxy::RequestReceived>()?;
        return Ok(RandomizerEvent::RequestReceived {
            request_id: decoded.inner.data.requestId,
        });
    }

    if topic == REQUEST_FULFILLED_TOPIC {
        let decoded = log.log_decode::<IRandomizerProxy::RequestFulfilled>()?;
        return Ok(RandomizerEvent::RequestFulfilled {
            request_id: decoded.inner.data.requestId,
            random_number: decoded.inner.data.randomNumber,
        });
    }

    Err(EventError::UnknownTopic(topic))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fulfilled_log, received_log};
    use alloy::primitives::{Address, LogData};

    #[test]
    fn parses_request_received() {
        let log = received_log(7, 100);
        assert_eq!(
            parse_log(&log).unwrap(),
            RandomizerEvent::RequestReceived { request_id: U256::from(7) }
        );
    }

    #[test]
    fn parses_request_fulfilled() {
        let log = fulfilled_log(7, 4242, 101);
        let event = parse_log(&log).unwrap();
        assert_eq!(event.request_id(), U256::from(7));
        assert_eq!(
            event,
            RandomizerEvent::RequestFulfilled {
                request_id: U256::from(7),
                random_number: U256::from(4242),
            }
        );
    }

    #[test]
    fn rejects_foreign_topic() {
        let log = Log {
            inner: alloy::primitives::Log {
                address: Address::ZERO,
                data: LogData::new_unchecked(vec![B256::repeat_byte(0xab)], Default::default()),
            },
            ..Default::default()
        };
        assert!(matches!(parse_log(&log), Err(EventError::UnknownTopic(_))));
    }

    #[test]
    fn rejects_log_without_topics() {
        let log = Log::default();
        assert!(matches!(parse_log(&log), Err(EventError::MissingTopic)));
    }

    #[test]
    fn rejects_truncated_payload() {
        // RequestFulfilled with the indexed id but no data word.
        let log = Log {
            inner: alloy::primitives::Log {
                address: Address::ZERO,
                data: LogData::new_unchecked(
                    vec![REQUEST_FULFILLED_TOPIC, B256::from(U256::from(1).to_be_bytes::<32>())],
                    Default::default(),
                ),
            },
            ..Default::default()
        };
        assert!(matches!(parse_log(&log), Err(EventError::Decode(_))));
    }
}
