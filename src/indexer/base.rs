//! Base (EVM) chain poller.
//!
//! Polls `eth_getLogs` over the market contract and decodes the three
//! call-market events from their standard log/topic encoding into the
//! canonical `ChainEvent` shape. A log that fails to decode is logged and
//! skipped - one unparseable event never halts ingestion.

use crate::events::{Chain, ChainEvent, DecodedValue, EventKind};
use crate::indexer::{abi, ChainPoller};
use crate::rpc::{hex_u64, EvmLog, EvmRpc};
use crate::store::{EventStore, InsertOutcome};
use alloy::primitives::{Address, B256, U256};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, warn};

pub struct BaseIndexer<R: EvmRpc> {
    rpc: Arc<R>,
    contract: String,
    store: Arc<EventStore>,
}

impl<R: EvmRpc> BaseIndexer<R> {
    pub fn new(rpc: R, contract: String, store: Arc<EventStore>) -> Self {
        Self {
            rpc: Arc::new(rpc),
            contract,
            store,
        }
    }
}

#[async_trait]
impl<R: EvmRpc> ChainPoller for BaseIndexer<R> {
    fn chain(&self) -> Chain {
        Chain::Base
    }

    async fn chain_head(&self) -> Result<u64> {
        self.rpc.block_number().await
    }

    async fn ingest_range(&self, from: u64, to: u64) -> Result<usize> {
        let logs = self.rpc.get_logs(&self.contract, from, to).await?;
        let mut stored = 0;
        for log in &logs {
            match decode_log(log) {
                Ok(Some(event)) => {
                    if self.store.insert(event) == InsertOutcome::Inserted {
                        stored += 1;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(
                        tx = %log.transaction_hash,
                        error = %e,
                        "skipping undecodable log"
                    );
                }
            }
        }
        Ok(stored)
    }

    fn default_start(&self, _head: u64) -> u64 {
        1
    }
}

/// Decode one raw log into a canonical event. `Ok(None)` means the topic0
/// has no decoder (not an error, just not ours to index).
fn decode_log(log: &EvmLog) -> Result<Option<ChainEvent>> {
    let topic0 = parse_b256(
        log.topics
            .first()
            .ok_or_else(|| anyhow!("log has no topic0"))?,
    )?;
    let data = decode_hex(&log.data)?;

    let (kind, payload) = if topic0 == *abi::CALL_CREATED_TOPIC {
        // CallCreated(uint256 indexed callId, address token, uint256 endTs)
        (
            EventKind::CallCreated,
            vec![
                scalar("call_id", topic_u256(log, 1)?.to_string()),
                scalar("token", address_word(&data, 0)?.to_string()),
                scalar("end_ts", word_u256(&data, 1)?.to_string()),
            ],
        )
    } else if topic0 == *abi::STAKE_ADDED_TOPIC {
        // StakeAdded(uint256 indexed callId, address indexed staker,
        //            bool side, uint256 amount)
        (
            EventKind::StakeAdded,
            vec![
                scalar("call_id", topic_u256(log, 1)?.to_string()),
                scalar("staker", topic_address(log, 2)?.to_string()),
                scalar("side", bool_word(&data, 0)?.to_string()),
                scalar("amount", word_u256(&data, 1)?.to_string()),
            ],
        )
    } else if topic0 == *abi::OUTCOME_SUBMITTED_TOPIC {
        // OutcomeSubmitted(uint256 indexed callId, bool outcome,
        //                  uint256 finalPrice, uint256 timestamp)
        (
            EventKind::OutcomeSubmitted,
            vec![
                scalar("call_id", topic_u256(log, 1)?.to_string()),
                scalar("outcome", bool_word(&data, 0)?.to_string()),
                scalar("final_price", word_u256(&data, 1)?.to_string()),
                scalar("timestamp", word_u256(&data, 2)?.to_string()),
            ],
        )
    } else {
        debug!(topic = %topic0, "no decoder for topic0, skipping log");
        return Ok(None);
    };

    Ok(Some(ChainEvent {
        chain: Chain::Base,
        tx_hash: log.transaction_hash.clone(),
        contract: log.address.clone(),
        height: hex_u64(&log.block_number)?,
        kind,
        seq: hex_u64(&log.log_index)? as u32,
        data: payload,
        indexed_at: Utc::now(),
    }))
}

fn scalar(key: &str, value: String) -> (String, DecodedValue) {
    (key.to_string(), DecodedValue::Scalar(value))
}

fn decode_hex(raw: &str) -> Result<Vec<u8>> {
    hex::decode(raw.trim_start_matches("0x")).map_err(|e| anyhow!("bad hex data: {e}"))
}

fn parse_b256(raw: &str) -> Result<B256> {
    let bytes = decode_hex(raw)?;
    if bytes.len() != 32 {
        return Err(anyhow!("expected 32 bytes, got {}", bytes.len()));
    }
    Ok(B256::from_slice(&bytes))
}

/// ABI word `index` (32 bytes) from the data section.
fn word(data: &[u8], index: usize) -> Result<[u8; 32]> {
    let start = index * 32;
    let end = start + 32;
    if data.len() < end {
        return Err(anyhow!(
            "data too short for word {index}: {} bytes",
            data.len()
        ));
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&data[start..end]);
    Ok(out)
}

fn word_u256(data: &[u8], index: usize) -> Result<U256> {
    Ok(U256::from_be_bytes(word(data, index)?))
}

fn bool_word(data: &[u8], index: usize) -> Result<bool> {
    Ok(word_u256(data, index)? != U256::ZERO)
}

fn address_word(data: &[u8], index: usize) -> Result<Address> {
    let w = word(data, index)?;
    Ok(Address::from_slice(&w[12..]))
}

fn topic_u256(log: &EvmLog, index: usize) -> Result<U256> {
    let topic = log
        .topics
        .get(index)
        .ok_or_else(|| anyhow!("log has no topic{index}"))?;
    Ok(U256::from_be_bytes(parse_b256(topic)?.0))
}

fn topic_address(log: &EvmLog, index: usize) -> Result<Address> {
    let topic = log
        .topics
        .get(index)
        .ok_or_else(|| anyhow!("log has no topic{index}"))?;
    Ok(Address::from_slice(&parse_b256(topic)?.0[12..]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;
    use std::sync::Mutex;

    fn word_hex(value: u64) -> String {
        let mut w = [0u8; 32];
        w[24..].copy_from_slice(&value.to_be_bytes());
        hex::encode(w)
    }

    fn topic_hex(value: u64) -> String {
        format!("0x{}", word_hex(value))
    }

    fn address_word_hex(tail: u8) -> String {
        let mut w = [0u8; 32];
        w[31] = tail;
        w[12] = 0xaa;
        hex::encode(w)
    }

    fn log(topics: Vec<String>, data: String) -> EvmLog {
        EvmLog {
            address: "0xmarket".to_string(),
            topics,
            data: format!("0x{data}"),
            block_number: "0x64".to_string(),
            transaction_hash: "0xabc".to_string(),
            log_index: "0x2".to_string(),
        }
    }

    #[test]
    fn decodes_call_created() {
        let raw = log(
            vec![format!("{}", *abi::CALL_CREATED_TOPIC), topic_hex(7)],
            format!("{}{}", address_word_hex(0x11), word_hex(1_000_000)),
        );
        let event = decode_log(&raw).unwrap().unwrap();
        assert_eq!(event.kind, EventKind::CallCreated);
        assert_eq!(event.chain, Chain::Base);
        assert_eq!(event.height, 100);
        assert_eq!(event.seq, 2);
        assert_eq!(event.scalar_field("call_id"), Some("7"));
        assert_eq!(event.scalar_field("end_ts"), Some("1000000"));
        let token = event.scalar_field("token").unwrap();
        assert!(token.starts_with("0x"));
        assert_eq!(token.len(), 42);
    }

    #[test]
    fn decodes_stake_added() {
        let raw = log(
            vec![
                format!("{}", *abi::STAKE_ADDED_TOPIC),
                topic_hex(7),
                format!("0x{}", address_word_hex(0x22)),
            ],
            format!("{}{}", word_hex(1), word_hex(2_500)),
        );
        let event = decode_log(&raw).unwrap().unwrap();
        assert_eq!(event.kind, EventKind::StakeAdded);
        assert_eq!(event.scalar_field("call_id"), Some("7"));
        assert_eq!(event.scalar_field("side"), Some("true"));
        assert_eq!(event.scalar_field("amount"), Some("2500"));
    }

    #[test]
    fn decodes_outcome_submitted() {
        let raw = log(
            vec![format!("{}", *abi::OUTCOME_SUBMITTED_TOPIC), topic_hex(7)],
            format!(
                "{}{}{}",
                word_hex(0),
                word_hex(105),
                word_hex(1_000_001)
            ),
        );
        let event = decode_log(&raw).unwrap().unwrap();
        assert_eq!(event.kind, EventKind::OutcomeSubmitted);
        assert_eq!(event.scalar_field("outcome"), Some("false"));
        assert_eq!(event.scalar_field("final_price"), Some("105"));
        assert_eq!(event.scalar_field("timestamp"), Some("1000001"));
    }

    #[test]
    fn unknown_topic0_is_skipped_not_an_error() {
        let raw = log(vec![topic_hex(0xdead)], word_hex(1));
        assert!(decode_log(&raw).unwrap().is_none());
    }

    #[test]
    fn truncated_data_is_an_error() {
        let raw = log(
            vec![format!("{}", *abi::CALL_CREATED_TOPIC), topic_hex(7)],
            "00ff".to_string(),
        );
        assert!(decode_log(&raw).is_err());
    }

    struct FixtureRpc {
        logs: Mutex<Vec<EvmLog>>,
    }

    #[async_trait]
    impl EvmRpc for FixtureRpc {
        async fn block_number(&self) -> Result<u64> {
            Ok(100)
        }

        async fn get_logs(&self, _address: &str, from: u64, to: u64) -> Result<Vec<EvmLog>> {
            if from > to {
                bail!("bad range");
            }
            Ok(self.logs.lock().unwrap().clone())
        }
    }

    #[tokio::test]
    async fn one_bad_log_never_halts_the_batch() {
        let good = log(
            vec![format!("{}", *abi::CALL_CREATED_TOPIC), topic_hex(7)],
            format!("{}{}", address_word_hex(0x11), word_hex(1_000_000)),
        );
        let bad = log(
            vec![format!("{}", *abi::STAKE_ADDED_TOPIC), topic_hex(7)],
            "beef".to_string(),
        );
        let mut unknown = log(vec![topic_hex(1)], word_hex(0));
        unknown.log_index = "0x9".to_string();

        let rpc = FixtureRpc {
            logs: Mutex::new(vec![bad, good, unknown]),
        };
        let store = Arc::new(EventStore::new());
        let poller = BaseIndexer::new(rpc, "0xmarket".to_string(), Arc::clone(&store));

        let stored = poller.ingest_range(1, 100).await.unwrap();
        assert_eq!(stored, 1);
        assert_eq!(store.events_by_kind(&EventKind::CallCreated).len(), 1);
    }
}
