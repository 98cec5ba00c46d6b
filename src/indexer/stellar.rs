//! Stellar (Soroban) chain poller.
//!
//! Polls `getEvents` over the market contract for a ledger range and decodes
//! each event's tagged-value topics and payload into the canonical
//! `ChainEvent` shape. topics[0] carries the event symbol; the data payload
//! is a key/value map with the same field names the Base decoder emits, so
//! the store aggregates both chains identically.

use crate::events::{Chain, ChainEvent, DecodedValue, EventKind};
use crate::indexer::ChainPoller;
use crate::rpc::{SorobanEvent, SorobanRpc};
use crate::store::{EventStore, InsertOutcome};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use tracing::warn;

/// How far behind head a fresh cursor starts when none is configured.
const DEFAULT_LOOKBACK_LEDGERS: u64 = 100;

pub struct StellarIndexer<R: SorobanRpc> {
    rpc: Arc<R>,
    contract: String,
    store: Arc<EventStore>,
}

impl<R: SorobanRpc> StellarIndexer<R> {
    pub fn new(rpc: R, contract: String, store: Arc<EventStore>) -> Self {
        Self {
            rpc: Arc::new(rpc),
            contract,
            store,
        }
    }
}

#[async_trait]
impl<R: SorobanRpc> ChainPoller for StellarIndexer<R> {
    fn chain(&self) -> Chain {
        Chain::Stellar
    }

    async fn chain_head(&self) -> Result<u64> {
        self.rpc.latest_ledger().await
    }

    async fn ingest_range(&self, from: u64, to: u64) -> Result<usize> {
        let events = self.rpc.get_events(&self.contract, from, to).await?;
        let mut stored = 0;
        for (position, raw) in events.iter().enumerate() {
            match decode_event(raw, position as u32) {
                Ok(event) => {
                    if self.store.insert(event) == InsertOutcome::Inserted {
                        stored += 1;
                    }
                }
                Err(e) => {
                    warn!(
                        tx = %raw.tx_hash,
                        ledger = raw.ledger,
                        error = %e,
                        "skipping undecodable contract event"
                    );
                }
            }
        }
        Ok(stored)
    }

    fn default_start(&self, head: u64) -> u64 {
        head.saturating_sub(DEFAULT_LOOKBACK_LEDGERS)
    }
}

/// Decode one raw contract event. `position` is the event's index within
/// the batch, used when the event id carries no sequence of its own.
fn decode_event(raw: &SorobanEvent, position: u32) -> Result<ChainEvent> {
    let symbol_value = raw
        .topics
        .first()
        .ok_or_else(|| anyhow!("event has no topics"))?;
    let kind = match decode_value(symbol_value)? {
        DecodedValue::Scalar(symbol) => EventKind::from_symbol(&symbol),
        other => return Err(anyhow!("topic0 is not a symbol: {other:?}")),
    };

    let mut data = Vec::new();

    // The contract publishes its payload as a map of named fields; anything
    // else is kept whole under a single key.
    match decode_value(&raw.value)? {
        DecodedValue::Map(entries) => data.extend(entries),
        DecodedValue::Unknown(tag) if raw.value.is_null() => {
            let _ = tag;
        }
        other => data.push(("value".to_string(), other)),
    }

    // Any extra topics ride along positionally.
    for (i, topic) in raw.topics.iter().enumerate().skip(1) {
        data.push((format!("topic{i}"), decode_value(topic)?));
    }

    Ok(ChainEvent {
        chain: Chain::Stellar,
        tx_hash: raw.tx_hash.clone(),
        contract: raw.contract_id.clone(),
        height: raw.ledger,
        kind,
        seq: raw.seq(position),
        data,
        indexed_at: Utc::now(),
    })
}

/// Recursive tagged-value decoder.
///
/// Values arrive as single-key JSON objects tagging their XDR type:
/// `{"u64": "42"}`, `{"symbol": "stake_added"}`, `{"vec": [..]}`,
/// `{"map": [{"key": .., "val": ..}]}` and so on. Integers become decimal
/// strings (u128 included - stake amounts use it), bytes stay hex,
/// addresses keep their text form whichever kind they are (`G..` account
/// or `C..` contract). A tag we don't understand becomes `Unknown(tag)`
/// rather than an error, so one exotic field never poisons the event.
pub fn decode_value(value: &Value) -> Result<DecodedValue> {
    if value.is_null() {
        return Ok(DecodedValue::Unknown("void".to_string()));
    }
    let object = value
        .as_object()
        .filter(|o| o.len() == 1)
        .ok_or_else(|| anyhow!("not a tagged value: {value}"))?;
    let (tag, inner) = object.iter().next().expect("len checked above");

    match tag.as_str() {
        "u32" | "i32" | "u64" | "i64" | "u128" | "i128" | "timepoint" | "duration" => {
            Ok(DecodedValue::Scalar(integer_string(inner)?))
        }
        "bool" => Ok(DecodedValue::Scalar(
            inner
                .as_bool()
                .ok_or_else(|| anyhow!("bool tag holds {inner}"))?
                .to_string(),
        )),
        "symbol" | "string" => Ok(DecodedValue::Scalar(
            inner
                .as_str()
                .ok_or_else(|| anyhow!("{tag} tag holds {inner}"))?
                .to_string(),
        )),
        "bytes" => Ok(DecodedValue::Scalar(
            inner
                .as_str()
                .ok_or_else(|| anyhow!("bytes tag holds {inner}"))?
                .to_ascii_lowercase(),
        )),
        "address" => Ok(DecodedValue::Scalar(
            inner
                .as_str()
                .ok_or_else(|| anyhow!("address tag holds {inner}"))?
                .to_string(),
        )),
        "vec" => {
            let items = inner
                .as_array()
                .ok_or_else(|| anyhow!("vec tag holds {inner}"))?;
            let decoded = items.iter().map(decode_value).collect::<Result<Vec<_>>>()?;
            Ok(DecodedValue::Vector(decoded))
        }
        "map" => {
            let entries = inner
                .as_array()
                .ok_or_else(|| anyhow!("map tag holds {inner}"))?;
            let mut decoded = Vec::with_capacity(entries.len());
            for entry in entries {
                let key = entry
                    .get("key")
                    .ok_or_else(|| anyhow!("map entry has no key"))?;
                let val = entry
                    .get("val")
                    .ok_or_else(|| anyhow!("map entry has no val"))?;
                decoded.push((key_string(&decode_value(key)?), decode_value(val)?));
            }
            Ok(DecodedValue::Map(decoded))
        }
        other => Ok(DecodedValue::Unknown(other.to_string())),
    }
}

/// Integers may arrive as JSON numbers (32-bit) or strings (64/128-bit);
/// either way they leave as decimal strings.
fn integer_string(inner: &Value) -> Result<String> {
    match inner {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        // 128-bit values are sometimes split into hi/lo halves.
        Value::Object(parts) => {
            let hi = parts
                .get("hi")
                .and_then(Value::as_i64)
                .ok_or_else(|| anyhow!("128-bit value missing hi"))?;
            let lo = parts
                .get("lo")
                .and_then(Value::as_u64)
                .ok_or_else(|| anyhow!("128-bit value missing lo"))?;
            let combined = ((hi as i128) << 64) | lo as i128;
            Ok(combined.to_string())
        }
        other => Err(anyhow!("integer tag holds {other}")),
    }
}

/// Map keys are rendered through the same decoder; non-scalar keys fall
/// back to their JSON form.
fn key_string(key: &DecodedValue) -> String {
    match key {
        DecodedValue::Scalar(s) => s.clone(),
        other => serde_json::to_string(other).unwrap_or_else(|_| format!("{other:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    fn sym(s: &str) -> Value {
        json!({ "symbol": s })
    }

    fn stake_event(tx: &str, id: &str, amount: &str) -> SorobanEvent {
        serde_json::from_value(json!({
            "contractId": "CMARKET",
            "ledger": 500,
            "txHash": tx,
            "id": id,
            "topicJson": [sym("stake_added")],
            "valueJson": { "map": [
                { "key": sym("call_id"), "val": { "u64": "1" } },
                { "key": sym("staker"), "val": { "address": "GALICE" } },
                { "key": sym("side"), "val": { "bool": true } },
                { "key": sym("amount"), "val": { "u128": amount } },
            ]},
        }))
        .unwrap()
    }

    #[test]
    fn scalars_decode_to_decimal_strings() {
        assert_eq!(
            decode_value(&json!({ "u32": 5 })).unwrap(),
            DecodedValue::Scalar("5".to_string())
        );
        assert_eq!(
            decode_value(&json!({ "i32": -3 })).unwrap(),
            DecodedValue::Scalar("-3".to_string())
        );
        assert_eq!(
            decode_value(&json!({ "u64": "18446744073709551615" })).unwrap(),
            DecodedValue::Scalar("18446744073709551615".to_string())
        );
        assert_eq!(
            decode_value(&json!({ "i64": "-42" })).unwrap(),
            DecodedValue::Scalar("-42".to_string())
        );
        assert_eq!(
            decode_value(&json!({ "u128": { "hi": 1, "lo": 5 } })).unwrap(),
            DecodedValue::Scalar("18446744073709551621".to_string())
        );
        assert_eq!(
            decode_value(&json!({ "bool": false })).unwrap(),
            DecodedValue::Scalar("false".to_string())
        );
    }

    #[test]
    fn symbols_bytes_and_addresses_decode() {
        assert_eq!(
            decode_value(&sym("call_created")).unwrap(),
            DecodedValue::Scalar("call_created".to_string())
        );
        assert_eq!(
            decode_value(&json!({ "bytes": "DEADBEEF" })).unwrap(),
            DecodedValue::Scalar("deadbeef".to_string())
        );
        // Both address kinds keep their canonical text form.
        assert_eq!(
            decode_value(&json!({ "address": "GBZXN7PIRZGNMHGA7MUUUF4GWPY5AYPV6LY4UV2GL6VJGIQRXFDNMADI" }))
                .unwrap(),
            DecodedValue::Scalar(
                "GBZXN7PIRZGNMHGA7MUUUF4GWPY5AYPV6LY4UV2GL6VJGIQRXFDNMADI".to_string()
            )
        );
        assert_eq!(
            decode_value(&json!({ "address": "CMARKET123" })).unwrap(),
            DecodedValue::Scalar("CMARKET123".to_string())
        );
    }

    #[test]
    fn vectors_and_maps_decode_recursively() {
        let value = json!({ "vec": [
            { "u32": 1 },
            { "map": [ { "key": sym("inner"), "val": { "i64": "-7" } } ] },
        ]});
        assert_eq!(
            decode_value(&value).unwrap(),
            DecodedValue::Vector(vec![
                DecodedValue::Scalar("1".to_string()),
                DecodedValue::Map(vec![(
                    "inner".to_string(),
                    DecodedValue::Scalar("-7".to_string())
                )]),
            ])
        );
    }

    #[test]
    fn unknown_tags_pass_through() {
        assert_eq!(
            decode_value(&json!({ "ledger_key_contract_instance": {} })).unwrap(),
            DecodedValue::Unknown("ledger_key_contract_instance".to_string())
        );
        // An untagged value is a real decode error.
        assert!(decode_value(&json!(["not", "tagged"])).is_err());
    }

    #[test]
    fn event_decodes_with_canonical_payload_keys() {
        let event = decode_event(&stake_event("txa", "0000000123-0000000002", "2500"), 0).unwrap();
        assert_eq!(event.chain, Chain::Stellar);
        assert_eq!(event.kind, EventKind::StakeAdded);
        assert_eq!(event.height, 500);
        assert_eq!(event.seq, 2);
        assert_eq!(event.scalar_field("call_id"), Some("1"));
        assert_eq!(event.scalar_field("staker"), Some("GALICE"));
        assert_eq!(event.scalar_field("side"), Some("true"));
        assert_eq!(event.scalar_field("amount"), Some("2500"));
    }

    #[test]
    fn unmapped_event_names_pass_through_verbatim() {
        let raw: SorobanEvent = serde_json::from_value(json!({
            "contractId": "CMARKET",
            "ledger": 501,
            "txHash": "txb",
            "id": "x-0000000000",
            "topicJson": [sym("fees_swept"), { "u64": "9" }],
            "valueJson": { "u64": "100" },
        }))
        .unwrap();
        let event = decode_event(&raw, 0).unwrap();
        assert_eq!(event.kind, EventKind::Other("fees_swept".to_string()));
        assert_eq!(event.scalar_field("value"), Some("100"));
        assert_eq!(event.scalar_field("topic1"), Some("9"));
    }

    struct FixtureRpc {
        events: Mutex<Vec<SorobanEvent>>,
    }

    #[async_trait]
    impl SorobanRpc for FixtureRpc {
        async fn latest_ledger(&self) -> Result<u64> {
            Ok(500)
        }

        async fn get_events(
            &self,
            _contract: &str,
            _from: u64,
            _to: u64,
        ) -> Result<Vec<SorobanEvent>> {
            Ok(self.events.lock().unwrap().clone())
        }
    }

    #[tokio::test]
    async fn one_bad_event_never_halts_the_batch() {
        let malformed: SorobanEvent = serde_json::from_value(json!({
            "contractId": "CMARKET",
            "ledger": 500,
            "txHash": "txbad",
            "id": "x-0000000000",
            "topicJson": [],
            "valueJson": null,
        }))
        .unwrap();

        let rpc = FixtureRpc {
            events: Mutex::new(vec![
                malformed,
                stake_event("txa", "x-0000000001", "100"),
                stake_event("txa", "x-0000000001", "100"), // duplicate window overlap
            ]),
        };
        let store = Arc::new(EventStore::new());
        let poller = StellarIndexer::new(rpc, "CMARKET".to_string(), Arc::clone(&store));

        let stored = poller.ingest_range(400, 500).await.unwrap();
        assert_eq!(stored, 1);
        assert_eq!(store.events_by_kind(&EventKind::StakeAdded).len(), 1);
    }

    #[test]
    fn lookback_default_start() {
        let store = Arc::new(EventStore::new());
        let poller = StellarIndexer::new(
            FixtureRpc {
                events: Mutex::new(Vec::new()),
            },
            "CMARKET".to_string(),
            store,
        );
        assert_eq!(poller.default_start(500), 400);
        assert_eq!(poller.default_start(40), 0);
    }
}
