//! JSON-RPC clients for the two chains.
//!
//! Both chains are polled over plain JSON-RPC 2.0: `eth_blockNumber` /
//! `eth_getLogs` on the EVM side, `getLatestLedger` / `getEvents` on the
//! Soroban side. The indexers depend on the `EvmRpc` / `SorobanRpc` traits
//! so tests can substitute in-memory fixtures for the network.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

/// Minimal JSON-RPC 2.0 transport over HTTP POST.
#[derive(Clone)]
pub struct JsonRpcClient {
    http: reqwest::Client,
    url: String,
}

impl JsonRpcClient {
    pub fn new(url: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            url,
        }
    }

    pub async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });

        let response: Value = self
            .http
            .post(&self.url)
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if let Some(err) = response.get("error") {
            bail!("rpc error from {method}: {err}");
        }

        response
            .get("result")
            .cloned()
            .ok_or_else(|| anyhow!("rpc response for {method} has no result"))
    }
}

/// Parse a 0x-prefixed hex quantity.
pub fn hex_u64(value: &str) -> Result<u64> {
    let digits = value.trim_start_matches("0x");
    u64::from_str_radix(digits, 16).map_err(|e| anyhow!("bad hex quantity {value:?}: {e}"))
}

// ---------------------------------------------------------------------------
// EVM side
// ---------------------------------------------------------------------------

/// A raw EVM log as returned by `eth_getLogs`. Quantities stay hex-encoded
/// strings until the decoder needs them.
#[derive(Debug, Clone, Deserialize)]
pub struct EvmLog {
    pub address: String,
    pub topics: Vec<String>,
    pub data: String,
    #[serde(rename = "blockNumber")]
    pub block_number: String,
    #[serde(rename = "transactionHash")]
    pub transaction_hash: String,
    #[serde(rename = "logIndex")]
    pub log_index: String,
}

#[async_trait]
pub trait EvmRpc: Send + Sync + 'static {
    async fn block_number(&self) -> Result<u64>;
    async fn get_logs(&self, address: &str, from: u64, to: u64) -> Result<Vec<EvmLog>>;
}

#[derive(Clone)]
pub struct HttpEvmRpc {
    client: JsonRpcClient,
}

impl HttpEvmRpc {
    pub fn new(url: String) -> Self {
        Self {
            client: JsonRpcClient::new(url),
        }
    }
}

#[async_trait]
impl EvmRpc for HttpEvmRpc {
    async fn block_number(&self) -> Result<u64> {
        let result = self.client.call("eth_blockNumber", json!([])).await?;
        let raw = result
            .as_str()
            .ok_or_else(|| anyhow!("eth_blockNumber result is not a string"))?;
        hex_u64(raw)
    }

    async fn get_logs(&self, address: &str, from: u64, to: u64) -> Result<Vec<EvmLog>> {
        let params = json!([{
            "address": address,
            "fromBlock": format!("0x{from:x}"),
            "toBlock": format!("0x{to:x}"),
        }]);
        let result = self.client.call("eth_getLogs", params).await?;
        let logs: Vec<EvmLog> = serde_json::from_value(result)?;
        debug!(address = address, from = from, to = to, count = logs.len(), "fetched logs");
        Ok(logs)
    }
}

// ---------------------------------------------------------------------------
// Soroban side
// ---------------------------------------------------------------------------

/// A contract event from Soroban RPC `getEvents`, with topics and value
/// rendered as tagged JSON.
#[derive(Debug, Clone, Deserialize)]
pub struct SorobanEvent {
    #[serde(rename = "contractId")]
    pub contract_id: String,
    pub ledger: u64,
    #[serde(rename = "txHash")]
    pub tx_hash: String,
    /// Event id, e.g. "0004660039930archive-0000000003"; the suffix after the
    /// last '-' is the event's position within its transaction.
    #[serde(default)]
    pub id: String,
    #[serde(rename = "topicJson", default)]
    pub topics: Vec<Value>,
    #[serde(rename = "valueJson", default)]
    pub value: Value,
}

impl SorobanEvent {
    /// Sequence of this event within its transaction, falling back to
    /// `fallback` (the batch position) when the id doesn't carry one.
    pub fn seq(&self, fallback: u32) -> u32 {
        self.id
            .rsplit('-')
            .next()
            .and_then(|s| s.parse::<u32>().ok())
            .unwrap_or(fallback)
    }
}

#[derive(Debug, Deserialize)]
struct GetEventsResponse {
    #[serde(default)]
    events: Vec<SorobanEvent>,
}

#[async_trait]
pub trait SorobanRpc: Send + Sync + 'static {
    async fn latest_ledger(&self) -> Result<u64>;
    async fn get_events(&self, contract: &str, from: u64, to: u64) -> Result<Vec<SorobanEvent>>;
}

#[derive(Clone)]
pub struct HttpSorobanRpc {
    client: JsonRpcClient,
}

impl HttpSorobanRpc {
    pub fn new(url: String) -> Self {
        Self {
            client: JsonRpcClient::new(url),
        }
    }
}

#[async_trait]
impl SorobanRpc for HttpSorobanRpc {
    async fn latest_ledger(&self) -> Result<u64> {
        let result = self.client.call("getLatestLedger", json!({})).await?;
        result
            .get("sequence")
            .and_then(Value::as_u64)
            .ok_or_else(|| anyhow!("getLatestLedger result has no sequence"))
    }

    async fn get_events(&self, contract: &str, from: u64, to: u64) -> Result<Vec<SorobanEvent>> {
        let params = json!({
            "startLedger": from,
            "endLedger": to,
            "filters": [{
                "type": "contract",
                "contractIds": [contract],
            }],
            "xdrFormat": "json",
        });
        let result = self.client.call("getEvents", params).await?;
        let response: GetEventsResponse = serde_json::from_value(result)?;
        debug!(
            contract = contract,
            from = from,
            to = to,
            count = response.events.len(),
            "fetched contract events"
        );
        Ok(response.events)
    }
}
