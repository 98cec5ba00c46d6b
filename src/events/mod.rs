//! Canonical cross-chain event and market model.
//!
//! Both indexers normalize their chain's native encoding into `ChainEvent`,
//! keyed by (chain, transaction hash, event sequence). That key is the
//! store's dedup key: it is what turns at-least-once polling into
//! exactly-once effect.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The chains we ingest from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Chain {
    Base,
    Stellar,
}

impl std::fmt::Display for Chain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Chain::Base => write!(f, "BASE"),
            Chain::Stellar => write!(f, "STELLAR"),
        }
    }
}

/// Logical event type. Unmapped names pass through verbatim in `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    CallCreated,
    StakeAdded,
    OutcomeSubmitted,
    Other(String),
}

impl EventKind {
    /// Map a Soroban event symbol to its logical name.
    pub fn from_symbol(symbol: &str) -> Self {
        match symbol {
            "call_created" => EventKind::CallCreated,
            "stake_added" => EventKind::StakeAdded,
            "outcome_submitted" => EventKind::OutcomeSubmitted,
            other => EventKind::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            EventKind::CallCreated => "CallCreated",
            EventKind::StakeAdded => "StakeAdded",
            EventKind::OutcomeSubmitted => "OutcomeSubmitted",
            EventKind::Other(name) => name,
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A decoded event value.
///
/// Integers are rendered as decimal strings so nothing is lost crossing
/// process boundaries; bytes as hex; addresses in their canonical text form.
/// Tags the decoder does not understand land in `Unknown` with the raw tag
/// name preserved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecodedValue {
    Scalar(String),
    Vector(Vec<DecodedValue>),
    Map(Vec<(String, DecodedValue)>),
    Unknown(String),
}

impl DecodedValue {
    pub fn as_scalar(&self) -> Option<&str> {
        match self {
            DecodedValue::Scalar(s) => Some(s.as_str()),
            _ => None,
        }
    }
}

/// Dedup key for stored events.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventKey {
    pub chain: Chain,
    pub tx_hash: String,
    pub seq: u32,
}

/// A normalized on-chain event. Immutable once stored.
#[derive(Debug, Clone, Serialize)]
pub struct ChainEvent {
    pub chain: Chain,
    pub tx_hash: String,
    pub contract: String,
    /// Ledger sequence (Stellar) or block number (Base).
    pub height: u64,
    pub kind: EventKind,
    /// Position of the event within its transaction.
    pub seq: u32,
    /// Decoded payload, insertion-ordered.
    pub data: Vec<(String, DecodedValue)>,
    pub indexed_at: DateTime<Utc>,
}

impl ChainEvent {
    pub fn key(&self) -> EventKey {
        EventKey {
            chain: self.chain,
            tx_hash: self.tx_hash.clone(),
            seq: self.seq,
        }
    }

    pub fn field(&self, name: &str) -> Option<&DecodedValue> {
        self.data.iter().find(|(k, _)| k == name).map(|(_, v)| v)
    }

    pub fn scalar_field(&self, name: &str) -> Option<&str> {
        self.field(name).and_then(DecodedValue::as_scalar)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Active,
    Settled,
    Disputed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Unknown,
    True,
    False,
}

impl Outcome {
    pub fn from_bool(value: bool) -> Self {
        if value {
            Outcome::True
        } else {
            Outcome::False
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Outcome::True => Some(true),
            Outcome::False => Some(false),
            Outcome::Unknown => None,
        }
    }
}

/// A prediction call (market). Created by CallCreated, mutated only by
/// StakeAdded and a terminal OutcomeSubmitted. Never deleted.
#[derive(Debug, Clone, Serialize)]
pub struct Call {
    pub id: u64,
    pub chain: Chain,
    /// Stake token (contract address / asset id).
    pub token: String,
    pub total_stake_yes: u128,
    pub total_stake_no: u128,
    pub end_ts: u64,
    pub status: CallStatus,
    pub outcome: Outcome,
    pub final_price: Option<u128>,
}

impl Call {
    pub fn new(id: u64, chain: Chain, token: String, end_ts: u64) -> Self {
        Self {
            id,
            chain,
            token,
            total_stake_yes: 0,
            total_stake_no: 0,
            end_ts,
            status: CallStatus::Active,
            outcome: Outcome::Unknown,
            final_price: None,
        }
    }
}
