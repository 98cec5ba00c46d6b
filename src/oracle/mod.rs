//! Outcome signing, verification, and the settlement audit trail.
//!
//! The canonical settlement message is exactly 33 bytes, big-endian:
//!
//! | offset | length | field |
//! |--------|--------|------------------------------------------|
//! | 0      | 8      | call id (u64)                            |
//! | 8      | 1      | outcome (0 = false, 1 = true)            |
//! | 9      | 16     | final price (u128, upper-64 then lower-64)|
//! | 25     | 8      | timestamp (u64)                          |
//!
//! An ed25519 detached signature is computed over exactly this byte
//! sequence, so the bytes here must match what the on-chain contracts
//! reconstruct during verification. Signing and verification are pure and
//! stateless; verification returns false on any failure, never an error.

pub mod monitor;

use chrono::Utc;
use dashmap::DashSet;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;
use tracing::debug;

pub const MESSAGE_LEN: usize = 33;

#[derive(Error, Debug)]
pub enum KeyError {
    #[error("key is not valid hex: {0}")]
    Hex(#[from] hex::FromHexError),
    #[error("expected 32 key bytes, got {0}")]
    Length(usize),
}

/// The oracle's signing identity. The secret never leaves this process and
/// is never written to the event store.
pub struct OracleKeypair {
    signing_key: SigningKey,
}

impl OracleKeypair {
    /// Fresh random keypair (ephemeral oracles, tests).
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut rand::rngs::OsRng),
        }
    }

    /// Keypair from a hex-encoded 32-byte seed, e.g. the ORACLE_SECRET_KEY
    /// environment variable.
    pub fn from_seed_hex(seed: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(seed.trim())?;
        let seed: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| KeyError::Length(bytes.len()))?;
        Ok(Self {
            signing_key: SigningKey::from_bytes(&seed),
        })
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }
}

/// A signed settlement attestation, ready for the transaction relay.
/// Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedOutcome {
    pub call_id: u64,
    pub outcome: bool,
    pub final_price: u128,
    pub timestamp: u64,
    pub oracle_pubkey: [u8; 32],
    pub signature: [u8; 64],
}

impl SignedOutcome {
    /// Check this attestation against its own embedded public key.
    pub fn verify(&self) -> bool {
        verify_outcome(
            self.call_id,
            self.outcome,
            self.final_price,
            self.timestamp,
            &self.oracle_pubkey,
            &self.signature,
        )
    }
}

/// Build the canonical 33-byte settlement message. Deterministic: the same
/// fields always produce the same bytes.
pub fn build_message(call_id: u64, outcome: bool, final_price: u128, timestamp: u64) -> [u8; MESSAGE_LEN] {
    let mut msg = [0u8; MESSAGE_LEN];
    msg[0..8].copy_from_slice(&call_id.to_be_bytes());
    msg[8] = outcome as u8;
    msg[9..17].copy_from_slice(&((final_price >> 64) as u64).to_be_bytes());
    msg[17..25].copy_from_slice(&(final_price as u64).to_be_bytes());
    msg[25..33].copy_from_slice(&timestamp.to_be_bytes());
    msg
}

/// Detached ed25519 signature over the canonical message.
pub fn sign_outcome(
    keypair: &OracleKeypair,
    call_id: u64,
    outcome: bool,
    final_price: u128,
    timestamp: u64,
) -> SignedOutcome {
    let message = build_message(call_id, outcome, final_price, timestamp);
    let signature: Signature = keypair.signing_key.sign(&message);
    SignedOutcome {
        call_id,
        outcome,
        final_price,
        timestamp,
        oracle_pubkey: keypair.public_key(),
        signature: signature.to_bytes(),
    }
}

/// Recompute the message from the structured fields and check the detached
/// signature. Any failure - including a pubkey or signature that is not
/// exactly 32/64 bytes - yields false, never an error.
pub fn verify_outcome(
    call_id: u64,
    outcome: bool,
    final_price: u128,
    timestamp: u64,
    pubkey: &[u8],
    signature: &[u8],
) -> bool {
    let pubkey: [u8; 32] = match pubkey.try_into() {
        Ok(pk) => pk,
        Err(_) => return false,
    };
    let signature: [u8; 64] = match signature.try_into() {
        Ok(sig) => sig,
        Err(_) => return false,
    };
    let verifying_key = match VerifyingKey::from_bytes(&pubkey) {
        Ok(vk) => vk,
        Err(_) => return false,
    };
    let message = build_message(call_id, outcome, final_price, timestamp);
    verifying_key
        .verify(&message, &Signature::from_bytes(&signature))
        .is_ok()
}

/// Settlement eligibility gate: a call is settleable from its end timestamp
/// on. No grace period, no quorum.
pub fn can_settle_call(now: u64, end_ts: u64) -> bool {
    now >= end_ts
}

/// The set of public keys allowed to settle calls. Single-signer trust
/// model: membership is the whole policy.
#[derive(Default)]
pub struct AuthorizedOracles {
    keys: DashSet<[u8; 32]>,
}

impl AuthorizedOracles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn authorize(&self, pubkey: [u8; 32]) {
        self.keys.insert(pubkey);
    }

    pub fn authorize_hex(&self, pubkey: &str) -> Result<(), KeyError> {
        let bytes = hex::decode(pubkey.trim())?;
        let pubkey: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| KeyError::Length(bytes.len()))?;
        self.authorize(pubkey);
        Ok(())
    }

    /// Returns true if the key was present.
    pub fn revoke(&self, pubkey: &[u8; 32]) -> bool {
        self.keys.remove(pubkey).is_some()
    }

    pub fn is_authorized(&self, pubkey: &[u8; 32]) -> bool {
        self.keys.contains(pubkey)
    }
}

/// One line of the settlement audit trail.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    pub at: String,
    pub call_id: u64,
    pub outcome: bool,
    /// Decimal string: u128 does not survive JSON number parsing everywhere.
    pub final_price: String,
    pub timestamp: u64,
    pub oracle_pubkey: String,
    pub signature: String,
    pub submitted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AuditEntry {
    pub fn new(signed: &SignedOutcome, submitted: bool, error: Option<String>) -> Self {
        Self {
            at: Utc::now().to_rfc3339(),
            call_id: signed.call_id,
            outcome: signed.outcome,
            final_price: signed.final_price.to_string(),
            timestamp: signed.timestamp,
            oracle_pubkey: hex::encode(signed.oracle_pubkey),
            signature: hex::encode(signed.signature),
            submitted,
            error,
        }
    }
}

/// Append-only JSONL audit trail of every signing attempt. Appends are
/// best-effort: a failed write is logged and never fails the settlement.
pub struct AuditLog {
    path: PathBuf,
}

impl AuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn append(&self, entry: &AuditEntry) {
        let line = match serde_json::to_string(entry) {
            Ok(line) => line,
            Err(e) => {
                debug!(error = %e, "failed to serialize audit entry");
                return;
            }
        };
        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut f| {
                use std::io::Write;
                writeln!(f, "{line}")
            });
        if let Err(e) = result {
            debug!(path = %self.path.display(), error = %e, "failed to append audit entry");
        }
    }
}
