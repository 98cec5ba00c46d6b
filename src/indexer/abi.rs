//! Contract event signatures and topic hash computation.
//!
//! Minimal ABI surface covering just the three call-market events we decode.
//! Topic0 hashes are computed once on first use from the canonical event
//! signatures, so they can never drift from the strings below.

use alloy::primitives::B256;
use std::sync::LazyLock;

/// keccak256("CallCreated(uint256,address,uint256)")
pub static CALL_CREATED_TOPIC: LazyLock<B256> =
    LazyLock::new(|| keccak256(b"CallCreated(uint256,address,uint256)"));

/// keccak256("StakeAdded(uint256,address,bool,uint256)")
pub static STAKE_ADDED_TOPIC: LazyLock<B256> =
    LazyLock::new(|| keccak256(b"StakeAdded(uint256,address,bool,uint256)"));

/// keccak256("OutcomeSubmitted(uint256,bool,uint256,uint256)")
pub static OUTCOME_SUBMITTED_TOPIC: LazyLock<B256> =
    LazyLock::new(|| keccak256(b"OutcomeSubmitted(uint256,bool,uint256,uint256)"));

/// Compute keccak256 hash of a byte slice.
pub fn keccak256(data: &[u8]) -> B256 {
    use tiny_keccak::{Hasher, Keccak};
    let mut hasher = Keccak::v256();
    let mut output = [0u8; 32];
    hasher.update(data);
    hasher.finalize(&mut output);
    B256::from(output)
}
