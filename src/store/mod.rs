//! Idempotent event store and call aggregation.
//!
//! Data model:
//!   (chain, tx_hash, seq)      -> ChainEvent          (insert-if-absent, immutable)
//!   call_id                    -> Call                (stake accumulators, terminal settle)
//!   (call_id, staker, side)    -> StakePosition       (per-staker per-side accumulation)
//!   (call_id, staker)          -> withdrawal mark     (set once)
//!
//! The insert-if-absent write is the single synchronization point between
//! the chain indexers: a duplicate key is a successful no-op, so overlapping
//! poll windows and restarts are safe. Stake aggregation happens under the
//! call's shard lock, which makes each increment an atomic
//! read-modify-write; StakeAdded ordering is irrelevant because summation
//! commutes and the dedup key guarantees each event is counted exactly once.

use crate::events::{Call, CallStatus, Chain, ChainEvent, EventKey, EventKind, Outcome};
use crate::payout::payout;
use dashmap::{DashMap, DashSet};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Result of an insert attempt. A `Duplicate` is success, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    Duplicate,
}

/// A staker's accumulated stake on one side of a call. A staker holding
/// both sides has two positions, never a merged one.
#[derive(Debug, Clone, Serialize)]
pub struct StakePosition {
    /// true = yes/long side.
    pub side: bool,
    pub amount: u128,
}

/// Per-chain statistics served to the API layer.
#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub total_events: u64,
    pub events_by_type: BTreeMap<String, u64>,
}

#[derive(Default)]
pub struct EventStore {
    events: DashMap<EventKey, ChainEvent>,
    calls: DashMap<u64, Call>,
    positions: DashMap<(u64, String, bool), StakePosition>,
    withdrawals: DashSet<(u64, String)>,
    type_counts: DashMap<(Chain, String), u64>,
}

impl EventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomic insert-if-absent keyed by (chain, tx_hash, seq). On a fresh
    /// insert the event is also applied to the call aggregate; a duplicate
    /// changes nothing and reports `Duplicate`.
    pub fn insert(&self, event: ChainEvent) -> InsertOutcome {
        use dashmap::mapref::entry::Entry;

        match self.events.entry(event.key()) {
            Entry::Occupied(_) => {
                debug!(
                    chain = %event.chain,
                    tx = %event.tx_hash,
                    seq = event.seq,
                    "duplicate event ignored"
                );
                InsertOutcome::Duplicate
            }
            Entry::Vacant(slot) => {
                self.apply(&event);
                *self
                    .type_counts
                    .entry((event.chain, event.kind.as_str().to_string()))
                    .or_insert(0) += 1;
                slot.insert(event);
                InsertOutcome::Inserted
            }
        }
    }

    /// Fold one freshly inserted event into the call aggregate. A payload
    /// that doesn't parse is logged and skipped; the event itself stays
    /// stored for later inspection.
    fn apply(&self, event: &ChainEvent) {
        let result = match event.kind {
            EventKind::CallCreated => self.apply_call_created(event),
            EventKind::StakeAdded => self.apply_stake_added(event),
            EventKind::OutcomeSubmitted => self.apply_outcome_submitted(event),
            EventKind::Other(_) => Ok(()),
        };
        if let Err(reason) = result {
            warn!(
                chain = %event.chain,
                kind = %event.kind,
                tx = %event.tx_hash,
                seq = event.seq,
                reason = %reason,
                "event not applied to call aggregate"
            );
        }
    }

    fn apply_call_created(&self, event: &ChainEvent) -> Result<(), String> {
        let id = u64_field(event, "call_id")?;
        let token = scalar_field(event, "token")?.to_string();
        let end_ts = u64_field(event, "end_ts")?;

        use dashmap::mapref::entry::Entry;
        match self.calls.entry(id) {
            Entry::Occupied(_) => {
                debug!(call_id = id, "call already exists, create ignored");
                Ok(())
            }
            Entry::Vacant(slot) => {
                slot.insert(Call::new(id, event.chain, token, end_ts));
                debug!(call_id = id, chain = %event.chain, end_ts = end_ts, "call created");
                Ok(())
            }
        }
    }

    fn apply_stake_added(&self, event: &ChainEvent) -> Result<(), String> {
        let id = u64_field(event, "call_id")?;
        let staker = scalar_field(event, "staker")?.to_string();
        let side = side_field(event, "side")?;
        let amount = u128_field(event, "amount")?;

        let mut call = self
            .calls
            .get_mut(&id)
            .ok_or_else(|| format!("stake for unknown call {id}"))?;
        if call.status != CallStatus::Active {
            return Err(format!("stake for call {id} after settlement"));
        }
        // Shard lock held: this is the atomic read-increment-write.
        if side {
            call.total_stake_yes += amount;
        } else {
            call.total_stake_no += amount;
        }
        drop(call);

        self.positions
            .entry((id, staker, side))
            .and_modify(|p| p.amount += amount)
            .or_insert(StakePosition { side, amount });
        Ok(())
    }

    fn apply_outcome_submitted(&self, event: &ChainEvent) -> Result<(), String> {
        let id = u64_field(event, "call_id")?;
        let outcome = side_field(event, "outcome")?;
        let final_price = u128_field(event, "final_price")?;

        let mut call = self
            .calls
            .get_mut(&id)
            .ok_or_else(|| format!("outcome for unknown call {id}"))?;
        if call.status == CallStatus::Settled {
            debug!(call_id = id, "call already settled, outcome ignored");
            return Ok(());
        }
        call.status = CallStatus::Settled;
        call.outcome = Outcome::from_bool(outcome);
        call.final_price = Some(final_price);
        debug!(call_id = id, outcome = outcome, final_price = %final_price, "call settled");
        Ok(())
    }

    // --- Queries ---

    pub fn events_by_kind(&self, kind: &EventKind) -> Vec<ChainEvent> {
        let mut events: Vec<ChainEvent> = self
            .events
            .iter()
            .filter(|entry| &entry.value().kind == kind)
            .map(|entry| entry.value().clone())
            .collect();
        events.sort_by_key(|e| (e.height, e.seq));
        events
    }

    pub fn events_by_contract(&self, contract: &str) -> Vec<ChainEvent> {
        let mut events: Vec<ChainEvent> = self
            .events
            .iter()
            .filter(|entry| entry.value().contract == contract)
            .map(|entry| entry.value().clone())
            .collect();
        events.sort_by_key(|e| (e.height, e.seq));
        events
    }

    pub fn call(&self, id: u64) -> Option<Call> {
        self.calls.get(&id).map(|c| c.clone())
    }

    pub fn calls(&self) -> Vec<Call> {
        let mut calls: Vec<Call> = self.calls.iter().map(|c| c.clone()).collect();
        calls.sort_by_key(|c| c.id);
        calls
    }

    pub fn position(&self, call_id: u64, staker: &str, side: bool) -> Option<StakePosition> {
        self.positions
            .get(&(call_id, staker.to_string(), side))
            .map(|p| p.clone())
    }

    pub fn stats(&self, chain: Chain) -> StoreStats {
        let mut events_by_type = BTreeMap::new();
        let mut total_events = 0u64;
        for entry in self.type_counts.iter() {
            let ((event_chain, kind), count) = (entry.key().clone(), *entry.value());
            if event_chain == chain {
                total_events += count;
                events_by_type.insert(kind, count);
            }
        }
        StoreStats {
            total_events,
            events_by_type,
        }
    }

    // --- Read-side settlement ---

    /// Parimutuel payout for one staker on a settled call, summed over both
    /// sides the staker may hold. None until the call settles (or when the
    /// staker holds no position).
    pub fn payout_of(&self, call_id: u64, staker: &str) -> Option<u128> {
        let call = self.calls.get(&call_id)?;
        let outcome = call.outcome.as_bool()?;
        let mut total: Option<u128> = None;
        for side in [true, false] {
            if let Some(position) = self.positions.get(&(call_id, staker.to_string(), side)) {
                let pay = payout(
                    position.amount,
                    side,
                    outcome,
                    call.total_stake_yes,
                    call.total_stake_no,
                );
                total = Some(total.unwrap_or(0) + pay);
            }
        }
        total
    }

    /// Mark a payout as withdrawn. Returns false if it already was.
    pub fn record_withdrawal(&self, call_id: u64, staker: &str) -> bool {
        self.withdrawals.insert((call_id, staker.to_string()))
    }

    pub fn has_withdrawn(&self, call_id: u64, staker: &str) -> bool {
        self.withdrawals.contains(&(call_id, staker.to_string()))
    }
}

/// Accepted spellings for the yes/long side across both chains' encodings.
pub(crate) fn parse_side(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "long" => Some(true),
        "0" | "false" | "no" | "short" => Some(false),
        _ => None,
    }
}

fn scalar_field<'a>(event: &'a ChainEvent, name: &str) -> Result<&'a str, String> {
    event
        .scalar_field(name)
        .ok_or_else(|| format!("missing scalar field {name:?}"))
}

fn u64_field(event: &ChainEvent, name: &str) -> Result<u64, String> {
    let raw = scalar_field(event, name)?;
    raw.parse::<u64>()
        .map_err(|_| format!("field {name:?} is not a u64: {raw:?}"))
}

fn u128_field(event: &ChainEvent, name: &str) -> Result<u128, String> {
    let raw = scalar_field(event, name)?;
    raw.parse::<u128>()
        .map_err(|_| format!("field {name:?} is not a u128: {raw:?}"))
}

fn side_field(event: &ChainEvent, name: &str) -> Result<bool, String> {
    let raw = scalar_field(event, name)?;
    parse_side(raw).ok_or_else(|| format!("field {name:?} is not a side: {raw:?}"))
}
