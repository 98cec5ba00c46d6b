//! Shared library modules for the callcast settlement engine.
//!
//! Exposes the event store, chain indexers, and oracle so embedding
//! services (the REST layer, the transaction relay) can consume them
//! without going through the daemon binary.

pub mod config;
pub mod events;
pub mod indexer;
pub mod oracle;
pub mod payout;
pub mod rpc;
pub mod store;
