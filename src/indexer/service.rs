//! Combined lifecycle for both chain indexers.
//!
//! Owns one Base and one Stellar indexer over a shared store. The chains
//! are fault-isolated: each runs its own loop, and one chain being down,
//! unconfigured, or failing never halts the other.

use crate::config::Config;
use crate::indexer::base::BaseIndexer;
use crate::indexer::stellar::StellarIndexer;
use crate::indexer::{ChainIndexer, IndexerStatus, PollConfig};
use crate::rpc::{EvmRpc, HttpEvmRpc, HttpSorobanRpc, SorobanRpc};
use crate::store::{EventStore, StoreStats};
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

/// Per-chain slice of the combined status.
#[derive(Debug, Clone, Serialize)]
pub struct ChainStatus {
    #[serde(flatten)]
    pub indexer: IndexerStatus,
    #[serde(flatten)]
    pub store: StoreStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub base: ChainStatus,
    pub stellar: ChainStatus,
}

pub struct MultiChainIndexerService<E: EvmRpc = HttpEvmRpc, S: SorobanRpc = HttpSorobanRpc> {
    base: Arc<ChainIndexer<BaseIndexer<E>>>,
    stellar: Arc<ChainIndexer<StellarIndexer<S>>>,
    store: Arc<EventStore>,
}

impl MultiChainIndexerService {
    /// Wire both indexers from config over HTTP JSON-RPC. A chain with no
    /// endpoint or contract configured comes up permanently idle.
    pub fn from_config(config: &Config, store: Arc<EventStore>) -> Self {
        let base_configured =
            !config.base.rpc_url.is_empty() && !config.base.contract.is_empty();
        let base = ChainIndexer::new(
            BaseIndexer::new(
                HttpEvmRpc::new(config.base.rpc_url.clone()),
                config.base.contract.clone(),
                Arc::clone(&store),
            ),
            PollConfig::from(&config.base),
            base_configured,
        );

        let stellar_configured =
            !config.stellar.rpc_url.is_empty() && !config.stellar.contract.is_empty();
        let stellar = ChainIndexer::new(
            StellarIndexer::new(
                HttpSorobanRpc::new(config.stellar.rpc_url.clone()),
                config.stellar.contract.clone(),
                Arc::clone(&store),
            ),
            PollConfig::from(&config.stellar),
            stellar_configured,
        );

        Self::new(base, stellar, store)
    }
}

impl<E: EvmRpc, S: SorobanRpc> MultiChainIndexerService<E, S> {
    pub fn new(
        base: ChainIndexer<BaseIndexer<E>>,
        stellar: ChainIndexer<StellarIndexer<S>>,
        store: Arc<EventStore>,
    ) -> Self {
        Self {
            base: Arc::new(base),
            stellar: Arc::new(stellar),
            store,
        }
    }

    pub fn start_all(&self) {
        self.base.start();
        self.stellar.start();
        info!(
            base = self.base.is_running(),
            stellar = self.stellar.is_running(),
            "multi-chain indexer service started"
        );
    }

    pub fn stop_all(&self) {
        self.base.stop();
        self.stellar.stop();
    }

    pub fn status(&self) -> ServiceStatus {
        ServiceStatus {
            base: ChainStatus {
                indexer: self.base.status(),
                store: self.store.stats(self.base.chain()),
            },
            stellar: ChainStatus {
                indexer: self.stellar.status(),
                store: self.store.stats(self.stellar.chain()),
            },
        }
    }

    pub fn store(&self) -> &Arc<EventStore> {
        &self.store
    }
}
