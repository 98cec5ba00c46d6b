//! Abstract chain polling loop.
//!
//! `ChainIndexer` owns the lifecycle every chain shares: start/stop, an
//! immediate poll followed by recurring ticks, bounded retries with a fixed
//! delay, and a cursor that only advances when an entire
//! fetch+decode+store cycle succeeds. The chain-specific halves (how to
//! read the head, how to ingest a range) plug in through `ChainPoller`.
//!
//! Delivery contract: a failed cycle leaves the cursor unchanged, so the
//! next tick retries the same range - at-least-once. Exactly-once effect is
//! the store's job via its dedup key.

pub mod abi;
pub mod base;
pub mod service;
pub mod stellar;

use crate::config::ChainIndexerConfig;
use crate::events::Chain;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Chain-specific half of an indexer.
#[async_trait]
pub trait ChainPoller: Send + Sync + 'static {
    fn chain(&self) -> Chain;

    /// Current chain head (ledger sequence or block number).
    async fn chain_head(&self) -> anyhow::Result<u64>;

    /// Fetch, decode, and store every event in the inclusive range.
    /// Returns how many events were newly stored.
    async fn ingest_range(&self, from: u64, to: u64) -> anyhow::Result<usize>;

    /// First cursor position when none is configured.
    fn default_start(&self, head: u64) -> u64;
}

#[derive(Debug, Clone)]
pub struct PollConfig {
    pub poll_interval: Duration,
    pub start_height: Option<u64>,
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(12_000),
            start_height: None,
            max_retries: 3,
            retry_delay: Duration::from_millis(5_000),
        }
    }
}

impl From<&ChainIndexerConfig> for PollConfig {
    fn from(config: &ChainIndexerConfig) -> Self {
        Self {
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            start_height: config.start_height,
            max_retries: config.max_retries,
            retry_delay: Duration::from_millis(config.retry_delay_ms),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexerStatus {
    pub chain: Chain,
    pub running: bool,
    pub last_indexed: Option<u64>,
    pub events_indexed: u64,
    pub cycles_completed: u64,
    pub cycles_failed: u64,
}

const UNSET: u64 = u64::MAX;

struct IndexerState {
    /// Loop liveness: guards double-start.
    running: AtomicBool,
    /// Set by stop(); every await in the cycle is followed by a check so
    /// in-flight results are discarded instead of mutating state.
    stop_requested: AtomicBool,
    /// Next height to poll from. UNSET until the first head fetch.
    cursor: AtomicU64,
    last_indexed: AtomicU64,
    events_indexed: AtomicU64,
    cycles_completed: AtomicU64,
    cycles_failed: AtomicU64,
    shutdown: Notify,
}

impl IndexerState {
    fn new() -> Self {
        Self {
            running: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            cursor: AtomicU64::new(UNSET),
            last_indexed: AtomicU64::new(UNSET),
            events_indexed: AtomicU64::new(0),
            cycles_completed: AtomicU64::new(0),
            cycles_failed: AtomicU64::new(0),
            shutdown: Notify::new(),
        }
    }
}

/// Generic polling indexer over one chain.
pub struct ChainIndexer<P: ChainPoller> {
    poller: Arc<P>,
    config: PollConfig,
    /// False when the chain's RPC endpoint or contract is missing; the
    /// indexer then stays permanently idle instead of crashing.
    configured: bool,
    state: Arc<IndexerState>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<P: ChainPoller> ChainIndexer<P> {
    pub fn new(poller: P, config: PollConfig, configured: bool) -> Self {
        Self {
            poller: Arc::new(poller),
            config,
            configured,
            state: Arc::new(IndexerState::new()),
            task: Mutex::new(None),
        }
    }

    pub fn chain(&self) -> Chain {
        self.poller.chain()
    }

    pub fn is_running(&self) -> bool {
        self.state.running.load(Ordering::SeqCst)
    }

    pub fn cursor(&self) -> Option<u64> {
        match self.state.cursor.load(Ordering::SeqCst) {
            UNSET => None,
            c => Some(c),
        }
    }

    pub fn status(&self) -> IndexerStatus {
        IndexerStatus {
            chain: self.poller.chain(),
            running: self.is_running(),
            last_indexed: match self.state.last_indexed.load(Ordering::SeqCst) {
                UNSET => None,
                h => Some(h),
            },
            events_indexed: self.state.events_indexed.load(Ordering::SeqCst),
            cycles_completed: self.state.cycles_completed.load(Ordering::SeqCst),
            cycles_failed: self.state.cycles_failed.load(Ordering::SeqCst),
        }
    }

    /// Start polling: one immediate cycle, then one per interval. A no-op
    /// when already running or when the chain was never configured.
    pub fn start(self: &Arc<Self>) {
        if !self.configured {
            warn!(
                chain = %self.poller.chain(),
                "indexer not configured (missing rpc_url or contract), staying idle"
            );
            return;
        }
        if self.state.running.swap(true, Ordering::SeqCst) {
            debug!(chain = %self.poller.chain(), "indexer already running");
            return;
        }
        self.state.stop_requested.store(false, Ordering::SeqCst);

        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            this.run_loop().await;
        });
        *self.task.lock().unwrap() = Some(handle);

        info!(
            chain = %self.poller.chain(),
            interval_ms = self.config.poll_interval.as_millis() as u64,
            "indexer started"
        );
    }

    /// Stop polling. Idempotent and safe mid-fetch: the loop winds down at
    /// its next await point and any in-flight fetch result is discarded.
    pub fn stop(&self) {
        self.state.stop_requested.store(true, Ordering::SeqCst);
        if self.state.running.swap(false, Ordering::SeqCst) {
            info!(chain = %self.poller.chain(), "indexer stopping");
        }
        self.state.shutdown.notify_waiters();
    }

    async fn run_loop(&self) {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        // A tick that lands while the previous cycle is still in flight is
        // delayed, never run concurrently against the same cursor.
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.state.shutdown.notified() => break,
            }
            if self.stopped() {
                break;
            }
            self.poll_cycle().await;
            if self.stopped() {
                break;
            }
        }
        debug!(chain = %self.poller.chain(), "poll loop exited");
    }

    fn stopped(&self) -> bool {
        self.state.stop_requested.load(Ordering::SeqCst)
    }

    /// One poll cycle with bounded retries. After `max_retries` failed
    /// re-attempts the cycle is abandoned, cursor untouched; the next tick
    /// retries the same range.
    async fn poll_cycle(&self) {
        let mut attempt: u32 = 0;
        loop {
            match self.try_cycle().await {
                Ok(()) => return,
                Err(e) => {
                    if self.stopped() {
                        return;
                    }
                    if attempt >= self.config.max_retries {
                        self.state.cycles_failed.fetch_add(1, Ordering::SeqCst);
                        warn!(
                            chain = %self.poller.chain(),
                            error = %e,
                            attempts = attempt + 1,
                            "poll cycle abandoned, cursor unchanged"
                        );
                        return;
                    }
                    attempt += 1;
                    debug!(
                        chain = %self.poller.chain(),
                        error = %e,
                        attempt = attempt,
                        "poll cycle failed, retrying"
                    );
                    tokio::time::sleep(self.config.retry_delay).await;
                    if self.stopped() {
                        return;
                    }
                }
            }
        }
    }

    async fn try_cycle(&self) -> anyhow::Result<()> {
        let head = self.poller.chain_head().await?;
        if self.stopped() {
            return Ok(());
        }

        let cursor = match self.state.cursor.load(Ordering::SeqCst) {
            UNSET => self
                .config
                .start_height
                .unwrap_or_else(|| self.poller.default_start(head)),
            c => c,
        };

        if cursor > head {
            debug!(chain = %self.poller.chain(), cursor = cursor, head = head, "nothing to poll");
            self.state.cycles_completed.fetch_add(1, Ordering::SeqCst);
            return Ok(());
        }

        let stored = self.poller.ingest_range(cursor, head).await?;
        if self.stopped() {
            // Fetch resolved after stop(): discard, mutate nothing.
            return Ok(());
        }

        // The entire fetch+decode+store cycle succeeded: advance past head.
        self.state.cursor.store(head + 1, Ordering::SeqCst);
        self.state.last_indexed.store(head, Ordering::SeqCst);
        self.state
            .events_indexed
            .fetch_add(stored as u64, Ordering::SeqCst);
        self.state.cycles_completed.fetch_add(1, Ordering::SeqCst);

        if stored > 0 {
            info!(
                chain = %self.poller.chain(),
                from = cursor,
                to = head,
                stored = stored,
                "indexed range"
            );
        } else {
            debug!(chain = %self.poller.chain(), from = cursor, to = head, "range empty");
        }
        Ok(())
    }
}
