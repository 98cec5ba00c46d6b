//! Settlement scheduler.
//!
//! Holds the calls waiting to settle and, on a fixed interval, settles the
//! ones whose deadline has passed: fetch price, decide outcome, sign, hand
//! the attestation to the relay. An entry leaves the pending map only after
//! a successful submission; a failed attempt is retried on the next tick.

use crate::oracle::{
    can_settle_call, sign_outcome, AuditEntry, AuditLog, OracleKeypair, SignedOutcome,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::BoxFuture;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Externally supplied price feed for one call.
pub type PriceSource = Arc<dyn Fn() -> BoxFuture<'static, Result<u128>> + Send + Sync>;

/// Maps the fetched price to the call's boolean outcome.
pub type OutcomeDecider = Arc<dyn Fn(u128) -> bool + Send + Sync>;

/// Wrap an async closure as a `PriceSource`.
pub fn price_source<F, Fut>(f: F) -> PriceSource
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<u128>> + Send + 'static,
{
    Arc::new(move || Box::pin(f()))
}

/// The relay seam: whatever carries the signed tuple on-chain.
#[async_trait]
pub trait OutcomeSubmitter: Send + Sync + 'static {
    async fn submit(&self, signed: &SignedOutcome) -> Result<()>;
}

struct PendingSettlement {
    end_ts: u64,
    price: PriceSource,
    decide: OutcomeDecider,
}

pub struct OracleMonitor {
    keypair: Arc<OracleKeypair>,
    submitter: Arc<dyn OutcomeSubmitter>,
    audit: Arc<AuditLog>,
    pending: DashMap<u64, PendingSettlement>,
    scan_interval: Duration,
    running: AtomicBool,
    stop_requested: AtomicBool,
    shutdown: Notify,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl OracleMonitor {
    pub fn new(
        keypair: Arc<OracleKeypair>,
        submitter: Arc<dyn OutcomeSubmitter>,
        audit: Arc<AuditLog>,
        scan_interval: Duration,
    ) -> Self {
        Self {
            keypair,
            submitter,
            audit,
            pending: DashMap::new(),
            scan_interval,
            running: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            shutdown: Notify::new(),
            task: Mutex::new(None),
        }
    }

    /// Register a call for settlement. Safe to call from any task while the
    /// scan loop runs; a second registration for the same call replaces the
    /// first.
    pub fn register(&self, call_id: u64, end_ts: u64, price: PriceSource, decide: OutcomeDecider) {
        debug!(call_id = call_id, end_ts = end_ts, "settlement registered");
        self.pending.insert(
            call_id,
            PendingSettlement {
                end_ts,
                price,
                decide,
            },
        );
    }

    /// Drop a registration without settling it.
    pub fn unregister(&self, call_id: u64) -> bool {
        self.pending.remove(&call_id).is_some()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start the scan loop. A no-op when already running.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            debug!("oracle monitor already running");
            return;
        }
        self.stop_requested.store(false, Ordering::SeqCst);

        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            this.run_loop().await;
        });
        *self.task.lock().unwrap() = Some(handle);

        info!(
            interval_ms = self.scan_interval.as_millis() as u64,
            oracle = %hex::encode(self.keypair.public_key()),
            "oracle monitor started"
        );
    }

    /// Stop the scan loop. Idempotent; pending registrations are kept for
    /// the next start.
    pub fn stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        if self.running.swap(false, Ordering::SeqCst) {
            info!("oracle monitor stopping");
        }
        self.shutdown.notify_waiters();
    }

    async fn run_loop(&self) {
        let mut ticker = tokio::time::interval(self.scan_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.shutdown.notified() => break,
            }
            if self.stop_requested.load(Ordering::SeqCst) {
                break;
            }
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs();
            self.scan_once(now).await;
            if self.stop_requested.load(Ordering::SeqCst) {
                break;
            }
        }
        debug!("oracle monitor loop exited");
    }

    /// One settlement pass over the pending map. Returns how many calls
    /// were settled and removed.
    pub async fn scan_once(&self, now: u64) -> usize {
        let due: Vec<u64> = self
            .pending
            .iter()
            .filter(|entry| can_settle_call(now, entry.value().end_ts))
            .map(|entry| *entry.key())
            .collect();

        let mut settled = 0;
        for call_id in due {
            // Clone the hooks out so no shard lock is held across awaits.
            let Some((price, decide)) = self
                .pending
                .get(&call_id)
                .map(|e| (Arc::clone(&e.price), Arc::clone(&e.decide)))
            else {
                continue;
            };

            match self.settle(call_id, now, price, decide).await {
                Ok(signed) => {
                    self.pending.remove(&call_id);
                    settled += 1;
                    info!(
                        call_id = call_id,
                        outcome = signed.outcome,
                        final_price = %signed.final_price,
                        "call settled and submitted"
                    );
                }
                Err(e) => {
                    warn!(
                        call_id = call_id,
                        error = %e,
                        "settlement attempt failed, left pending for next tick"
                    );
                }
            }
        }
        settled
    }

    async fn settle(
        &self,
        call_id: u64,
        now: u64,
        price: PriceSource,
        decide: OutcomeDecider,
    ) -> Result<SignedOutcome> {
        let final_price = price()
            .await
            .with_context(|| format!("price fetch for call {call_id}"))?;
        let outcome = decide(final_price);
        let signed = sign_outcome(&self.keypair, call_id, outcome, final_price, now);

        match self.submitter.submit(&signed).await {
            Ok(()) => {
                self.audit.append(&AuditEntry::new(&signed, true, None));
                Ok(signed)
            }
            Err(e) => {
                self.audit
                    .append(&AuditEntry::new(&signed, false, Some(e.to_string())));
                Err(e).with_context(|| format!("submission for call {call_id}"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::verify_outcome;
    use std::sync::atomic::AtomicUsize;

    struct MockRelay {
        submitted: Mutex<Vec<SignedOutcome>>,
        fail_next: AtomicUsize,
    }

    impl MockRelay {
        fn new() -> Self {
            Self {
                submitted: Mutex::new(Vec::new()),
                fail_next: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl OutcomeSubmitter for MockRelay {
        async fn submit(&self, signed: &SignedOutcome) -> Result<()> {
            if self.fail_next.load(Ordering::SeqCst) > 0 {
                self.fail_next.fetch_sub(1, Ordering::SeqCst);
                anyhow::bail!("relay unavailable");
            }
            self.submitted.lock().unwrap().push(signed.clone());
            Ok(())
        }
    }

    fn monitor_with(relay: Arc<MockRelay>, audit_path: &std::path::Path) -> Arc<OracleMonitor> {
        Arc::new(OracleMonitor::new(
            Arc::new(OracleKeypair::generate()),
            relay,
            Arc::new(AuditLog::new(audit_path)),
            Duration::from_secs(3600),
        ))
    }

    fn fixed_price(price: u128) -> PriceSource {
        price_source(move || async move { Ok(price) })
    }

    fn above(threshold: u128) -> OutcomeDecider {
        Arc::new(move |price| price >= threshold)
    }

    #[tokio::test]
    async fn settles_due_call_and_removes_it() {
        let dir = tempfile::tempdir().unwrap();
        let relay = Arc::new(MockRelay::new());
        let monitor = monitor_with(Arc::clone(&relay), &dir.path().join("audit.jsonl"));

        monitor.register(1, 1_000_000, fixed_price(105), above(100));

        // Not yet eligible.
        assert_eq!(monitor.scan_once(999_999).await, 0);
        assert_eq!(monitor.pending_count(), 1);
        assert!(relay.submitted.lock().unwrap().is_empty());

        // Eligible exactly at the deadline.
        assert_eq!(monitor.scan_once(1_000_000).await, 1);
        assert_eq!(monitor.pending_count(), 0);

        let submitted = relay.submitted.lock().unwrap();
        assert_eq!(submitted.len(), 1);
        let signed = &submitted[0];
        assert_eq!(signed.call_id, 1);
        assert!(signed.outcome);
        assert_eq!(signed.final_price, 105);
        assert_eq!(signed.timestamp, 1_000_000);
        assert!(verify_outcome(
            signed.call_id,
            signed.outcome,
            signed.final_price,
            signed.timestamp,
            &signed.oracle_pubkey,
            &signed.signature,
        ));
    }

    #[tokio::test]
    async fn failed_submission_stays_pending_and_retries() {
        let dir = tempfile::tempdir().unwrap();
        let audit_path = dir.path().join("audit.jsonl");
        let relay = Arc::new(MockRelay::new());
        relay.fail_next.store(1, Ordering::SeqCst);
        let monitor = monitor_with(Arc::clone(&relay), &audit_path);

        monitor.register(1, 500, fixed_price(42), above(100));

        assert_eq!(monitor.scan_once(600).await, 0);
        assert_eq!(monitor.pending_count(), 1);

        // Next tick retries the same call, which now goes through.
        assert_eq!(monitor.scan_once(700).await, 1);
        assert_eq!(monitor.pending_count(), 0);

        let submitted = relay.submitted.lock().unwrap();
        assert_eq!(submitted.len(), 1);
        assert!(!submitted[0].outcome);

        // Both signing attempts are on the audit trail.
        let contents = std::fs::read_to_string(&audit_path).unwrap();
        let lines: Vec<serde_json::Value> = contents
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["submitted"], false);
        assert_eq!(lines[1]["submitted"], true);
    }

    #[tokio::test]
    async fn price_fetch_failure_leaves_entry_pending() {
        let dir = tempfile::tempdir().unwrap();
        let relay = Arc::new(MockRelay::new());
        let monitor = monitor_with(Arc::clone(&relay), &dir.path().join("audit.jsonl"));

        monitor.register(
            2,
            100,
            price_source(|| async { anyhow::bail!("feed offline") }),
            above(1),
        );

        assert_eq!(monitor.scan_once(200).await, 0);
        assert_eq!(monitor.pending_count(), 1);
        assert!(relay.submitted.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn only_due_entries_settle() {
        let dir = tempfile::tempdir().unwrap();
        let relay = Arc::new(MockRelay::new());
        let monitor = monitor_with(Arc::clone(&relay), &dir.path().join("audit.jsonl"));

        monitor.register(1, 100, fixed_price(10), above(1));
        monitor.register(2, 900, fixed_price(10), above(1));

        assert_eq!(monitor.scan_once(500).await, 1);
        assert_eq!(monitor.pending_count(), 1);
        assert!(monitor.unregister(2));
        assert_eq!(monitor.pending_count(), 0);
    }

    #[tokio::test]
    async fn start_stop_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let relay = Arc::new(MockRelay::new());
        let monitor = monitor_with(relay, &dir.path().join("audit.jsonl"));

        monitor.start();
        assert!(monitor.is_running());
        monitor.start();
        assert!(monitor.is_running());

        monitor.stop();
        assert!(!monitor.is_running());
        monitor.stop();
        assert!(!monitor.is_running());
    }
}
