use callcast::config::Config;
use callcast::indexer::service::MultiChainIndexerService;
use callcast::oracle::monitor::{OracleMonitor, OutcomeSubmitter};
use callcast::oracle::{AuditLog, AuthorizedOracles, OracleKeypair, SignedOutcome};
use callcast::store::EventStore;
use anyhow::Result;
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Relay seam for the daemon: the signed tuple is logged for the external
/// transaction relay to pick up. Embedding services swap in a real
/// submitter through the library surface.
struct LogRelay {
    authorized: Arc<AuthorizedOracles>,
}

#[async_trait]
impl OutcomeSubmitter for LogRelay {
    async fn submit(&self, signed: &SignedOutcome) -> Result<()> {
        if !self.authorized.is_authorized(&signed.oracle_pubkey) {
            anyhow::bail!("oracle key is not authorized to settle");
        }
        info!(
            call_id = signed.call_id,
            outcome = signed.outcome,
            final_price = %signed.final_price,
            timestamp = signed.timestamp,
            oracle_pubkey = %hex::encode(signed.oracle_pubkey),
            signature = %hex::encode(signed.signature),
            "signed outcome ready for relay"
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Load config
    let config = if Path::new("callcast.toml").exists() {
        Config::load(Path::new("callcast.toml"))?
    } else {
        info!("no callcast.toml found, using env-only config");
        Config::from_env()
    };

    // Initialize logging
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));

    if config.logging.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .init();
    }

    info!("callcast v{} starting", env!("CARGO_PKG_VERSION"));

    // --- Event store and chain indexers ---
    let store = Arc::new(EventStore::new());
    let service = Arc::new(MultiChainIndexerService::from_config(
        &config,
        Arc::clone(&store),
    ));
    service.start_all();

    // --- Oracle identity ---
    let keypair = if config.oracle.secret_key.is_empty() {
        warn!("ORACLE_SECRET_KEY not set - using an ephemeral signing key");
        OracleKeypair::generate()
    } else {
        OracleKeypair::from_seed_hex(&config.oracle.secret_key)?
    };
    let keypair = Arc::new(keypair);
    info!(oracle = %hex::encode(keypair.public_key()), "oracle identity loaded");

    let authorized = Arc::new(AuthorizedOracles::new());
    authorized.authorize(keypair.public_key());
    for pubkey in &config.oracle.authorized_pubkeys {
        if let Err(e) = authorized.authorize_hex(pubkey) {
            error!(pubkey = %pubkey, error = %e, "ignoring bad authorized oracle key");
        }
    }

    // --- Settlement monitor ---
    // Registrations arrive through the library surface from whichever
    // service knows each call's price feed and decision rule.
    let monitor = Arc::new(OracleMonitor::new(
        Arc::clone(&keypair),
        Arc::new(LogRelay { authorized }),
        Arc::new(AuditLog::new(&config.oracle.audit_log_path)),
        Duration::from_millis(config.oracle.scan_interval_ms),
    ));
    monitor.start();

    // --- Periodic status + shutdown ---
    let mut status_tick = tokio::time::interval(Duration::from_secs(60));
    status_tick.tick().await; // first tick is immediate, skip it

    loop {
        tokio::select! {
            _ = status_tick.tick() => {
                let status = service.status();
                info!(
                    base_running = status.base.indexer.running,
                    base_height = ?status.base.indexer.last_indexed,
                    base_events = status.base.store.total_events,
                    stellar_running = status.stellar.indexer.running,
                    stellar_height = ?status.stellar.indexer.last_indexed,
                    stellar_events = status.stellar.store.total_events,
                    pending_settlements = monitor.pending_count(),
                    "status"
                );
            }

            _ = tokio::signal::ctrl_c() => {
                info!("shutting down...");
                monitor.stop();
                service.stop_all();
                break;
            }
        }
    }

    Ok(())
}
