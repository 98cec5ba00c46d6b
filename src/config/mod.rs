use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub base: ChainIndexerConfig,
    #[serde(default)]
    pub stellar: ChainIndexerConfig,
    #[serde(default)]
    pub oracle: OracleConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Per-chain polling configuration. An empty `rpc_url` or `contract` leaves
/// that chain's indexer permanently idle (logged once at startup).
#[derive(Debug, Clone, Deserialize)]
pub struct ChainIndexerConfig {
    /// JSON-RPC endpoint URL.
    #[serde(default)]
    pub rpc_url: String,
    /// Contract address (Base) or contract id (Stellar) to filter events by.
    #[serde(default)]
    pub contract: String,
    /// Polling interval in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Explicit starting ledger/block. When unset, Stellar starts at
    /// head - 100 and Base at block 1.
    #[serde(default)]
    pub start_height: Option<u64>,
    /// Retries per poll cycle before the cycle is abandoned.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Fixed delay between retries in milliseconds.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OracleConfig {
    /// Hex-encoded 32-byte ed25519 seed - loaded from env ORACLE_SECRET_KEY,
    /// never stored in the config file. Empty = ephemeral key.
    #[serde(default)]
    pub secret_key: String,
    /// How often the settlement monitor scans for elapsed calls.
    #[serde(default = "default_scan_interval_ms")]
    pub scan_interval_ms: u64,
    /// Append-only JSONL audit trail of every signing attempt.
    #[serde(default = "default_audit_log_path")]
    pub audit_log_path: String,
    /// Hex-encoded public keys allowed to settle (single-signer model).
    #[serde(default)]
    pub authorized_pubkeys: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

fn default_poll_interval_ms() -> u64 {
    12_000
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_delay_ms() -> u64 {
    5_000
}
fn default_scan_interval_ms() -> u64 {
    12_000
}
fn default_audit_log_path() -> String {
    "oracle_audit.jsonl".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ChainIndexerConfig {
    fn default() -> Self {
        Self {
            rpc_url: String::new(),
            contract: String::new(),
            poll_interval_ms: default_poll_interval_ms(),
            start_height: None,
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            secret_key: String::new(),
            scan_interval_ms: default_scan_interval_ms(),
            audit_log_path: default_audit_log_path(),
            authorized_pubkeys: Vec::new(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Config {
    /// Load config from a TOML file, then overlay environment variables for secrets.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;
        config.overlay_env();
        Ok(config)
    }

    /// Load a config entirely from environment variables (no file needed).
    pub fn from_env() -> Self {
        let mut config = Config {
            base: ChainIndexerConfig {
                rpc_url: std::env::var("BASE_RPC_URL").unwrap_or_default(),
                contract: std::env::var("BASE_CONTRACT").unwrap_or_default(),
                ..ChainIndexerConfig::default()
            },
            stellar: ChainIndexerConfig {
                rpc_url: std::env::var("STELLAR_RPC_URL").unwrap_or_default(),
                contract: std::env::var("STELLAR_CONTRACT").unwrap_or_default(),
                ..ChainIndexerConfig::default()
            },
            oracle: OracleConfig::default(),
            logging: LoggingConfig::default(),
        };
        config.overlay_env();
        config
    }

    /// Secrets come from the environment only, never from the file.
    fn overlay_env(&mut self) {
        if let Ok(key) = std::env::var("ORACLE_SECRET_KEY") {
            self.oracle.secret_key = key;
        }
    }
}
