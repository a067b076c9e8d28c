//! Configuration for the wallet ledger

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Ledger configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Data directory for RocksDB
    pub data_dir: PathBuf,

    /// Service name
    pub service_name: String,

    /// RocksDB configuration
    pub rocksdb: RocksDBConfig,

    /// Balance read configuration
    pub balance: BalanceConfig,

    /// Snapshot configuration
    pub snapshot: SnapshotConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data/wallet-ledger"),
            service_name: "wallet-ledger".to_string(),
            rocksdb: RocksDBConfig::default(),
            balance: BalanceConfig::default(),
            snapshot: SnapshotConfig::default(),
        }
    }
}

/// RocksDB configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RocksDBConfig {
    /// Write buffer size (MB)
    pub write_buffer_size_mb: usize,

    /// Max write buffers
    pub max_write_buffer_number: i32,

    /// Max background jobs (compaction + flush)
    pub max_background_jobs: i32,

    /// Enable statistics
    pub enable_statistics: bool,
}

impl Default for RocksDBConfig {
    fn default() -> Self {
        Self {
            write_buffer_size_mb: 64,
            max_write_buffer_number: 3,
            max_background_jobs: 4,
            enable_statistics: false,
        }
    }
}

/// How balances are derived from the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalanceStrategy {
    /// Sum every posting of the wallet
    FullScan,
    /// Latest snapshot plus postings after it
    Snapshot,
}

impl std::str::FromStr for BalanceStrategy {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "full_scan" => Ok(BalanceStrategy::FullScan),
            "snapshot" => Ok(BalanceStrategy::Snapshot),
            other => Err(crate::Error::Config(format!(
                "Unknown balance strategy: {}",
                other
            ))),
        }
    }
}

/// Balance read configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BalanceConfig {
    /// Strategy used by the balance calculator
    pub strategy: BalanceStrategy,
}

impl Default for BalanceConfig {
    fn default() -> Self {
        Self {
            strategy: BalanceStrategy::Snapshot,
        }
    }
}

/// Snapshot configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    /// Postings since the last snapshot that trigger a new one
    pub threshold: u64,

    /// Snapshots kept per wallet
    pub retention: usize,

    /// Interval of the all-wallets snapshot job (seconds)
    pub job_interval_secs: u64,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            threshold: 100,
            retention: 5,
            job_interval_secs: 3600,
        }
    }
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Config::default();

        if let Ok(data_dir) = std::env::var("WALLET_LEDGER_DATA_DIR") {
            config.data_dir = PathBuf::from(data_dir);
        }

        if let Ok(strategy) = std::env::var("WALLET_LEDGER_BALANCE_STRATEGY") {
            config.balance.strategy = strategy.parse()?;
        }

        if let Ok(threshold) = std::env::var("WALLET_LEDGER_SNAPSHOT_THRESHOLD") {
            config.snapshot.threshold = parse_env("WALLET_LEDGER_SNAPSHOT_THRESHOLD", &threshold)?;
        }

        if let Ok(retention) = std::env::var("WALLET_LEDGER_SNAPSHOT_RETENTION") {
            config.snapshot.retention = parse_env("WALLET_LEDGER_SNAPSHOT_RETENTION", &retention)?;
        }

        if let Ok(interval) = std::env::var("WALLET_LEDGER_SNAPSHOT_INTERVAL_SECS") {
            config.snapshot.job_interval_secs =
                parse_env("WALLET_LEDGER_SNAPSHOT_INTERVAL_SECS", &interval)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the services cannot run with
    pub fn validate(&self) -> crate::Result<()> {
        if self.snapshot.threshold == 0 {
            return Err(crate::Error::Config(
                "snapshot.threshold must be at least 1".to_string(),
            ));
        }
        if self.snapshot.retention == 0 {
            return Err(crate::Error::Config(
                "snapshot.retention must be at least 1".to_string(),
            ));
        }
        if self.snapshot.job_interval_secs == 0 {
            return Err(crate::Error::Config(
                "snapshot.job_interval_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> crate::Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e| crate::Error::Config(format!("Invalid {}: {}", name, e)))
}
