//! Composition root
//!
//! Opens the store once and wires every service around the shared handle.

use crate::{
    balance::BalanceCalculator,
    fx::{FixedRateProvider, FxService, RateProvider},
    idempotency::IdempotentLedger,
    ledger::LedgerService,
    metrics::Metrics,
    snapshot::SnapshotService,
    storage::{Storage, StorageStats},
    wallet::WalletService,
    Config, Error, Result,
};
use std::sync::Arc;

/// Wallet ledger with all services wired
#[derive(Debug, Clone)]
pub struct Engine {
    config: Config,
    storage: Arc<Storage>,
    metrics: Metrics,
    calculator: BalanceCalculator,
    snapshots: SnapshotService,
    wallets: WalletService,
    ledger: LedgerService,
    idempotent: IdempotentLedger,
    fx: FxService,
}

impl Engine {
    /// Open with the built-in rate table
    pub fn open(config: Config) -> Result<Self> {
        Self::open_with_rates(config, Arc::new(FixedRateProvider::new()))
    }

    /// Open with a caller-supplied rate provider
    pub fn open_with_rates(config: Config, rates: Arc<dyn RateProvider>) -> Result<Self> {
        config.validate()?;

        let storage = Arc::new(Storage::open(&config)?);
        let metrics = Metrics::new()
            .map_err(|e| Error::Config(format!("Failed to register metrics: {}", e)))?;

        let calculator =
            BalanceCalculator::new(storage.clone(), config.balance.strategy, metrics.clone());
        let snapshots = SnapshotService::new(
            storage.clone(),
            config.snapshot.threshold,
            config.snapshot.retention,
            metrics.clone(),
        );
        let wallets = WalletService::new(storage.clone(), calculator.clone());
        let ledger = LedgerService::new(
            storage.clone(),
            calculator.clone(),
            snapshots.clone(),
            metrics.clone(),
        );
        let idempotent = IdempotentLedger::new(storage.clone(), ledger.clone(), metrics.clone());
        let fx = FxService::new(storage.clone(), ledger.clone(), rates);

        tracing::info!(
            service = %config.service_name,
            strategy = ?config.balance.strategy,
            snapshot_threshold = config.snapshot.threshold,
            snapshot_retention = config.snapshot.retention,
            "Wallet ledger opened"
        );

        Ok(Self {
            config,
            storage,
            metrics,
            calculator,
            snapshots,
            wallets,
            ledger,
            idempotent,
            fx,
        })
    }

    /// Active configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Metrics collector
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Balance calculator
    pub fn balances(&self) -> &BalanceCalculator {
        &self.calculator
    }

    /// Snapshot service
    pub fn snapshots(&self) -> &SnapshotService {
        &self.snapshots
    }

    /// Wallet service
    pub fn wallets(&self) -> &WalletService {
        &self.wallets
    }

    /// Ledger posting service
    pub fn ledger(&self) -> &LedgerService {
        &self.ledger
    }

    /// Idempotent posting service
    pub fn idempotent(&self) -> &IdempotentLedger {
        &self.idempotent
    }

    /// FX conversion service
    pub fn fx(&self) -> &FxService {
        &self.fx
    }

    /// Approximate storage statistics
    pub fn stats(&self) -> Result<StorageStats> {
        self.storage.get_stats()
    }
}
