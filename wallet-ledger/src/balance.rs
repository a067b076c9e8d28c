//! Balance derivation from the ledger
//!
//! The ledger is the only source of truth. Two strategies compute the same
//! value:
//!
//! - **Full scan**: Σ(signed amount) over every posting of the wallet.
//! - **Snapshot**: latest snapshot balance + Σ(signed amount) of postings
//!   strictly after `snapshot_at`, falling back to a full scan when no
//!   snapshot exists.

use crate::{
    config::BalanceStrategy,
    metrics::Metrics,
    money::{accumulate, Currency, Money},
    storage::Storage,
    Result,
};
use std::sync::Arc;
use uuid::Uuid;

/// Derives wallet balances from the ledger
#[derive(Debug, Clone)]
pub struct BalanceCalculator {
    storage: Arc<Storage>,
    strategy: BalanceStrategy,
    metrics: Metrics,
}

impl BalanceCalculator {
    /// Create calculator with the given strategy
    pub fn new(storage: Arc<Storage>, strategy: BalanceStrategy, metrics: Metrics) -> Self {
        Self {
            storage,
            strategy,
            metrics,
        }
    }

    /// Configured strategy
    pub fn strategy(&self) -> BalanceStrategy {
        self.strategy
    }

    /// Current balance of the wallet in `currency`
    pub fn calculate_balance(&self, wallet_id: Uuid, currency: Currency) -> Result<Money> {
        match self.strategy {
            BalanceStrategy::FullScan => self.full_scan_balance(wallet_id, currency),
            BalanceStrategy::Snapshot => self.snapshot_balance(wallet_id, currency),
        }
    }

    /// Sum of every posting, ignoring snapshots
    pub fn full_scan_balance(&self, wallet_id: Uuid, currency: Currency) -> Result<Money> {
        self.metrics.record_balance_read("full_scan");
        let signed = self.storage.sum_signed_amount(wallet_id, currency)?;
        Money::new(signed, currency)
    }

    /// Latest snapshot plus the postings after it
    pub fn snapshot_balance(&self, wallet_id: Uuid, currency: Currency) -> Result<Money> {
        let snapshot = match self.storage.latest_snapshot(wallet_id)? {
            // Snapshots only cover the wallet's base currency
            Some(snapshot) if snapshot.balance.currency() == currency => snapshot,
            _ => {
                tracing::debug!(wallet_id = %wallet_id, "No snapshot found, using full scan");
                return self.full_scan_balance(wallet_id, currency);
            }
        };

        self.metrics.record_balance_read("snapshot");
        let delta = self
            .storage
            .sum_signed_amount_after(wallet_id, currency, snapshot.snapshot_at)?;
        let total = accumulate(snapshot.balance.amount(), delta)?;

        tracing::debug!(
            wallet_id = %wallet_id,
            snapshot_balance = %snapshot.balance.amount(),
            delta = %delta,
            total = %total,
            "Balance calculated with snapshot"
        );

        Money::new(total, currency)
    }
}
