//! Balance snapshots
//!
//! A snapshot checkpoints a wallet's cumulative balance at a ledger instant so
//! that balance reads only fold the postings written after it. Snapshots are an
//! optimization: a missing or stale snapshot degrades read cost, never
//! correctness, because the full scan remains available.
//!
//! Snapshots are written inside a unit of work, so the captured balance, count
//! and cut-off instant are consistent with every committed posting. Pruning runs
//! after the commit and its failures are only logged.

use crate::{
    metrics::Metrics,
    money::{accumulate, Money},
    storage::{Storage, UnitOfWork},
    types::{BalanceSnapshot, EntityMeta},
    Result,
};
use rust_decimal::Decimal;
use std::sync::Arc;
use uuid::Uuid;

/// Outcome of a batch snapshot run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotRunReport {
    /// Wallets visited
    pub examined: usize,
    /// Snapshots written
    pub created: usize,
    /// Wallets whose snapshot attempt failed
    pub failed: usize,
}

/// Creates, reads and prunes balance snapshots
#[derive(Debug, Clone)]
pub struct SnapshotService {
    storage: Arc<Storage>,
    threshold: u64,
    retention: usize,
    metrics: Metrics,
}

impl SnapshotService {
    /// Create service
    ///
    /// `threshold` is the number of postings since the last snapshot that
    /// triggers a new one; `retention` is the number of snapshots kept per
    /// wallet.
    pub fn new(storage: Arc<Storage>, threshold: u64, retention: usize, metrics: Metrics) -> Self {
        Self {
            storage,
            threshold: threshold.max(1),
            retention: retention.max(1),
            metrics,
        }
    }

    /// Snapshot the wallet if enough postings accumulated since the last one
    pub fn create_snapshot_if_needed(&self, wallet_id: Uuid) -> Result<Option<BalanceSnapshot>> {
        let threshold = self.threshold;
        let created = self.storage.unit_of_work(|uow| {
            let storage = uow.storage();
            let since_last = match storage.latest_snapshot(wallet_id)? {
                Some(latest) => storage.count_transactions_after(wallet_id, latest.snapshot_at)?,
                None => storage.count_transactions(wallet_id)?,
            };

            if since_last < threshold {
                return Ok(None);
            }

            tracing::info!(
                wallet_id = %wallet_id,
                transactions_since_last = since_last,
                "Creating snapshot"
            );
            write_snapshot(uow, wallet_id).map(Some)
        })?;

        if let Some(snapshot) = &created {
            self.after_create(snapshot);
        }
        Ok(created)
    }

    /// Snapshot the wallet unconditionally
    pub fn create_snapshot(&self, wallet_id: Uuid) -> Result<BalanceSnapshot> {
        let snapshot = self
            .storage
            .unit_of_work(|uow| write_snapshot(uow, wallet_id))?;
        self.after_create(&snapshot);
        Ok(snapshot)
    }

    /// Snapshot every wallet that needs it
    ///
    /// A failure on one wallet is logged and counted; the run continues with
    /// the next wallet.
    pub fn create_snapshots_for_all_wallets(&self) -> Result<SnapshotRunReport> {
        tracing::info!("Starting batch snapshot creation for all wallets");

        let mut report = SnapshotRunReport::default();
        for wallet in self.storage.all_wallets()? {
            report.examined += 1;
            match self.create_snapshot_if_needed(wallet.id) {
                Ok(Some(_)) => report.created += 1,
                Ok(None) => {}
                Err(e) => {
                    report.failed += 1;
                    self.metrics.record_snapshot_failure();
                    tracing::error!(wallet_id = %wallet.id, error = %e, "Failed to create snapshot");
                }
            }
        }

        tracing::info!(
            examined = report.examined,
            created = report.created,
            failed = report.failed,
            "Batch snapshot creation completed"
        );
        Ok(report)
    }

    /// Latest snapshot of the wallet
    pub fn latest_snapshot(&self, wallet_id: Uuid) -> Result<Option<BalanceSnapshot>> {
        self.storage.latest_snapshot(wallet_id)
    }

    /// Retained snapshots of the wallet, oldest first
    pub fn snapshots(&self, wallet_id: Uuid) -> Result<Vec<BalanceSnapshot>> {
        self.storage.snapshots(wallet_id)
    }

    fn after_create(&self, snapshot: &BalanceSnapshot) {
        self.metrics.record_snapshot_created();
        tracing::info!(
            wallet_id = %snapshot.wallet_id,
            balance = %snapshot.balance,
            transaction_count = snapshot.transaction_count,
            "Created snapshot"
        );

        // The snapshot is committed; a pruning failure only leaves extra history
        if let Err(e) = self.storage.prune_snapshots(snapshot.wallet_id, self.retention) {
            tracing::warn!(
                wallet_id = %snapshot.wallet_id,
                error = %e,
                "Failed to cleanup old snapshots"
            );
        }
    }
}

/// Capture the full-scan balance of the wallet as of this unit's instant
fn write_snapshot(uow: &mut UnitOfWork<'_>, wallet_id: Uuid) -> Result<BalanceSnapshot> {
    let storage = uow.storage();
    let wallet = storage.wallet_required(wallet_id)?;
    let currency = wallet.base_currency;

    let mut balance = Decimal::ZERO;
    let mut transaction_count = 0u64;
    let mut last_transaction = None;
    storage.scan_postings(wallet_id, None, |tx| {
        if tx.currency() == currency {
            balance = accumulate(balance, tx.signed_amount())?;
        }
        transaction_count += 1;
        last_transaction = Some((tx.id, tx.occurred_at));
        Ok(())
    })?;

    // Cut-off must not precede anything already folded in
    let mut snapshot_at = uow.now();
    if let Some((_, occurred_at)) = last_transaction {
        if occurred_at >= snapshot_at {
            snapshot_at = occurred_at;
            uow.advance_clock(occurred_at);
        }
    }

    let snapshot = BalanceSnapshot {
        id: Uuid::now_v7(),
        wallet_id,
        balance: Money::new(balance, currency)?,
        snapshot_at,
        transaction_count,
        last_transaction_id: last_transaction.map(|(id, _)| id),
        meta: EntityMeta::at(snapshot_at),
    };
    uow.insert_snapshot(&snapshot)?;
    Ok(snapshot)
}
