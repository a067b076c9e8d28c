//! Metrics collection for observability
//!
//! This module provides Prometheus metrics for monitoring the wallet ledger.
//!
//! # Metrics
//!
//! - `wallet_ledger_postings_total{reference}` - Ledger entries appended
//! - `wallet_ledger_idempotent_replays_total{operation}` - Requests served from the idempotency ledger
//! - `wallet_ledger_idempotency_conflicts_total{operation}` - Key reuse with a different payload
//! - `wallet_ledger_snapshots_created_total` - Balance snapshots written
//! - `wallet_ledger_snapshot_failures_total` - Snapshot attempts that failed
//! - `wallet_ledger_balance_reads_total{strategy}` - Balance calculations by strategy

use prometheus::{IntCounter, IntCounterVec, Opts, Registry};
use std::sync::Arc;

/// Metrics collector
///
/// Counters live on a private registry so several ledgers can coexist in
/// one process (tests, embedded use).
#[derive(Clone)]
pub struct Metrics {
    /// Postings by reference type
    pub postings_total: IntCounterVec,

    /// Idempotent replays by operation
    pub idempotent_replays: IntCounterVec,

    /// Idempotency conflicts by operation
    pub idempotency_conflicts: IntCounterVec,

    /// Snapshots written
    pub snapshots_created: IntCounter,

    /// Snapshot failures
    pub snapshot_failures: IntCounter,

    /// Balance reads by strategy
    pub balance_reads: IntCounterVec,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl Metrics {
    /// Create new metrics collector
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let postings_total = IntCounterVec::new(
            Opts::new("wallet_ledger_postings_total", "Ledger entries appended"),
            &["reference"],
        )?;
        registry.register(Box::new(postings_total.clone()))?;

        let idempotent_replays = IntCounterVec::new(
            Opts::new(
                "wallet_ledger_idempotent_replays_total",
                "Requests served from the idempotency ledger",
            ),
            &["operation"],
        )?;
        registry.register(Box::new(idempotent_replays.clone()))?;

        let idempotency_conflicts = IntCounterVec::new(
            Opts::new(
                "wallet_ledger_idempotency_conflicts_total",
                "Idempotency key reuse with a different payload",
            ),
            &["operation"],
        )?;
        registry.register(Box::new(idempotency_conflicts.clone()))?;

        let snapshots_created = IntCounter::new(
            "wallet_ledger_snapshots_created_total",
            "Balance snapshots written",
        )?;
        registry.register(Box::new(snapshots_created.clone()))?;

        let snapshot_failures = IntCounter::new(
            "wallet_ledger_snapshot_failures_total",
            "Snapshot attempts that failed",
        )?;
        registry.register(Box::new(snapshot_failures.clone()))?;

        let balance_reads = IntCounterVec::new(
            Opts::new(
                "wallet_ledger_balance_reads_total",
                "Balance calculations by strategy",
            ),
            &["strategy"],
        )?;
        registry.register(Box::new(balance_reads.clone()))?;

        Ok(Self {
            postings_total,
            idempotent_replays,
            idempotency_conflicts,
            snapshots_created,
            snapshot_failures,
            balance_reads,
            registry,
        })
    }

    /// Record a ledger posting
    pub fn record_posting(&self, reference: &str) {
        self.postings_total.with_label_values(&[reference]).inc();
    }

    /// Record a request served from a stored idempotency record
    pub fn record_replay(&self, operation: &str) {
        self.idempotent_replays.with_label_values(&[operation]).inc();
    }

    /// Record an idempotency conflict
    pub fn record_conflict(&self, operation: &str) {
        self.idempotency_conflicts
            .with_label_values(&[operation])
            .inc();
    }

    /// Record a snapshot write
    pub fn record_snapshot_created(&self) {
        self.snapshots_created.inc();
    }

    /// Record a failed snapshot attempt
    pub fn record_snapshot_failure(&self) {
        self.snapshot_failures.inc();
    }

    /// Record a balance calculation
    pub fn record_balance_read(&self, strategy: &str) {
        self.balance_reads.with_label_values(&[strategy]).inc();
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics")
            .field("snapshots_created", &self.snapshots_created.get())
            .field("snapshot_failures", &self.snapshot_failures.get())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new().unwrap();
        assert_eq!(metrics.snapshots_created.get(), 0);
        // Private registries never collide
        let other = Metrics::new().unwrap();
        assert_eq!(other.snapshot_failures.get(), 0);
    }

    #[test]
    fn test_record_posting() {
        let metrics = Metrics::new().unwrap();
        metrics.record_posting("deposit");
        metrics.record_posting("deposit");
        metrics.record_posting("transfer");

        assert_eq!(metrics.postings_total.with_label_values(&["deposit"]).get(), 2);
        assert_eq!(metrics.postings_total.with_label_values(&["transfer"]).get(), 1);
    }

    #[test]
    fn test_registry_gathers_families() {
        let metrics = Metrics::new().unwrap();
        metrics.record_snapshot_created();
        metrics.record_balance_read("snapshot");

        let names: Vec<String> = metrics
            .registry()
            .gather()
            .iter()
            .map(|family| family.get_name().to_string())
            .collect();
        assert!(names.contains(&"wallet_ledger_snapshots_created_total".to_string()));
        assert!(names.contains(&"wallet_ledger_balance_reads_total".to_string()));
    }
}
