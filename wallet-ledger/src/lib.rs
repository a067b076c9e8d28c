//! Wallet Ledger
//!
//! Multi-currency wallet ledger with derived balances, snapshot caching and
//! idempotent postings.
//!
//! # Architecture
//!
//! - **Append-only ledger**: Balances are never stored, only derived from postings
//! - **Single Writer**: Units of work serialize on one writer lock and commit atomically
//! - **Snapshots**: Checkpointed balances bound the cost of a balance read
//! - **Idempotency**: Keyed requests post at most once
//!
//! # Invariants
//!
//! - Balance = Σ(credits) − Σ(debits) over the wallet's postings
//! - Snapshot balance + postings after it == full-scan balance
//! - An operation posts all of its entries or none
//! - One (operation, key) pair maps to one set of postings

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod balance;
pub mod config;
pub mod engine;
pub mod error;
pub mod fx;
pub mod idempotency;
pub mod ledger;
pub mod metrics;
pub mod money;
pub mod snapshot;
pub mod storage;
pub mod types;
pub mod wallet;

// Re-exports
pub use balance::BalanceCalculator;
pub use config::{BalanceStrategy, Config};
pub use engine::Engine;
pub use error::{Error, Result};
pub use fx::{FixedRateProvider, FxConversion, FxService, RateProvider};
pub use idempotency::{IdempotentLedger, SingleTransactionResult, TransferTransactionsResult};
pub use ledger::{LedgerService, TransferResult};
pub use metrics::Metrics;
pub use money::{Currency, Money};
pub use snapshot::{SnapshotRunReport, SnapshotService};
pub use storage::{Storage, UnitOfWork};
pub use types::{
    BalanceSnapshot, Direction, EntityMeta, GroupType, IdempotencyRecord, Operation, OwnerId,
    Reference, ReferenceType, Transaction, Wallet, WalletStatus,
};
pub use wallet::WalletService;
