//! Error types for the wallet ledger

use crate::money::Currency;
use rust_decimal::Decimal;
use thiserror::Error;
use uuid::Uuid;

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, Error>;

/// Ledger errors
///
/// Domain violations are surfaced as their own variants and are never retried
/// internally. Storage, serialization and IO failures are infrastructure errors
/// and propagate unchanged.
#[derive(Error, Debug)]
pub enum Error {
    /// Wallet, transaction or snapshot missing
    #[error("Not found: {0}")]
    NotFound(String),

    /// Non-positive or malformed amount
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    /// Amount currency differs from the wallet (or other operand) currency
    #[error("Currency mismatch: expected {expected}, got {actual}")]
    CurrencyMismatch {
        /// Currency required by the operation
        expected: Currency,
        /// Currency supplied
        actual: Currency,
    },

    /// Wallet is suspended
    #[error("Wallet is suspended: {0}")]
    WalletSuspended(Uuid),

    /// Wallet is closed
    #[error("Wallet is closed: {0}")]
    WalletClosed(Uuid),

    /// Source and target wallet are the same
    #[error("Cannot transfer to the same wallet: {0}")]
    SameWalletTransfer(Uuid),

    /// Debit exceeds derived balance
    #[error("Insufficient balance in wallet {wallet_id}: balance {balance}, requested {requested}")]
    InsufficientBalance {
        /// Debited wallet
        wallet_id: Uuid,
        /// Balance at check time
        balance: Decimal,
        /// Requested debit
        requested: Decimal,
    },

    /// Owner already holds a wallet in this currency
    #[error("Owner {owner_id} already has a wallet for currency {currency}")]
    DuplicateWallet {
        /// Owner identifier
        owner_id: String,
        /// Currency of the existing wallet
        currency: Currency,
    },

    /// Idempotency key reused with a different payload
    #[error("Idempotency key reuse with different payload for operation={operation}, key={key}")]
    IdempotencyConflict {
        /// Operation name
        operation: String,
        /// Idempotency key
        key: Uuid,
    },

    /// Stale wallet version on write
    #[error("Version conflict on wallet {wallet_id}: expected version {expected}, stored version {actual}")]
    VersionConflict {
        /// Wallet being updated
        wallet_id: Uuid,
        /// Version the writer observed
        expected: u64,
        /// Version currently stored
        actual: u64,
    },

    /// Caller does not own the wallet
    #[error("Access denied to wallet {0}")]
    AccessDenied(Uuid),

    /// Insert-if-absent found an existing key
    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    /// Storage error (RocksDB)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Infrastructure failure rather than a domain rule violation
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            Error::Storage(_) | Error::Serialization(_) | Error::Io(_)
        )
    }

    /// Whether the caller may retry the same request
    ///
    /// Money-moving retries are only safe through the idempotent use cases.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::VersionConflict { .. }) || self.is_infrastructure()
    }
}

impl From<rocksdb::Error> for Error {
    fn from(err: rocksdb::Error) -> Self {
        Error::Storage(err.to_string())
    }
}
