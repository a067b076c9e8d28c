//! Core types for the wallet ledger
//!
//! All types are designed for:
//! - Deterministic serialization (bincode)
//! - Exact arithmetic (Decimal via [`Money`])
//! - Explicit foreign keys (`owner_id`, `wallet_id`) instead of object graphs

use crate::money::{Currency, Money};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Metadata shared by every persisted entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityMeta {
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

impl EntityMeta {
    /// Metadata stamped with the given instant
    pub fn at(created_at: DateTime<Utc>) -> Self {
        Self { created_at }
    }

    /// Metadata stamped now
    pub fn now() -> Self {
        Self::at(Utc::now())
    }
}

/// Opaque owner identifier supplied by the auth collaborator
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OwnerId(String);

impl OwnerId {
    /// Create new owner ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Wallet lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum WalletStatus {
    /// Eligible for postings
    Active = 1,
    /// Temporarily blocked, reversible
    Suspended = 2,
    /// Terminal
    Closed = 3,
}

/// Owner-scoped account in a single currency
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wallet {
    /// Wallet ID
    pub id: Uuid,

    /// Owning party
    pub owner_id: OwnerId,

    /// Currency of every posting on this wallet
    pub base_currency: Currency,

    /// Lifecycle status
    pub status: WalletStatus,

    /// Optimistic lock counter, bumped by the store on every update
    pub version: u64,

    /// Entity metadata
    pub meta: EntityMeta,
}

impl Wallet {
    /// New active wallet
    pub fn create(owner_id: OwnerId, base_currency: Currency) -> Self {
        Self {
            id: Uuid::now_v7(),
            owner_id,
            base_currency,
            status: WalletStatus::Active,
            version: 0,
            meta: EntityMeta::now(),
        }
    }

    /// ACTIVE -> SUSPENDED
    pub fn suspend(&mut self) -> Result<()> {
        self.ensure_not_closed()?;
        self.status = WalletStatus::Suspended;
        Ok(())
    }

    /// SUSPENDED -> ACTIVE
    pub fn activate(&mut self) -> Result<()> {
        self.ensure_not_closed()?;
        self.status = WalletStatus::Active;
        Ok(())
    }

    /// ACTIVE | SUSPENDED -> CLOSED
    pub fn close(&mut self) -> Result<()> {
        self.ensure_not_closed()?;
        self.status = WalletStatus::Closed;
        Ok(())
    }

    /// Postings require ACTIVE
    pub fn ensure_operational(&self) -> Result<()> {
        match self.status {
            WalletStatus::Active => Ok(()),
            WalletStatus::Suspended => Err(Error::WalletSuspended(self.id)),
            WalletStatus::Closed => Err(Error::WalletClosed(self.id)),
        }
    }

    /// Whether `owner` owns this wallet
    pub fn is_owned_by(&self, owner: &OwnerId) -> bool {
        &self.owner_id == owner
    }

    fn ensure_not_closed(&self) -> Result<()> {
        if self.status == WalletStatus::Closed {
            return Err(Error::WalletClosed(self.id));
        }
        Ok(())
    }
}

/// Side of a posting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum Direction {
    /// Increases the balance
    Credit = 1,
    /// Decreases the balance
    Debit = 2,
}

impl Direction {
    /// Apply the direction's sign to a positive amount
    pub fn signed(&self, amount: Decimal) -> Decimal {
        match self {
            Direction::Credit => amount,
            Direction::Debit => -amount,
        }
    }
}

/// Why a group of postings exists
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum GroupType {
    /// Deposit, withdrawal or transfer
    UserAction = 1,
    /// Cross-currency conversion
    FxConversion = 2,
}

/// Business reference of a posting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ReferenceType {
    /// Deposit
    Deposit = 1,
    /// Withdrawal
    Withdrawal = 2,
    /// Wallet-to-wallet transfer
    Transfer = 3,
    /// FX conversion
    FxExchange = 4,
}

impl ReferenceType {
    /// Stable label (metrics, logs)
    pub fn as_str(&self) -> &'static str {
        match self {
            ReferenceType::Deposit => "deposit",
            ReferenceType::Withdrawal => "withdrawal",
            ReferenceType::Transfer => "transfer",
            ReferenceType::FxExchange => "fx_exchange",
        }
    }
}

/// Correlation shared by the postings of one operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reference {
    /// Group type
    pub group_type: GroupType,
    /// Reference type
    pub reference_type: ReferenceType,
    /// Correlation ID (same on paired postings)
    pub reference_id: Uuid,
}

/// Immutable ledger entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Transaction ID (UUIDv7 for time-ordering)
    pub id: Uuid,

    /// Wallet this posting belongs to
    pub wallet_id: Uuid,

    /// Strictly positive amount
    pub amount: Money,

    /// Credit or debit
    pub direction: Direction,

    /// Correlation
    pub reference: Reference,

    /// Free-form description
    pub description: Option<String>,

    /// Ledger instant of the posting
    pub occurred_at: DateTime<Utc>,
}

impl Transaction {
    /// Build a posting, rejecting non-positive amounts
    pub fn new(
        wallet_id: Uuid,
        direction: Direction,
        amount: Money,
        reference: Reference,
        description: Option<String>,
        occurred_at: DateTime<Utc>,
    ) -> Result<Self> {
        let amount = amount.require_positive()?;
        Ok(Self {
            id: Uuid::now_v7(),
            wallet_id,
            amount,
            direction,
            reference,
            description,
            occurred_at,
        })
    }

    /// Credit posting
    pub fn credit(
        wallet_id: Uuid,
        amount: Money,
        reference: Reference,
        description: Option<String>,
        occurred_at: DateTime<Utc>,
    ) -> Result<Self> {
        Self::new(wallet_id, Direction::Credit, amount, reference, description, occurred_at)
    }

    /// Debit posting
    pub fn debit(
        wallet_id: Uuid,
        amount: Money,
        reference: Reference,
        description: Option<String>,
        occurred_at: DateTime<Utc>,
    ) -> Result<Self> {
        Self::new(wallet_id, Direction::Debit, amount, reference, description, occurred_at)
    }

    /// Contribution to the wallet balance
    pub fn signed_amount(&self) -> Decimal {
        self.direction.signed(self.amount.amount())
    }

    /// Currency of the posting
    pub fn currency(&self) -> Currency {
        self.amount.currency()
    }
}

/// Cached cumulative balance at a ledger instant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceSnapshot {
    /// Snapshot ID
    pub id: Uuid,

    /// Wallet
    pub wallet_id: Uuid,

    /// Signed sum of every posting with `occurred_at <= snapshot_at`
    pub balance: Money,

    /// Cut-off instant
    pub snapshot_at: DateTime<Utc>,

    /// Postings folded into `balance`
    pub transaction_count: u64,

    /// Most recent posting folded into `balance`
    pub last_transaction_id: Option<Uuid>,

    /// Entity metadata
    pub meta: EntityMeta,
}

/// Idempotent operation kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Operation {
    /// Deposit
    Deposit = 1,
    /// Withdrawal
    Withdrawal = 2,
    /// Transfer
    Transfer = 3,
}

impl Operation {
    /// Operation name
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Deposit => "DEPOSIT",
            Operation::Withdrawal => "WITHDRAWAL",
            Operation::Transfer => "TRANSFER",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Mapping from (operation, key) to the postings it produced
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    /// Record ID
    pub id: Uuid,

    /// Operation
    pub operation: Operation,

    /// Client or server generated key
    pub idempotency_key: Uuid,

    /// Digest of the economically significant request fields
    pub request_fingerprint: String,

    /// Primary (source) wallet
    pub wallet_id: Uuid,

    /// First posting
    pub transaction_id: Uuid,

    /// Second posting of a pair
    pub transaction_id2: Option<Uuid>,

    /// Entity metadata
    pub meta: EntityMeta,
}
