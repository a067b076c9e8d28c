//! Idempotent ledger operations
//!
//! Each request carries an idempotency key (generated when absent) and a
//! fingerprint of its economically significant fields. The pair
//! (operation, key) maps to the postings the first request produced:
//!
//! - a repeat with the same fingerprint returns the stored postings and the
//!   original processing instant without writing anything;
//! - a repeat with a different fingerprint fails with `IdempotencyConflict`;
//! - a new key runs the operation and stores its record in the same unit of
//!   work, so the postings and the record commit together.
//!
//! The record insert is the race resolution point. A request that finds the
//! key taken rolls back its whole unit and answers from the winner's record.

use crate::{
    ledger::{LedgerService, TransferResult},
    metrics::Metrics,
    money::Money,
    storage::{Storage, UnitOfWork},
    types::{EntityMeta, IdempotencyRecord, Operation, Transaction},
    Error, Result,
};
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use uuid::Uuid;

/// Outcome of an idempotent deposit or withdrawal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SingleTransactionResult {
    /// Idempotency key of the request
    pub request_id: Uuid,
    /// Posting produced by the first request
    pub transaction: Transaction,
    /// Instant the first request was processed
    pub processed_at: DateTime<Utc>,
}

/// Outcome of an idempotent transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferTransactionsResult {
    /// Idempotency key of the request
    pub request_id: Uuid,
    /// Debit on the source wallet
    pub source_transaction: Transaction,
    /// Credit on the target wallet
    pub target_transaction: Transaction,
    /// Instant the first request was processed
    pub processed_at: DateTime<Utc>,
}

/// Ledger operations deduplicated by idempotency key
#[derive(Debug, Clone)]
pub struct IdempotentLedger {
    storage: Arc<Storage>,
    ledger: LedgerService,
    metrics: Metrics,
}

impl IdempotentLedger {
    /// Create service
    pub fn new(storage: Arc<Storage>, ledger: LedgerService, metrics: Metrics) -> Self {
        Self {
            storage,
            ledger,
            metrics,
        }
    }

    /// Deposit at most once per key
    pub fn deposit(
        &self,
        wallet_id: Uuid,
        amount: Money,
        idempotency_key: Option<Uuid>,
        description: Option<String>,
    ) -> Result<SingleTransactionResult> {
        let key = key_or_new(idempotency_key);
        let fingerprint = fingerprint_single(wallet_id, &amount);

        let outcome = self.execute(Operation::Deposit, key, fingerprint, wallet_id, |uow| {
            self.ledger.deposit_in(uow, wallet_id, amount, key, description)
        })?;
        self.single_result(key, outcome)
    }

    /// Withdraw at most once per key
    pub fn withdraw(
        &self,
        wallet_id: Uuid,
        amount: Money,
        idempotency_key: Option<Uuid>,
        description: Option<String>,
    ) -> Result<SingleTransactionResult> {
        let key = key_or_new(idempotency_key);
        let fingerprint = fingerprint_single(wallet_id, &amount);

        let outcome = self.execute(Operation::Withdrawal, key, fingerprint, wallet_id, |uow| {
            self.ledger.withdraw_in(uow, wallet_id, amount, key, description)
        })?;
        self.single_result(key, outcome)
    }

    /// Transfer at most once per key
    pub fn transfer(
        &self,
        source_wallet_id: Uuid,
        target_wallet_id: Uuid,
        amount: Money,
        idempotency_key: Option<Uuid>,
        description: Option<String>,
    ) -> Result<TransferTransactionsResult> {
        let key = key_or_new(idempotency_key);
        let fingerprint = fingerprint_transfer(
            source_wallet_id,
            target_wallet_id,
            &amount,
            description.as_deref(),
        );

        let outcome = self.execute(
            Operation::Transfer,
            key,
            fingerprint,
            source_wallet_id,
            |uow| {
                self.ledger.transfer_in(
                    uow,
                    source_wallet_id,
                    target_wallet_id,
                    amount,
                    key,
                    description,
                )
            },
        )?;

        match outcome {
            Outcome::Fresh(result, processed_at) => Ok(TransferTransactionsResult {
                request_id: key,
                source_transaction: result.debit,
                target_transaction: result.credit,
                processed_at,
            }),
            Outcome::Replayed(record) => {
                let second = record.transaction_id2.ok_or_else(|| {
                    Error::NotFound(format!(
                        "Transaction id is missing for idempotency record {}",
                        record.id
                    ))
                })?;
                Ok(TransferTransactionsResult {
                    request_id: key,
                    source_transaction: self.storage.transaction_required(record.transaction_id)?,
                    target_transaction: self.storage.transaction_required(second)?,
                    processed_at: record.meta.created_at,
                })
            }
        }
    }

    fn single_result(
        &self,
        key: Uuid,
        outcome: Outcome<Transaction>,
    ) -> Result<SingleTransactionResult> {
        match outcome {
            Outcome::Fresh(transaction, processed_at) => Ok(SingleTransactionResult {
                request_id: key,
                transaction,
                processed_at,
            }),
            Outcome::Replayed(record) => Ok(SingleTransactionResult {
                request_id: key,
                transaction: self.storage.transaction_required(record.transaction_id)?,
                processed_at: record.meta.created_at,
            }),
        }
    }

    fn execute<T, P>(
        &self,
        operation: Operation,
        key: Uuid,
        fingerprint: String,
        wallet_id: Uuid,
        post: P,
    ) -> Result<Outcome<T>>
    where
        T: Postings,
        P: FnOnce(&mut UnitOfWork<'_>) -> Result<T>,
    {
        // Lock-free replay path
        if let Some(record) = self.storage.get_idempotency_record(operation, key)? {
            return self.replay(record, &fingerprint);
        }

        let claimed = self.storage.unit_of_work(|uow| {
            // Re-check under the writer lock; a concurrent request may have committed
            if let Some(record) = uow.storage().get_idempotency_record(operation, key)? {
                return Ok(Outcome::Replayed(record));
            }

            let result = post(uow)?;
            let (transaction_id, transaction_id2) = result.ids();
            let record = IdempotencyRecord {
                id: Uuid::now_v7(),
                operation,
                idempotency_key: key,
                request_fingerprint: fingerprint.clone(),
                wallet_id,
                transaction_id,
                transaction_id2,
                meta: EntityMeta::at(uow.now()),
            };
            uow.insert_idempotency_record(&record)?;
            Ok(Outcome::Fresh(result, record.meta.created_at))
        });

        match claimed {
            Ok(Outcome::Fresh(result, processed_at)) => {
                self.ledger.postings_committed(&result.postings());
                Ok(Outcome::Fresh(result, processed_at))
            }
            Ok(Outcome::Replayed(record)) => self.replay(record, &fingerprint),
            Err(Error::DuplicateKey(_)) => {
                tracing::debug!(
                    operation = %operation,
                    key = %key,
                    "Lost idempotency race, serving winner's result"
                );
                let record = self
                    .storage
                    .get_idempotency_record(operation, key)?
                    .ok_or_else(|| {
                        Error::Storage(format!(
                            "Idempotency record vanished for operation={}, key={}",
                            operation, key
                        ))
                    })?;
                self.replay(record, &fingerprint)
            }
            Err(e) => Err(e),
        }
    }

    fn replay<T>(&self, record: IdempotencyRecord, fingerprint: &str) -> Result<Outcome<T>> {
        if record.request_fingerprint != fingerprint {
            self.metrics.record_conflict(record.operation.name());
            tracing::warn!(
                operation = %record.operation,
                key = %record.idempotency_key,
                "Idempotency key reuse with different payload"
            );
            return Err(Error::IdempotencyConflict {
                operation: record.operation.name().to_string(),
                key: record.idempotency_key,
            });
        }

        self.metrics.record_replay(record.operation.name());
        tracing::debug!(
            operation = %record.operation,
            key = %record.idempotency_key,
            "Replaying idempotent request"
        );
        Ok(Outcome::Replayed(record))
    }
}

/// Either the postings of this request or the record of an earlier one
enum Outcome<T> {
    Fresh(T, DateTime<Utc>),
    Replayed(IdempotencyRecord),
}

/// Postings produced by one ledger operation
trait Postings {
    fn ids(&self) -> (Uuid, Option<Uuid>);
    fn postings(&self) -> Vec<Transaction>;
}

impl Postings for Transaction {
    fn ids(&self) -> (Uuid, Option<Uuid>) {
        (self.id, None)
    }

    fn postings(&self) -> Vec<Transaction> {
        vec![self.clone()]
    }
}

impl Postings for TransferResult {
    fn ids(&self) -> (Uuid, Option<Uuid>) {
        (self.debit.id, Some(self.credit.id))
    }

    fn postings(&self) -> Vec<Transaction> {
        vec![self.debit.clone(), self.credit.clone()]
    }
}

fn key_or_new(key: Option<Uuid>) -> Uuid {
    key.unwrap_or_else(Uuid::now_v7)
}

fn fingerprint_single(wallet_id: Uuid, amount: &Money) -> String {
    digest(&format!(
        "walletId={}|amount={}|currency={}",
        wallet_id,
        amount.amount(),
        amount.currency()
    ))
}

fn fingerprint_transfer(
    source_wallet_id: Uuid,
    target_wallet_id: Uuid,
    amount: &Money,
    description: Option<&str>,
) -> String {
    digest(&format!(
        "sourceWalletId={}|targetWalletId={}|amount={}|currency={}|description={}",
        source_wallet_id,
        target_wallet_id,
        amount.amount(),
        amount.currency(),
        description.unwrap_or("")
    ))
}

fn digest(canonical: &str) -> String {
    hex::encode(Sha256::digest(canonical.as_bytes()))
}
