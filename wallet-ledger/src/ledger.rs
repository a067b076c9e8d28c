//! Ledger posting operations
//!
//! Deposits, withdrawals and transfers validate against committed state and
//! stage their postings inside one unit of work, so an operation lands either
//! completely or not at all.
//!
//! Each operation comes in two forms: `deposit` opens its own unit of work,
//! while `deposit_in` joins a caller's unit so that further writes (such as an
//! idempotency record) commit atomically with the postings.
//!
//! # Example
//!
//! ```no_run
//! use wallet_ledger::{Config, Currency, Engine, Money, OwnerId};
//! use uuid::Uuid;
//!
//! fn main() -> wallet_ledger::Result<()> {
//!     let engine = Engine::open(Config::default())?;
//!     let wallet = engine.wallets().create_wallet(OwnerId::new("alice"), Currency::USD)?;
//!
//!     let amount = Money::parse("100.00", Currency::USD)?;
//!     engine.ledger().deposit(wallet.id, amount, Uuid::new_v4(), None)?;
//!     Ok(())
//! }
//! ```

use crate::{
    balance::BalanceCalculator,
    metrics::Metrics,
    money::{require_currency, Money},
    snapshot::SnapshotService,
    storage::{Storage, UnitOfWork},
    types::{GroupType, Reference, ReferenceType, Transaction, Wallet},
    Error, Result,
};
use std::sync::Arc;
use uuid::Uuid;

/// Both legs of a transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferResult {
    /// Debit on the source wallet
    pub debit: Transaction,
    /// Credit on the target wallet
    pub credit: Transaction,
}

/// Posts deposits, withdrawals and transfers
#[derive(Debug, Clone)]
pub struct LedgerService {
    storage: Arc<Storage>,
    calculator: BalanceCalculator,
    snapshots: SnapshotService,
    metrics: Metrics,
}

impl LedgerService {
    /// Create service
    pub fn new(
        storage: Arc<Storage>,
        calculator: BalanceCalculator,
        snapshots: SnapshotService,
        metrics: Metrics,
    ) -> Self {
        Self {
            storage,
            calculator,
            snapshots,
            metrics,
        }
    }

    /// Credit `amount` to the wallet
    pub fn deposit(
        &self,
        wallet_id: Uuid,
        amount: Money,
        correlation_id: Uuid,
        description: Option<String>,
    ) -> Result<Transaction> {
        let tx = self.storage.unit_of_work(|uow| {
            self.deposit_in(uow, wallet_id, amount, correlation_id, description)
        })?;
        self.postings_committed(std::slice::from_ref(&tx));
        Ok(tx)
    }

    /// Debit `amount` from the wallet if the balance covers it
    pub fn withdraw(
        &self,
        wallet_id: Uuid,
        amount: Money,
        correlation_id: Uuid,
        description: Option<String>,
    ) -> Result<Transaction> {
        let tx = self.storage.unit_of_work(|uow| {
            self.withdraw_in(uow, wallet_id, amount, correlation_id, description)
        })?;
        self.postings_committed(std::slice::from_ref(&tx));
        Ok(tx)
    }

    /// Move `amount` between two wallets of the same currency
    pub fn transfer(
        &self,
        source_wallet_id: Uuid,
        target_wallet_id: Uuid,
        amount: Money,
        correlation_id: Uuid,
        description: Option<String>,
    ) -> Result<TransferResult> {
        let result = self.storage.unit_of_work(|uow| {
            self.transfer_in(
                uow,
                source_wallet_id,
                target_wallet_id,
                amount,
                correlation_id,
                description,
            )
        })?;
        self.postings_committed(&[result.debit.clone(), result.credit.clone()]);
        Ok(result)
    }

    /// Stage a deposit in the caller's unit of work
    pub fn deposit_in(
        &self,
        uow: &mut UnitOfWork<'_>,
        wallet_id: Uuid,
        amount: Money,
        correlation_id: Uuid,
        description: Option<String>,
    ) -> Result<Transaction> {
        let amount = amount.require_positive()?;
        let wallet = uow.storage().wallet_required(wallet_id)?;
        wallet.ensure_operational()?;
        require_currency(wallet.base_currency, amount.currency())?;

        let tx = Transaction::credit(
            wallet.id,
            amount,
            user_action(ReferenceType::Deposit, correlation_id),
            description,
            uow.now(),
        )?;
        uow.append_transaction(&tx)?;
        Ok(tx)
    }

    /// Stage a withdrawal in the caller's unit of work
    pub fn withdraw_in(
        &self,
        uow: &mut UnitOfWork<'_>,
        wallet_id: Uuid,
        amount: Money,
        correlation_id: Uuid,
        description: Option<String>,
    ) -> Result<Transaction> {
        let amount = amount.require_positive()?;
        let wallet = uow.storage().wallet_required(wallet_id)?;
        wallet.ensure_operational()?;
        require_currency(wallet.base_currency, amount.currency())?;
        self.ensure_sufficient_balance(&wallet, &amount)?;

        let tx = Transaction::debit(
            wallet.id,
            amount,
            user_action(ReferenceType::Withdrawal, correlation_id),
            description,
            uow.now(),
        )?;
        uow.append_transaction(&tx)?;
        Ok(tx)
    }

    /// Stage a transfer in the caller's unit of work
    pub fn transfer_in(
        &self,
        uow: &mut UnitOfWork<'_>,
        source_wallet_id: Uuid,
        target_wallet_id: Uuid,
        amount: Money,
        correlation_id: Uuid,
        description: Option<String>,
    ) -> Result<TransferResult> {
        if source_wallet_id == target_wallet_id {
            return Err(Error::SameWalletTransfer(source_wallet_id));
        }
        let amount = amount.require_positive()?;

        let storage = uow.storage();
        let source = storage.wallet_required(source_wallet_id)?;
        let target = storage.wallet_required(target_wallet_id)?;

        source.ensure_operational()?;
        target.ensure_operational()?;
        require_currency(source.base_currency, amount.currency())?;
        require_currency(target.base_currency, amount.currency())?;
        self.ensure_sufficient_balance(&source, &amount)?;

        // Both legs share one instant and one correlation
        let now = uow.now();
        let reference = user_action(ReferenceType::Transfer, correlation_id);
        let debit = Transaction::debit(source.id, amount, reference, description.clone(), now)?;
        let credit = Transaction::credit(target.id, amount, reference, description, now)?;

        uow.append_transaction(&debit)?;
        uow.append_transaction(&credit)?;
        Ok(TransferResult { debit, credit })
    }

    /// Get transaction by ID
    pub fn transaction(&self, transaction_id: Uuid) -> Result<Transaction> {
        self.storage.transaction_required(transaction_id)
    }

    /// One page of the wallet's history, newest first
    ///
    /// `page` is zero-based.
    pub fn transaction_history(
        &self,
        wallet_id: Uuid,
        page: usize,
        size: usize,
    ) -> Result<Vec<Transaction>> {
        if size == 0 {
            return Err(Error::InvalidAmount("Page size must be positive".to_string()));
        }
        self.storage.wallet_required(wallet_id)?;
        self.storage
            .transactions_page(wallet_id, page.saturating_mul(size), size)
    }

    /// Post-commit bookkeeping for postings that are now durable
    ///
    /// Snapshot maintenance failures are logged and never reach the caller.
    pub(crate) fn postings_committed(&self, postings: &[Transaction]) {
        for tx in postings {
            self.metrics.record_posting(tx.reference.reference_type.as_str());
            tracing::info!(
                transaction_id = %tx.id,
                wallet_id = %tx.wallet_id,
                direction = ?tx.direction,
                amount = %tx.amount,
                reference_id = %tx.reference.reference_id,
                "Posted transaction"
            );
        }

        for tx in postings {
            if let Err(e) = self.snapshots.create_snapshot_if_needed(tx.wallet_id) {
                self.metrics.record_snapshot_failure();
                tracing::warn!(
                    wallet_id = %tx.wallet_id,
                    error = %e,
                    "Snapshot check failed after posting"
                );
            }
        }
    }

    pub(crate) fn ensure_sufficient_balance(&self, wallet: &Wallet, debit: &Money) -> Result<()> {
        let balance = self
            .calculator
            .calculate_balance(wallet.id, debit.currency())?;
        if balance.amount() < debit.amount() {
            return Err(Error::InsufficientBalance {
                wallet_id: wallet.id,
                balance: balance.amount(),
                requested: debit.amount(),
            });
        }
        Ok(())
    }
}

fn user_action(reference_type: ReferenceType, reference_id: Uuid) -> Reference {
    Reference {
        group_type: GroupType::UserAction,
        reference_type,
        reference_id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BalanceStrategy;
    use crate::money::Currency;
    use crate::types::{Direction, OwnerId};
    use crate::Config;
    use tempfile::TempDir;

    struct Fixture {
        storage: Arc<Storage>,
        ledger: LedgerService,
        _temp: TempDir,
    }

    fn fixture() -> Fixture {
        let temp = TempDir::new().unwrap();
        let mut config = Config::default();
        config.data_dir = temp.path().to_path_buf();
        let storage = Arc::new(Storage::open(&config).unwrap());
        let metrics = Metrics::new().unwrap();
        let calculator =
            BalanceCalculator::new(storage.clone(), BalanceStrategy::Snapshot, metrics.clone());
        let snapshots = SnapshotService::new(storage.clone(), 100, 5, metrics.clone());
        let ledger = LedgerService::new(storage.clone(), calculator, snapshots, metrics);
        Fixture {
            storage,
            ledger,
            _temp: temp,
        }
    }

    fn wallet(storage: &Storage, owner: &str, currency: Currency) -> Wallet {
        let wallet = Wallet::create(OwnerId::new(owner), currency);
        storage.unit_of_work(|uow| uow.insert_wallet(&wallet)).unwrap();
        wallet
    }

    fn usd(amount: &str) -> Money {
        Money::parse(amount, Currency::USD).unwrap()
    }

    #[test]
    fn test_deposit_posts_credit() {
        let f = fixture();
        let w = wallet(&f.storage, "alice", Currency::USD);
        let correlation = Uuid::new_v4();

        let tx = f
            .ledger
            .deposit(w.id, usd("100.00"), correlation, Some("salary".into()))
            .unwrap();
        assert_eq!(tx.direction, Direction::Credit);
        assert_eq!(tx.reference.reference_type, ReferenceType::Deposit);
        assert_eq!(tx.reference.reference_id, correlation);
        assert_eq!(f.ledger.transaction(tx.id).unwrap(), tx);
    }

    #[test]
    fn test_deposit_validation() {
        let f = fixture();
        let w = wallet(&f.storage, "alice", Currency::USD);

        let zero = f.ledger.deposit(w.id, usd("0"), Uuid::new_v4(), None);
        assert!(matches!(zero, Err(Error::InvalidAmount(_))));

        let eur = Money::parse("5", Currency::EUR).unwrap();
        let mismatch = f.ledger.deposit(w.id, eur, Uuid::new_v4(), None);
        assert!(matches!(mismatch, Err(Error::CurrencyMismatch { .. })));

        let missing = f.ledger.deposit(Uuid::now_v7(), usd("5"), Uuid::new_v4(), None);
        assert!(matches!(missing, Err(Error::NotFound(_))));

        assert_eq!(f.storage.count_transactions(w.id).unwrap(), 0);
    }

    #[test]
    fn test_withdraw_requires_balance() {
        let f = fixture();
        let w = wallet(&f.storage, "bob", Currency::USD);
        f.ledger.deposit(w.id, usd("50"), Uuid::new_v4(), None).unwrap();

        let result = f.ledger.withdraw(w.id, usd("50.0001"), Uuid::new_v4(), None);
        assert!(matches!(result, Err(Error::InsufficientBalance { .. })));
        assert_eq!(f.storage.count_transactions(w.id).unwrap(), 1);

        let tx = f.ledger.withdraw(w.id, usd("50"), Uuid::new_v4(), None).unwrap();
        assert_eq!(tx.direction, Direction::Debit);
    }

    #[test]
    fn test_transfer_posts_paired_legs() {
        let f = fixture();
        let a = wallet(&f.storage, "a", Currency::USD);
        let b = wallet(&f.storage, "b", Currency::USD);
        f.ledger.deposit(a.id, usd("20"), Uuid::new_v4(), None).unwrap();

        let correlation = Uuid::new_v4();
        let result = f
            .ledger
            .transfer(a.id, b.id, usd("15"), correlation, None)
            .unwrap();
        assert_eq!(result.debit.wallet_id, a.id);
        assert_eq!(result.credit.wallet_id, b.id);
        assert_eq!(result.debit.reference, result.credit.reference);
        assert_eq!(result.debit.reference.reference_id, correlation);
        assert_eq!(result.debit.occurred_at, result.credit.occurred_at);
    }

    #[test]
    fn test_transfer_rejections_write_nothing() {
        let f = fixture();
        let a = wallet(&f.storage, "a", Currency::USD);
        let b = wallet(&f.storage, "b", Currency::USD);
        let eur = wallet(&f.storage, "c", Currency::EUR);
        f.ledger.deposit(a.id, usd("10"), Uuid::new_v4(), None).unwrap();

        assert!(matches!(
            f.ledger.transfer(a.id, a.id, usd("1"), Uuid::new_v4(), None),
            Err(Error::SameWalletTransfer(_))
        ));
        assert!(matches!(
            f.ledger.transfer(a.id, b.id, usd("11"), Uuid::new_v4(), None),
            Err(Error::InsufficientBalance { .. })
        ));
        assert!(matches!(
            f.ledger.transfer(a.id, eur.id, usd("1"), Uuid::new_v4(), None),
            Err(Error::CurrencyMismatch { .. })
        ));

        assert_eq!(f.storage.count_transactions(a.id).unwrap(), 1);
        assert_eq!(f.storage.count_transactions(b.id).unwrap(), 0);
    }

    #[test]
    fn test_transaction_history_pages_newest_first() {
        let f = fixture();
        let w = wallet(&f.storage, "pager", Currency::USD);
        for amount in ["1", "2", "3", "4", "5"] {
            f.ledger.deposit(w.id, usd(amount), Uuid::new_v4(), None).unwrap();
        }

        let first = f.ledger.transaction_history(w.id, 0, 2).unwrap();
        assert_eq!(
            first.iter().map(|tx| tx.amount).collect::<Vec<_>>(),
            vec![usd("5"), usd("4")]
        );
        let last = f.ledger.transaction_history(w.id, 2, 2).unwrap();
        assert_eq!(last, vec![f.storage.transactions_page(w.id, 4, 1).unwrap()[0].clone()]);
        assert!(f.ledger.transaction_history(w.id, 3, 2).unwrap().is_empty());
        assert!(f.ledger.transaction_history(w.id, 0, 0).is_err());
    }
}
