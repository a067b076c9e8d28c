//! Storage layer using RocksDB
//!
//! # Column Families
//!
//! - `wallets` - Wallet records (key: wallet_id)
//! - `wallet_owners` - Unique (owner, currency) index (key: len || owner || currency)
//! - `transactions` - Append-only ledger entries (key: transaction_id)
//! - `postings` - Per-wallet time index (key: wallet_id || instant || transaction_id)
//! - `snapshots` - Balance snapshots (key: wallet_id || instant || snapshot_id)
//! - `idempotency` - Idempotency records (key: operation || idempotency_key)
//!
//! # Units of work
//!
//! Every write goes through [`Storage::unit_of_work`]. A unit holds the single
//! writer lock for its whole duration, stages its writes in a `WriteBatch` and
//! commits them with one atomic write, or drops them when the closure fails.
//! Reads never take the writer lock and only observe committed state.

use crate::{
    error::{Error, Result},
    money::{accumulate, Currency},
    types::{BalanceSnapshot, IdempotencyRecord, Operation, OwnerId, Transaction, Wallet},
    Config,
};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard};
use rocksdb::{
    ColumnFamily, ColumnFamilyDescriptor, Direction as ScanDirection, IteratorMode, Options,
    WriteBatch, DB,
};
use rust_decimal::Decimal;
use uuid::Uuid;

/// Column family names
const CF_WALLETS: &str = "wallets";
const CF_WALLET_OWNERS: &str = "wallet_owners";
const CF_TRANSACTIONS: &str = "transactions";
const CF_POSTINGS: &str = "postings";
const CF_SNAPSHOTS: &str = "snapshots";
const CF_IDEMPOTENCY: &str = "idempotency";

const COLUMN_FAMILIES: [&str; 6] = [
    CF_WALLETS,
    CF_WALLET_OWNERS,
    CF_TRANSACTIONS,
    CF_POSTINGS,
    CF_SNAPSHOTS,
    CF_IDEMPOTENCY,
];

/// Storage wrapper for RocksDB
pub struct Storage {
    db: DB,
    writer: Mutex<LedgerClock>,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("path", &self.db.path())
            .finish()
    }
}

/// Strictly increasing ledger instants, guarded by the writer lock
#[derive(Debug, Default)]
struct LedgerClock {
    last_nanos: i64,
}

impl LedgerClock {
    fn tick(&mut self) -> DateTime<Utc> {
        let now = Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX - 1);
        let next = now.max(self.last_nanos + 1);
        self.last_nanos = next;
        DateTime::from_timestamp_nanos(next)
    }

    fn observe(&mut self, instant: DateTime<Utc>) {
        let nanos = instant.timestamp_nanos_opt().unwrap_or(i64::MAX - 1);
        self.last_nanos = self.last_nanos.max(nanos);
    }
}

impl Storage {
    /// Open or create database
    pub fn open(config: &Config) -> Result<Self> {
        let path = &config.data_dir;

        // Create directory if not exists
        std::fs::create_dir_all(path)?;

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_write_buffer_size(config.rocksdb.write_buffer_size_mb * 1024 * 1024);
        db_opts.set_max_write_buffer_number(config.rocksdb.max_write_buffer_number);
        db_opts.set_max_background_jobs(config.rocksdb.max_background_jobs);

        if config.rocksdb.enable_statistics {
            db_opts.enable_statistics();
        }

        let cf_descriptors = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name)))
            .collect::<Vec<_>>();

        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;

        tracing::info!(
            path = ?path,
            column_families = COLUMN_FAMILIES.len(),
            "Opened RocksDB"
        );

        let storage = Self {
            db,
            writer: Mutex::new(LedgerClock::default()),
        };
        storage.restore_clock()?;
        Ok(storage)
    }

    fn cf_options(name: &str) -> Options {
        let mut opts = Options::default();
        match name {
            // Ledger history is large and cold, compress hard
            CF_TRANSACTIONS | CF_POSTINGS => {
                opts.set_compression_type(rocksdb::DBCompressionType::Zstd);
            }
            // Point lookups on unique keys benefit from bloom filters
            CF_WALLET_OWNERS | CF_IDEMPOTENCY => {
                opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
                let mut block_opts = rocksdb::BlockBasedOptions::default();
                block_opts.set_bloom_filter(10.0, false);
                opts.set_block_based_table_factory(&block_opts);
            }
            _ => {
                opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
            }
        }
        opts
    }

    /// Seed the ledger clock past every persisted snapshot and posting instant
    fn restore_clock(&self) -> Result<()> {
        let cf = self.cf_handle(CF_SNAPSHOTS)?;
        let mut clock = self.writer.lock();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            let snapshot: BalanceSnapshot = bincode::deserialize(&value)?;
            clock.observe(snapshot.snapshot_at);
        }
        for wallet in self.all_wallets()? {
            if let Some(last) = self.last_transaction(wallet.id)? {
                clock.observe(last.occurred_at);
            }
        }
        Ok(())
    }

    fn cf_handle(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::Storage(format!("Column family {} not found", name)))
    }

    /// Run `work` as one atomic unit
    ///
    /// Writes staged through the [`UnitOfWork`] are committed together when
    /// `work` returns `Ok`, and discarded when it returns `Err`.
    pub fn unit_of_work<T, F>(&self, work: F) -> Result<T>
    where
        F: FnOnce(&mut UnitOfWork<'_>) -> Result<T>,
    {
        let mut clock = self.writer.lock();
        let now = clock.tick();
        let mut uow = UnitOfWork {
            storage: self,
            clock,
            batch: WriteBatch::default(),
            now,
        };

        match work(&mut uow) {
            Ok(value) => {
                uow.commit()?;
                Ok(value)
            }
            Err(err) => {
                tracing::debug!(error = %err, "Unit of work rolled back");
                Err(err)
            }
        }
    }

    // Wallet reads

    /// Get wallet by ID
    pub fn get_wallet(&self, wallet_id: Uuid) -> Result<Option<Wallet>> {
        let cf = self.cf_handle(CF_WALLETS)?;
        match self.db.get_cf(cf, wallet_id.as_bytes())? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    /// Get wallet by ID, failing with `NotFound`
    pub fn wallet_required(&self, wallet_id: Uuid) -> Result<Wallet> {
        self.get_wallet(wallet_id)?
            .ok_or_else(|| Error::NotFound(format!("Wallet not found: {}", wallet_id)))
    }

    /// Wallet of `owner` in `currency`, if any
    pub fn find_wallet_by_owner(
        &self,
        owner_id: &OwnerId,
        currency: Currency,
    ) -> Result<Option<Wallet>> {
        let cf = self.cf_handle(CF_WALLET_OWNERS)?;
        match self.db.get_cf(cf, owner_index_key(owner_id, Some(currency)))? {
            Some(value) => self.get_wallet(uuid_from_slice(&value)?),
            None => Ok(None),
        }
    }

    /// Every wallet of `owner`
    pub fn wallets_by_owner(&self, owner_id: &OwnerId) -> Result<Vec<Wallet>> {
        let cf = self.cf_handle(CF_WALLET_OWNERS)?;
        let prefix = owner_index_key(owner_id, None);

        let mut wallets = Vec::new();
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&prefix, ScanDirection::Forward));
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            if let Some(wallet) = self.get_wallet(uuid_from_slice(&value)?)? {
                wallets.push(wallet);
            }
        }
        Ok(wallets)
    }

    /// Every wallet in the store
    pub fn all_wallets(&self) -> Result<Vec<Wallet>> {
        let cf = self.cf_handle(CF_WALLETS)?;
        let mut wallets = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            wallets.push(bincode::deserialize(&value)?);
        }
        Ok(wallets)
    }

    // Transaction reads

    /// Get transaction by ID
    pub fn get_transaction(&self, transaction_id: Uuid) -> Result<Option<Transaction>> {
        let cf = self.cf_handle(CF_TRANSACTIONS)?;
        match self.db.get_cf(cf, transaction_id.as_bytes())? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    /// Get transaction by ID, failing with `NotFound`
    pub fn transaction_required(&self, transaction_id: Uuid) -> Result<Transaction> {
        self.get_transaction(transaction_id)?
            .ok_or_else(|| Error::NotFound(format!("Transaction not found: {}", transaction_id)))
    }

    /// Visit the wallet's postings in ledger order, optionally only those
    /// strictly after `after`
    pub fn scan_postings<F>(
        &self,
        wallet_id: Uuid,
        after: Option<DateTime<Utc>>,
        mut visit: F,
    ) -> Result<()>
    where
        F: FnMut(Transaction) -> Result<()>,
    {
        let cf = self.cf_handle(CF_POSTINGS)?;
        let prefix = wallet_id.as_bytes().to_vec();
        let start = match after {
            Some(instant) => {
                let mut key = prefix.clone();
                key.extend_from_slice(&instant_key(instant_nanos(instant).saturating_add(1)));
                key
            }
            None => prefix.clone(),
        };

        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&start, ScanDirection::Forward));
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            visit(bincode::deserialize(&value)?)?;
        }
        Ok(())
    }

    /// Signed sum of the wallet's postings in `currency`
    pub fn sum_signed_amount(&self, wallet_id: Uuid, currency: Currency) -> Result<Decimal> {
        self.sum_signed_amount_since(wallet_id, currency, None)
    }

    /// Signed sum of the wallet's postings in `currency` strictly after `after`
    pub fn sum_signed_amount_after(
        &self,
        wallet_id: Uuid,
        currency: Currency,
        after: DateTime<Utc>,
    ) -> Result<Decimal> {
        self.sum_signed_amount_since(wallet_id, currency, Some(after))
    }

    fn sum_signed_amount_since(
        &self,
        wallet_id: Uuid,
        currency: Currency,
        after: Option<DateTime<Utc>>,
    ) -> Result<Decimal> {
        let mut sum = Decimal::ZERO;
        self.scan_postings(wallet_id, after, |tx| {
            if tx.currency() == currency {
                sum = accumulate(sum, tx.signed_amount())?;
            }
            Ok(())
        })?;
        Ok(sum)
    }

    /// Number of postings on the wallet
    pub fn count_transactions(&self, wallet_id: Uuid) -> Result<u64> {
        self.count_transactions_since(wallet_id, None)
    }

    /// Number of postings on the wallet strictly after `after`
    pub fn count_transactions_after(&self, wallet_id: Uuid, after: DateTime<Utc>) -> Result<u64> {
        self.count_transactions_since(wallet_id, Some(after))
    }

    fn count_transactions_since(
        &self,
        wallet_id: Uuid,
        after: Option<DateTime<Utc>>,
    ) -> Result<u64> {
        let cf = self.cf_handle(CF_POSTINGS)?;
        let prefix = wallet_id.as_bytes().to_vec();
        let mut start = prefix.clone();
        if let Some(instant) = after {
            start.extend_from_slice(&instant_key(instant_nanos(instant).saturating_add(1)));
        }

        let mut count = 0u64;
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&start, ScanDirection::Forward));
        for item in iter {
            let (key, _) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            count += 1;
        }
        Ok(count)
    }

    /// Wallet postings, newest first, skipping `offset` and returning at most `limit`
    pub fn transactions_page(
        &self,
        wallet_id: Uuid,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Transaction>> {
        let cf = self.cf_handle(CF_POSTINGS)?;
        let prefix = wallet_id.as_bytes().to_vec();
        let mut upper = prefix.clone();
        upper.extend_from_slice(&[0xff; 24]);

        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&upper, ScanDirection::Reverse));
        let mut page = Vec::with_capacity(limit.min(256));
        let mut skipped = 0usize;
        for item in iter {
            if page.len() >= limit {
                break;
            }
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            if skipped < offset {
                skipped += 1;
                continue;
            }
            page.push(bincode::deserialize(&value)?);
        }
        Ok(page)
    }

    /// Most recent posting on the wallet
    pub fn last_transaction(&self, wallet_id: Uuid) -> Result<Option<Transaction>> {
        Ok(self.transactions_page(wallet_id, 0, 1)?.into_iter().next())
    }

    // Snapshot reads and maintenance

    /// Latest snapshot of the wallet by `snapshot_at`
    pub fn latest_snapshot(&self, wallet_id: Uuid) -> Result<Option<BalanceSnapshot>> {
        let cf = self.cf_handle(CF_SNAPSHOTS)?;
        let prefix = wallet_id.as_bytes().to_vec();
        let mut upper = prefix.clone();
        upper.extend_from_slice(&[0xff; 24]);

        let mut iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&upper, ScanDirection::Reverse));
        match iter.next() {
            Some(item) => {
                let (key, value) = item?;
                if key.starts_with(&prefix) {
                    Ok(Some(bincode::deserialize(&value)?))
                } else {
                    Ok(None)
                }
            }
            None => Ok(None),
        }
    }

    /// Every retained snapshot of the wallet, oldest first
    pub fn snapshots(&self, wallet_id: Uuid) -> Result<Vec<BalanceSnapshot>> {
        let mut snapshots = Vec::new();
        for (_, value) in self.snapshot_entries(wallet_id)? {
            snapshots.push(bincode::deserialize(&value)?);
        }
        Ok(snapshots)
    }

    /// Delete all but the `keep` most recent snapshots of the wallet
    ///
    /// Returns the number of snapshots removed.
    pub fn prune_snapshots(&self, wallet_id: Uuid, keep: usize) -> Result<usize> {
        let entries = self.snapshot_entries(wallet_id)?;
        if entries.len() <= keep {
            return Ok(0);
        }

        let cf = self.cf_handle(CF_SNAPSHOTS)?;
        let excess = entries.len() - keep;
        let mut batch = WriteBatch::default();
        for (key, _) in entries.iter().take(excess) {
            batch.delete_cf(cf, key);
        }
        self.db.write(batch)?;

        tracing::debug!(wallet_id = %wallet_id, removed = excess, "Pruned snapshots");
        Ok(excess)
    }

    fn snapshot_entries(&self, wallet_id: Uuid) -> Result<Vec<(Box<[u8]>, Box<[u8]>)>> {
        let cf = self.cf_handle(CF_SNAPSHOTS)?;
        let prefix = wallet_id.as_bytes().to_vec();

        let mut entries = Vec::new();
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&prefix, ScanDirection::Forward));
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            entries.push((key, value));
        }
        Ok(entries)
    }

    // Idempotency reads

    /// Record stored for (operation, key), if any
    pub fn get_idempotency_record(
        &self,
        operation: Operation,
        key: Uuid,
    ) -> Result<Option<IdempotencyRecord>> {
        let cf = self.cf_handle(CF_IDEMPOTENCY)?;
        match self.db.get_cf(cf, idempotency_key(operation, key))? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    // Statistics

    /// Get storage statistics
    pub fn get_stats(&self) -> Result<StorageStats> {
        Ok(StorageStats {
            total_wallets: self.approximate_count(self.cf_handle(CF_WALLETS)?)?,
            total_transactions: self.approximate_count(self.cf_handle(CF_TRANSACTIONS)?)?,
            total_snapshots: self.approximate_count(self.cf_handle(CF_SNAPSHOTS)?)?,
        })
    }

    fn approximate_count(&self, cf: &ColumnFamily) -> Result<u64> {
        let prop = self
            .db
            .property_int_value_cf(cf, "rocksdb.estimate-num-keys")?
            .unwrap_or(0);
        Ok(prop)
    }
}

/// Writes staged under the writer lock
pub struct UnitOfWork<'a> {
    storage: &'a Storage,
    clock: MutexGuard<'a, LedgerClock>,
    batch: WriteBatch,
    now: DateTime<Utc>,
}

impl std::fmt::Debug for UnitOfWork<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("now", &self.now)
            .field("staged_writes", &self.batch.len())
            .finish()
    }
}

impl<'a> UnitOfWork<'a> {
    /// Ledger instant of this unit, later than every instant handed out before
    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    /// Committed-state reads
    pub fn storage(&self) -> &'a Storage {
        self.storage
    }

    /// Move the ledger clock forward to at least `instant`
    pub fn advance_clock(&mut self, instant: DateTime<Utc>) {
        self.clock.observe(instant);
    }

    /// Insert a new wallet, enforcing one wallet per (owner, currency)
    pub fn insert_wallet(&mut self, wallet: &Wallet) -> Result<()> {
        let owners = self.storage.cf_handle(CF_WALLET_OWNERS)?;
        let index_key = owner_index_key(&wallet.owner_id, Some(wallet.base_currency));
        if self.storage.db.get_cf(owners, &index_key)?.is_some() {
            return Err(Error::DuplicateWallet {
                owner_id: wallet.owner_id.to_string(),
                currency: wallet.base_currency,
            });
        }
        if self.storage.get_wallet(wallet.id)?.is_some() {
            return Err(Error::DuplicateKey(format!("Wallet {} already exists", wallet.id)));
        }

        let wallets = self.storage.cf_handle(CF_WALLETS)?;
        self.batch
            .put_cf(wallets, wallet.id.as_bytes(), bincode::serialize(wallet)?);
        self.batch.put_cf(owners, &index_key, wallet.id.as_bytes());
        Ok(())
    }

    /// Versioned wallet update
    ///
    /// `wallet.version` must equal the stored version; the stored record gets
    /// `version + 1`, which is returned.
    pub fn update_wallet(&mut self, wallet: &Wallet) -> Result<Wallet> {
        let stored = self.storage.wallet_required(wallet.id)?;
        if stored.version != wallet.version {
            return Err(Error::VersionConflict {
                wallet_id: wallet.id,
                expected: wallet.version,
                actual: stored.version,
            });
        }

        let mut updated = wallet.clone();
        updated.version = stored.version + 1;

        let cf = self.storage.cf_handle(CF_WALLETS)?;
        self.batch
            .put_cf(cf, updated.id.as_bytes(), bincode::serialize(&updated)?);
        Ok(updated)
    }

    /// Append a ledger entry and its per-wallet index entry
    pub fn append_transaction(&mut self, tx: &Transaction) -> Result<()> {
        let value = bincode::serialize(tx)?;

        let transactions = self.storage.cf_handle(CF_TRANSACTIONS)?;
        self.batch.put_cf(transactions, tx.id.as_bytes(), &value);

        let postings = self.storage.cf_handle(CF_POSTINGS)?;
        let key = timeline_key(tx.wallet_id, tx.occurred_at, tx.id);
        self.batch.put_cf(postings, key, &value);
        Ok(())
    }

    /// Store a snapshot
    pub fn insert_snapshot(&mut self, snapshot: &BalanceSnapshot) -> Result<()> {
        let cf = self.storage.cf_handle(CF_SNAPSHOTS)?;
        let key = timeline_key(snapshot.wallet_id, snapshot.snapshot_at, snapshot.id);
        self.batch.put_cf(cf, key, bincode::serialize(snapshot)?);
        Ok(())
    }

    /// Insert an idempotency record, failing with `DuplicateKey` if
    /// (operation, key) is already taken
    pub fn insert_idempotency_record(&mut self, record: &IdempotencyRecord) -> Result<()> {
        let cf = self.storage.cf_handle(CF_IDEMPOTENCY)?;
        let key = idempotency_key(record.operation, record.idempotency_key);
        if self.storage.db.get_cf(cf, &key)?.is_some() {
            return Err(Error::DuplicateKey(format!(
                "Idempotency record exists for operation={}, key={}",
                record.operation, record.idempotency_key
            )));
        }
        self.batch.put_cf(cf, key, bincode::serialize(record)?);
        Ok(())
    }

    fn commit(self) -> Result<()> {
        let staged = self.batch.len();
        if staged == 0 {
            return Ok(());
        }
        self.storage.db.write(self.batch)?;
        tracing::trace!(staged_writes = staged, "Unit of work committed");
        Ok(())
    }
}

/// Storage statistics
#[derive(Debug, Clone)]
pub struct StorageStats {
    /// Approximate wallet count
    pub total_wallets: u64,
    /// Approximate ledger entry count
    pub total_transactions: u64,
    /// Approximate snapshot count
    pub total_snapshots: u64,
}

// Key helpers

fn instant_nanos(instant: DateTime<Utc>) -> i64 {
    instant.timestamp_nanos_opt().unwrap_or(i64::MAX)
}

/// Order-preserving encoding of a signed nanosecond instant
fn instant_key(nanos: i64) -> [u8; 8] {
    ((nanos as u64) ^ (1u64 << 63)).to_be_bytes()
}

fn timeline_key(wallet_id: Uuid, instant: DateTime<Utc>, id: Uuid) -> Vec<u8> {
    let mut key = Vec::with_capacity(40);
    key.extend_from_slice(wallet_id.as_bytes());
    key.extend_from_slice(&instant_key(instant_nanos(instant)));
    key.extend_from_slice(id.as_bytes());
    key
}

fn owner_index_key(owner_id: &OwnerId, currency: Option<Currency>) -> Vec<u8> {
    let owner = owner_id.as_str().as_bytes();
    let mut key = Vec::with_capacity(owner.len() + 7);
    key.extend_from_slice(&(owner.len() as u32).to_be_bytes());
    key.extend_from_slice(owner);
    if let Some(currency) = currency {
        key.extend_from_slice(currency.code().as_bytes());
    }
    key
}

fn idempotency_key(operation: Operation, key: Uuid) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(17);
    bytes.push(operation as u8);
    bytes.extend_from_slice(key.as_bytes());
    bytes
}

fn uuid_from_slice(bytes: &[u8]) -> Result<Uuid> {
    Uuid::from_slice(bytes).map_err(|e| Error::Storage(format!("Corrupt id: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::money::Money;
    use crate::types::{EntityMeta, GroupType, Reference, ReferenceType};
    use tempfile::TempDir;

    fn test_storage() -> (Storage, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();
        (Storage::open(&config).unwrap(), temp_dir)
    }

    fn deposit(wallet_id: Uuid, amount: &str, at: DateTime<Utc>) -> Transaction {
        Transaction::credit(
            wallet_id,
            Money::parse(amount, Currency::USD).unwrap(),
            Reference {
                group_type: GroupType::UserAction,
                reference_type: ReferenceType::Deposit,
                reference_id: Uuid::now_v7(),
            },
            None,
            at,
        )
        .unwrap()
    }

    #[test]
    fn test_storage_open() {
        let (storage, _temp) = test_storage();
        for name in COLUMN_FAMILIES {
            assert!(storage.db.cf_handle(name).is_some());
        }
    }

    #[test]
    fn test_instant_key_preserves_order() {
        assert!(instant_key(-5) < instant_key(0));
        assert!(instant_key(0) < instant_key(1));
        assert!(instant_key(1_000) < instant_key(i64::MAX));
    }

    #[test]
    fn test_unit_of_work_instants_strictly_increase() {
        let (storage, _temp) = test_storage();
        let first = storage.unit_of_work(|uow| Ok(uow.now())).unwrap();
        let second = storage.unit_of_work(|uow| Ok(uow.now())).unwrap();
        assert!(second > first);
    }

    #[test]
    fn test_insert_wallet_enforces_owner_currency_uniqueness() {
        let (storage, _temp) = test_storage();
        let owner = OwnerId::new("alice");

        let usd = Wallet::create(owner.clone(), Currency::USD);
        storage.unit_of_work(|uow| uow.insert_wallet(&usd)).unwrap();

        let again = Wallet::create(owner.clone(), Currency::USD);
        let result = storage.unit_of_work(|uow| uow.insert_wallet(&again));
        assert!(matches!(result, Err(Error::DuplicateWallet { .. })));

        let eur = Wallet::create(owner.clone(), Currency::EUR);
        storage.unit_of_work(|uow| uow.insert_wallet(&eur)).unwrap();

        assert_eq!(storage.wallets_by_owner(&owner).unwrap().len(), 2);
        assert_eq!(
            storage
                .find_wallet_by_owner(&owner, Currency::USD)
                .unwrap()
                .unwrap()
                .id,
            usd.id
        );
        assert!(storage
            .wallets_by_owner(&OwnerId::new("alic"))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_update_wallet_detects_stale_version() {
        let (storage, _temp) = test_storage();
        let wallet = Wallet::create(OwnerId::new("bob"), Currency::USD);
        storage.unit_of_work(|uow| uow.insert_wallet(&wallet)).unwrap();

        let mut first = storage.wallet_required(wallet.id).unwrap();
        let mut second = first.clone();

        first.suspend().unwrap();
        let saved = storage.unit_of_work(|uow| uow.update_wallet(&first)).unwrap();
        assert_eq!(saved.version, 1);

        second.close().unwrap();
        let result = storage.unit_of_work(|uow| uow.update_wallet(&second));
        assert!(matches!(
            result,
            Err(Error::VersionConflict {
                expected: 0,
                actual: 1,
                ..
            })
        ));
        assert_eq!(
            storage.wallet_required(wallet.id).unwrap().status,
            crate::types::WalletStatus::Suspended
        );
    }

    #[test]
    fn test_failed_unit_of_work_writes_nothing() {
        let (storage, _temp) = test_storage();
        let wallet_id = Uuid::now_v7();

        let result: Result<()> = storage.unit_of_work(|uow| {
            uow.append_transaction(&deposit(wallet_id, "10", uow.now()))?;
            Err(Error::InvalidAmount("abort".to_string()))
        });
        assert!(result.is_err());
        assert_eq!(storage.count_transactions(wallet_id).unwrap(), 0);
    }

    #[test]
    fn test_posting_range_queries() {
        let (storage, _temp) = test_storage();
        let wallet_id = Uuid::now_v7();
        let other_wallet = Uuid::now_v7();

        let mut instants = Vec::new();
        for amount in ["10", "20", "30"] {
            let at = storage
                .unit_of_work(|uow| {
                    let now = uow.now();
                    uow.append_transaction(&deposit(wallet_id, amount, now))?;
                    uow.append_transaction(&deposit(other_wallet, "1000", now))?;
                    Ok(now)
                })
                .unwrap();
            instants.push(at);
        }

        assert_eq!(storage.count_transactions(wallet_id).unwrap(), 3);
        assert_eq!(
            storage.sum_signed_amount(wallet_id, Currency::USD).unwrap(),
            Decimal::new(600000, 4)
        );
        assert_eq!(
            storage.sum_signed_amount(wallet_id, Currency::EUR).unwrap(),
            Decimal::ZERO
        );
        assert_eq!(
            storage.count_transactions_after(wallet_id, instants[0]).unwrap(),
            2
        );
        assert_eq!(
            storage
                .sum_signed_amount_after(wallet_id, Currency::USD, instants[1])
                .unwrap(),
            Decimal::new(300000, 4)
        );

        let page = storage.transactions_page(wallet_id, 0, 2).unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].amount.amount(), Decimal::new(300000, 4));
        assert_eq!(page[1].amount.amount(), Decimal::new(200000, 4));

        let rest = storage.transactions_page(wallet_id, 2, 10).unwrap();
        assert_eq!(rest.len(), 1);

        let last = storage.last_transaction(wallet_id).unwrap().unwrap();
        assert_eq!(storage.transaction_required(last.id).unwrap(), last);
    }

    #[test]
    fn test_idempotency_insert_reports_duplicate() {
        let (storage, _temp) = test_storage();
        let record = IdempotencyRecord {
            id: Uuid::now_v7(),
            operation: Operation::Deposit,
            idempotency_key: Uuid::new_v4(),
            request_fingerprint: "fp".to_string(),
            wallet_id: Uuid::now_v7(),
            transaction_id: Uuid::now_v7(),
            transaction_id2: None,
            meta: EntityMeta::now(),
        };

        storage
            .unit_of_work(|uow| uow.insert_idempotency_record(&record))
            .unwrap();

        let mut duplicate = record.clone();
        duplicate.id = Uuid::now_v7();
        let result = storage.unit_of_work(|uow| uow.insert_idempotency_record(&duplicate));
        assert!(matches!(result, Err(Error::DuplicateKey(_))));

        // Same key under another operation is independent
        duplicate.operation = Operation::Withdrawal;
        storage
            .unit_of_work(|uow| uow.insert_idempotency_record(&duplicate))
            .unwrap();

        let stored = storage
            .get_idempotency_record(Operation::Deposit, record.idempotency_key)
            .unwrap()
            .unwrap();
        assert_eq!(stored, record);
    }

    #[test]
    fn test_latest_snapshot_and_pruning() {
        let (storage, _temp) = test_storage();
        let wallet_id = Uuid::now_v7();

        for count in 1..=4u64 {
            storage
                .unit_of_work(|uow| {
                    uow.insert_snapshot(&BalanceSnapshot {
                        id: Uuid::now_v7(),
                        wallet_id,
                        balance: Money::parse(&count.to_string(), Currency::USD).unwrap(),
                        snapshot_at: uow.now(),
                        transaction_count: count,
                        last_transaction_id: None,
                        meta: EntityMeta::now(),
                    })
                })
                .unwrap();
        }

        let latest = storage.latest_snapshot(wallet_id).unwrap().unwrap();
        assert_eq!(latest.transaction_count, 4);
        assert!(storage.latest_snapshot(Uuid::now_v7()).unwrap().is_none());

        assert_eq!(storage.prune_snapshots(wallet_id, 2).unwrap(), 2);
        let kept = storage.snapshots(wallet_id).unwrap();
        assert_eq!(
            kept.iter().map(|s| s.transaction_count).collect::<Vec<_>>(),
            vec![3, 4]
        );
        assert_eq!(storage.prune_snapshots(wallet_id, 2).unwrap(), 0);
    }

    #[test]
    fn test_clock_restored_from_snapshots() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();

        let future = Utc::now() + chrono::Duration::days(1);
        {
            let storage = Storage::open(&config).unwrap();
            storage
                .unit_of_work(|uow| {
                    uow.insert_snapshot(&BalanceSnapshot {
                        id: Uuid::now_v7(),
                        wallet_id: Uuid::now_v7(),
                        balance: Money::zero(Currency::USD),
                        snapshot_at: future,
                        transaction_count: 0,
                        last_transaction_id: None,
                        meta: EntityMeta::now(),
                    })
                })
                .unwrap();
        }

        let reopened = Storage::open(&config).unwrap();
        let now = reopened.unit_of_work(|uow| Ok(uow.now())).unwrap();
        assert!(now > future);
    }

    #[test]
    fn test_clock_restored_from_postings() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();

        let future = Utc::now() + chrono::Duration::days(1);
        let wallet = Wallet::create(OwnerId::new("late"), Currency::USD);
        {
            let storage = Storage::open(&config).unwrap();
            storage
                .unit_of_work(|uow| {
                    uow.insert_wallet(&wallet)?;
                    uow.append_transaction(&deposit(wallet.id, "5", future))
                })
                .unwrap();
        }

        let reopened = Storage::open(&config).unwrap();
        let now = reopened.unit_of_work(|uow| Ok(uow.now())).unwrap();
        assert!(now > future);

        // Postings written after reopen still sort after the restored one
        reopened
            .unit_of_work(|uow| {
                let at = uow.now();
                uow.append_transaction(&deposit(wallet.id, "1", at))
            })
            .unwrap();
        let newest = reopened.last_transaction(wallet.id).unwrap().unwrap();
        assert!(newest.occurred_at > future);
    }
}
