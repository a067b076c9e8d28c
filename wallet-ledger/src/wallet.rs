//! Wallet management
//!
//! Every owner-facing operation checks that the caller owns the wallet and
//! fails with `AccessDenied` otherwise. Status changes are saved through the
//! versioned wallet update.

use crate::{
    balance::BalanceCalculator,
    money::{Currency, Money},
    storage::Storage,
    types::{OwnerId, Wallet},
    Error, Result,
};
use std::sync::Arc;
use uuid::Uuid;

/// Creates wallets and drives their lifecycle
#[derive(Debug, Clone)]
pub struct WalletService {
    storage: Arc<Storage>,
    calculator: BalanceCalculator,
}

impl WalletService {
    /// Create service
    pub fn new(storage: Arc<Storage>, calculator: BalanceCalculator) -> Self {
        Self {
            storage,
            calculator,
        }
    }

    /// Open a wallet; an owner holds at most one wallet per currency
    pub fn create_wallet(&self, owner_id: OwnerId, currency: Currency) -> Result<Wallet> {
        let wallet = Wallet::create(owner_id, currency);
        self.storage.unit_of_work(|uow| uow.insert_wallet(&wallet))?;

        tracing::info!(
            wallet_id = %wallet.id,
            owner_id = %wallet.owner_id,
            currency = %wallet.base_currency,
            "Created wallet"
        );
        Ok(wallet)
    }

    /// Get wallet by ID
    pub fn get_wallet(&self, wallet_id: Uuid) -> Result<Wallet> {
        self.storage.wallet_required(wallet_id)
    }

    /// Get wallet by ID on behalf of `owner_id`
    pub fn get_wallet_for_owner(&self, wallet_id: Uuid, owner_id: &OwnerId) -> Result<Wallet> {
        let wallet = self.get_wallet(wallet_id)?;
        ensure_ownership(&wallet, owner_id)?;
        Ok(wallet)
    }

    /// Wallets held by `owner_id`
    pub fn wallets_for_owner(&self, owner_id: &OwnerId) -> Result<Vec<Wallet>> {
        self.storage.wallets_by_owner(owner_id)
    }

    /// Every wallet
    pub fn all_wallets(&self) -> Result<Vec<Wallet>> {
        self.storage.all_wallets()
    }

    /// ACTIVE -> SUSPENDED
    pub fn suspend(&self, wallet_id: Uuid, owner_id: &OwnerId) -> Result<Wallet> {
        self.change_status(wallet_id, owner_id, "Suspended wallet", Wallet::suspend)
    }

    /// SUSPENDED -> ACTIVE
    pub fn activate(&self, wallet_id: Uuid, owner_id: &OwnerId) -> Result<Wallet> {
        self.change_status(wallet_id, owner_id, "Activated wallet", Wallet::activate)
    }

    /// Close the wallet for good
    pub fn close(&self, wallet_id: Uuid, owner_id: &OwnerId) -> Result<Wallet> {
        self.change_status(wallet_id, owner_id, "Closed wallet", Wallet::close)
    }

    /// Current balance in the wallet's base currency
    pub fn balance(&self, wallet_id: Uuid, owner_id: &OwnerId) -> Result<Money> {
        let wallet = self.get_wallet_for_owner(wallet_id, owner_id)?;
        self.calculator
            .calculate_balance(wallet.id, wallet.base_currency)
    }

    fn change_status(
        &self,
        wallet_id: Uuid,
        owner_id: &OwnerId,
        message: &'static str,
        transition: fn(&mut Wallet) -> Result<()>,
    ) -> Result<Wallet> {
        let wallet = self.storage.unit_of_work(|uow| {
            let mut wallet = uow.storage().wallet_required(wallet_id)?;
            ensure_ownership(&wallet, owner_id)?;
            transition(&mut wallet)?;
            uow.update_wallet(&wallet)
        })?;

        tracing::info!(
            wallet_id = %wallet.id,
            status = ?wallet.status,
            version = wallet.version,
            "{}",
            message
        );
        Ok(wallet)
    }
}

fn ensure_ownership(wallet: &Wallet, owner_id: &OwnerId) -> Result<()> {
    if !wallet.is_owned_by(owner_id) {
        return Err(Error::AccessDenied(wallet.id));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BalanceStrategy;
    use crate::metrics::Metrics;
    use crate::types::WalletStatus;
    use crate::Config;
    use tempfile::TempDir;

    fn service() -> (WalletService, TempDir) {
        let temp = TempDir::new().unwrap();
        let mut config = Config::default();
        config.data_dir = temp.path().to_path_buf();
        let storage = Arc::new(Storage::open(&config).unwrap());
        let calculator =
            BalanceCalculator::new(storage.clone(), BalanceStrategy::Snapshot, Metrics::new().unwrap());
        (WalletService::new(storage, calculator), temp)
    }

    #[test]
    fn test_create_and_list() {
        let (wallets, _temp) = service();
        let alice = OwnerId::new("alice");

        let usd = wallets.create_wallet(alice.clone(), Currency::USD).unwrap();
        wallets.create_wallet(alice.clone(), Currency::GBP).unwrap();
        wallets.create_wallet(OwnerId::new("bob"), Currency::USD).unwrap();

        assert!(matches!(
            wallets.create_wallet(alice.clone(), Currency::USD),
            Err(Error::DuplicateWallet { .. })
        ));
        assert_eq!(wallets.wallets_for_owner(&alice).unwrap().len(), 2);
        assert_eq!(wallets.all_wallets().unwrap().len(), 3);
        assert_eq!(wallets.get_wallet(usd.id).unwrap(), usd);
    }

    #[test]
    fn test_ownership_is_enforced() {
        let (wallets, _temp) = service();
        let owner = OwnerId::new("owner");
        let stranger = OwnerId::new("stranger");
        let wallet = wallets.create_wallet(owner.clone(), Currency::EUR).unwrap();

        assert!(wallets.get_wallet_for_owner(wallet.id, &owner).is_ok());
        assert!(matches!(
            wallets.get_wallet_for_owner(wallet.id, &stranger),
            Err(Error::AccessDenied(_))
        ));
        assert!(matches!(
            wallets.suspend(wallet.id, &stranger),
            Err(Error::AccessDenied(_))
        ));
        assert!(matches!(
            wallets.balance(wallet.id, &stranger),
            Err(Error::AccessDenied(_))
        ));
        assert!(matches!(
            wallets.get_wallet(Uuid::now_v7()),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_status_changes_bump_version() {
        let (wallets, _temp) = service();
        let owner = OwnerId::new("owner");
        let wallet = wallets.create_wallet(owner.clone(), Currency::USD).unwrap();

        let suspended = wallets.suspend(wallet.id, &owner).unwrap();
        assert_eq!(suspended.status, WalletStatus::Suspended);
        assert_eq!(suspended.version, 1);

        let active = wallets.activate(wallet.id, &owner).unwrap();
        assert_eq!(active.status, WalletStatus::Active);
        assert_eq!(active.version, 2);

        let closed = wallets.close(wallet.id, &owner).unwrap();
        assert_eq!(closed.status, WalletStatus::Closed);

        assert!(matches!(
            wallets.activate(wallet.id, &owner),
            Err(Error::WalletClosed(_))
        ));
        assert_eq!(wallets.get_wallet(wallet.id).unwrap().version, 3);
    }

    #[test]
    fn test_balance_of_new_wallet_is_zero() {
        let (wallets, _temp) = service();
        let owner = OwnerId::new("owner");
        let wallet = wallets.create_wallet(owner.clone(), Currency::TRY).unwrap();

        let balance = wallets.balance(wallet.id, &owner).unwrap();
        assert_eq!(balance, Money::zero(Currency::TRY));
    }
}
