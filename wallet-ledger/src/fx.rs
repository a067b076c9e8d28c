//! Foreign-exchange conversion between wallets
//!
//! A conversion debits the source wallet in its currency and credits the
//! target wallet with the converted amount. Both legs are one unit of work and
//! share an `FX_EXCHANGE` reference.

use crate::{
    ledger::LedgerService,
    money::{require_currency, Currency, Money},
    storage::Storage,
    types::{GroupType, Reference, ReferenceType, Transaction},
    Error, Result,
};
use rust_decimal::{Decimal, RoundingStrategy};
use std::sync::Arc;
use uuid::Uuid;

/// Source of exchange rates
///
/// Implementations must return exactly one for identical currencies.
pub trait RateProvider: Send + Sync + std::fmt::Debug {
    /// Units of `to` per unit of `from`
    fn rate(&self, from: Currency, to: Currency) -> Result<Decimal>;

    /// Convert `amount` into `to`, rounding half-up to the money scale
    fn convert(&self, amount: &Money, to: Currency) -> Result<Money> {
        if amount.currency() == to {
            return Ok(*amount);
        }
        let rate = self.rate(amount.currency(), to)?;
        amount.convert(rate, to)
    }
}

/// Static rate table pivoting through USD
#[derive(Debug, Clone)]
pub struct FixedRateProvider {
    per_usd: [(Currency, Decimal); 4],
}

impl FixedRateProvider {
    /// Digits kept on the inverse leg through USD
    const PIVOT_SCALE: u32 = 10;
    /// Digits kept on a quoted rate
    const RATE_SCALE: u32 = 6;

    /// Units of each currency per US dollar
    pub fn new() -> Self {
        Self {
            per_usd: [
                (Currency::USD, Decimal::ONE),
                (Currency::EUR, Decimal::new(92, 2)),
                (Currency::GBP, Decimal::new(79, 2)),
                (Currency::TRY, Decimal::new(3250, 2)),
            ],
        }
    }

    fn per_usd(&self, currency: Currency) -> Result<Decimal> {
        self.per_usd
            .iter()
            .find(|(c, _)| *c == currency)
            .map(|(_, rate)| *rate)
            .ok_or_else(|| Error::InvalidAmount(format!("No rate for currency {}", currency)))
    }
}

impl Default for FixedRateProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl RateProvider for FixedRateProvider {
    fn rate(&self, from: Currency, to: Currency) -> Result<Decimal> {
        if from == to {
            return Ok(Decimal::ONE);
        }

        let from_per_usd = self.per_usd(from)?;
        let to_usd = Decimal::ONE
            .checked_div(from_per_usd)
            .ok_or_else(|| Error::InvalidAmount(format!("Zero rate for currency {}", from)))?
            .round_dp_with_strategy(Self::PIVOT_SCALE, RoundingStrategy::MidpointAwayFromZero);

        let mut rate = (to_usd * self.per_usd(to)?)
            .round_dp_with_strategy(Self::RATE_SCALE, RoundingStrategy::MidpointAwayFromZero);
        rate.rescale(Self::RATE_SCALE);
        Ok(rate)
    }
}

/// Result of a conversion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FxConversion {
    /// Debit on the source wallet
    pub debit: Transaction,
    /// Credit on the target wallet
    pub credit: Transaction,
    /// Rate applied
    pub rate: Decimal,
    /// Amount taken from the source wallet
    pub source_amount: Money,
    /// Amount given to the target wallet
    pub target_amount: Money,
}

/// Converts balances between wallets of different currencies
#[derive(Debug, Clone)]
pub struct FxService {
    storage: Arc<Storage>,
    ledger: LedgerService,
    rates: Arc<dyn RateProvider>,
}

impl FxService {
    /// Create service
    pub fn new(storage: Arc<Storage>, ledger: LedgerService, rates: Arc<dyn RateProvider>) -> Self {
        Self {
            storage,
            ledger,
            rates,
        }
    }

    /// Quote the rate from `from` to `to`
    pub fn rate(&self, from: Currency, to: Currency) -> Result<Decimal> {
        self.rates.rate(from, to)
    }

    /// Debit `source_amount` from the source wallet and credit its converted
    /// value to the target wallet
    pub fn convert(
        &self,
        source_wallet_id: Uuid,
        target_wallet_id: Uuid,
        source_amount: Money,
        correlation_id: Uuid,
        description: Option<String>,
    ) -> Result<FxConversion> {
        if source_wallet_id == target_wallet_id {
            return Err(Error::SameWalletTransfer(source_wallet_id));
        }
        let source_amount = source_amount.require_positive()?;

        let conversion = self.storage.unit_of_work(|uow| {
            let storage = uow.storage();
            let source = storage.wallet_required(source_wallet_id)?;
            let target = storage.wallet_required(target_wallet_id)?;

            source.ensure_operational()?;
            target.ensure_operational()?;
            require_currency(source.base_currency, source_amount.currency())?;

            let rate = self.rates.rate(source.base_currency, target.base_currency)?;
            let target_amount = self.rates.convert(&source_amount, target.base_currency)?;

            self.ledger.ensure_sufficient_balance(&source, &source_amount)?;

            let now = uow.now();
            let reference = Reference {
                group_type: GroupType::FxConversion,
                reference_type: ReferenceType::FxExchange,
                reference_id: correlation_id,
            };
            let memo = format!(
                "{} (from {} to {})",
                description.as_deref().unwrap_or("FX conversion"),
                source.base_currency,
                target.base_currency
            );

            let debit = Transaction::debit(source.id, source_amount, reference, Some(memo.clone()), now)?;
            let credit = Transaction::credit(target.id, target_amount, reference, Some(memo), now)?;
            uow.append_transaction(&debit)?;
            uow.append_transaction(&credit)?;

            Ok(FxConversion {
                debit,
                credit,
                rate,
                source_amount,
                target_amount,
            })
        })?;

        tracing::info!(
            source_wallet_id = %source_wallet_id,
            target_wallet_id = %target_wallet_id,
            rate = %conversion.rate,
            source_amount = %conversion.source_amount,
            target_amount = %conversion.target_amount,
            "Converted currency"
        );
        self.ledger
            .postings_committed(&[conversion.debit.clone(), conversion.credit.clone()]);
        Ok(conversion)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balance::BalanceCalculator;
    use crate::config::BalanceStrategy;
    use crate::metrics::Metrics;
    use crate::snapshot::SnapshotService;
    use crate::types::{OwnerId, Wallet};
    use crate::Config;
    use tempfile::TempDir;

    fn rate(from: Currency, to: Currency) -> String {
        FixedRateProvider::new().rate(from, to).unwrap().to_string()
    }

    #[test]
    fn test_fixed_rates() {
        assert_eq!(rate(Currency::USD, Currency::EUR), "0.920000");
        assert_eq!(rate(Currency::EUR, Currency::USD), "1.086957");
        assert_eq!(rate(Currency::GBP, Currency::TRY), "41.139241");
        for currency in Currency::ALL {
            assert_eq!(
                FixedRateProvider::new().rate(currency, currency).unwrap(),
                Decimal::ONE
            );
        }
    }

    #[test]
    fn test_provider_convert_rounds_to_money_scale() {
        let provider = FixedRateProvider::new();
        let eur = provider
            .convert(&Money::parse("10.00", Currency::USD).unwrap(), Currency::EUR)
            .unwrap();
        assert_eq!(eur, Money::parse("9.2", Currency::EUR).unwrap());

        let usd = provider
            .convert(&Money::parse("3.33", Currency::EUR).unwrap(), Currency::USD)
            .unwrap();
        // 3.33 * 1.086957 = 3.61956681
        assert_eq!(usd.amount().to_string(), "3.6196");
    }

    struct Fixture {
        storage: Arc<Storage>,
        ledger: LedgerService,
        fx: FxService,
        _temp: TempDir,
    }

    fn fixture() -> Fixture {
        let temp = TempDir::new().unwrap();
        let mut config = Config::default();
        config.data_dir = temp.path().to_path_buf();
        let storage = Arc::new(Storage::open(&config).unwrap());
        let metrics = Metrics::new().unwrap();
        let calculator =
            BalanceCalculator::new(storage.clone(), BalanceStrategy::FullScan, metrics.clone());
        let snapshots = SnapshotService::new(storage.clone(), 100, 5, metrics.clone());
        let ledger = LedgerService::new(storage.clone(), calculator, snapshots, metrics);
        let fx = FxService::new(storage.clone(), ledger.clone(), Arc::new(FixedRateProvider::new()));
        Fixture {
            storage,
            ledger,
            fx,
            _temp: temp,
        }
    }

    fn wallet(storage: &Storage, currency: Currency) -> Wallet {
        let wallet = Wallet::create(OwnerId::new("fx-owner"), currency);
        storage.unit_of_work(|uow| uow.insert_wallet(&wallet)).unwrap();
        wallet
    }

    #[test]
    fn test_convert_posts_both_legs() {
        let f = fixture();
        let usd = wallet(&f.storage, Currency::USD);
        let eur = wallet(&f.storage, Currency::EUR);
        f.ledger
            .deposit(usd.id, Money::parse("100", Currency::USD).unwrap(), Uuid::new_v4(), None)
            .unwrap();

        let correlation = Uuid::new_v4();
        let result = f
            .fx
            .convert(usd.id, eur.id, Money::parse("50", Currency::USD).unwrap(), correlation, None)
            .unwrap();

        assert_eq!(result.rate.to_string(), "0.920000");
        assert_eq!(result.target_amount, Money::parse("46", Currency::EUR).unwrap());
        assert_eq!(result.debit.reference.reference_type, ReferenceType::FxExchange);
        assert_eq!(result.debit.reference.reference_id, correlation);
        assert_eq!(result.credit.reference, result.debit.reference);
        assert_eq!(result.debit.occurred_at, result.credit.occurred_at);
        assert_eq!(
            result.debit.description.as_deref(),
            Some("FX conversion (from USD to EUR)")
        );

        assert_eq!(
            f.storage.sum_signed_amount(usd.id, Currency::USD).unwrap().to_string(),
            "50.0000"
        );
        assert_eq!(
            f.storage.sum_signed_amount(eur.id, Currency::EUR).unwrap().to_string(),
            "46.0000"
        );
    }

    #[test]
    fn test_convert_rejections() {
        let f = fixture();
        let usd = wallet(&f.storage, Currency::USD);
        let eur = wallet(&f.storage, Currency::EUR);

        let insufficient = f.fx.convert(
            usd.id,
            eur.id,
            Money::parse("1", Currency::USD).unwrap(),
            Uuid::new_v4(),
            None,
        );
        assert!(matches!(insufficient, Err(Error::InsufficientBalance { .. })));

        let wrong_currency = f.fx.convert(
            usd.id,
            eur.id,
            Money::parse("1", Currency::EUR).unwrap(),
            Uuid::new_v4(),
            None,
        );
        assert!(matches!(wrong_currency, Err(Error::CurrencyMismatch { .. })));

        let same = f.fx.convert(
            usd.id,
            usd.id,
            Money::parse("1", Currency::USD).unwrap(),
            Uuid::new_v4(),
            None,
        );
        assert!(matches!(same, Err(Error::SameWalletTransfer(_))));

        assert_eq!(f.storage.count_transactions(eur.id).unwrap(), 0);
    }
}
