//! Money value type
//!
//! Amounts are exact decimals normalized to [`Money::SCALE`] fraction digits
//! with half-up rounding at construction. Posted amounts stay below
//! 10^[`Money::MAX_INTEGER_DIGITS`]. Arithmetic is only defined between
//! values of the same currency.

use crate::{Error, Result};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// ISO 4217 currency code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Currency {
    /// US Dollar
    USD,
    /// Euro
    EUR,
    /// British Pound
    GBP,
    /// Turkish Lira
    TRY,
}

impl Currency {
    /// Every supported currency
    pub const ALL: [Currency; 4] = [Currency::USD, Currency::EUR, Currency::GBP, Currency::TRY];

    /// ISO 4217 code
    pub fn code(&self) -> &'static str {
        match self {
            Currency::USD => "USD",
            Currency::EUR => "EUR",
            Currency::GBP => "GBP",
            Currency::TRY => "TRY",
        }
    }
}

impl FromStr for Currency {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "USD" => Ok(Currency::USD),
            "EUR" => Ok(Currency::EUR),
            "GBP" => Ok(Currency::GBP),
            "TRY" => Ok(Currency::TRY),
            other => Err(Error::InvalidAmount(format!("Unsupported currency: {}", other))),
        }
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Fixed-scale amount bound to a currency
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Money {
    amount: Decimal,
    currency: Currency,
}

impl Money {
    /// Fraction digits kept for every monetary value
    pub const SCALE: u32 = 4;

    /// Integer digits allowed in a posted amount (precision 19 at scale 4)
    pub const MAX_INTEGER_DIGITS: u32 = 15;

    /// Create a value, rounding half-up to [`Money::SCALE`]
    ///
    /// Fails with `InvalidAmount` when the value is too large to carry
    /// [`Money::SCALE`] fraction digits.
    pub fn new(amount: Decimal, currency: Currency) -> Result<Self> {
        Ok(Self {
            amount: normalize(amount)?,
            currency,
        })
    }

    /// Zero in the given currency
    pub fn zero(currency: Currency) -> Self {
        Self {
            amount: Decimal::new(0, Self::SCALE),
            currency,
        }
    }

    /// Parse a decimal string such as `"100.00"`
    ///
    /// Rejects values with more than [`Money::MAX_INTEGER_DIGITS`] integer digits.
    pub fn parse(amount: &str, currency: Currency) -> Result<Self> {
        let value = Decimal::from_str(amount.trim())
            .map_err(|e| Error::InvalidAmount(format!("'{}': {}", amount, e)))?;
        let money = Self::new(value, currency)?;
        money.require_within_limit()?;
        Ok(money)
    }

    /// Amount at fixed scale
    pub fn amount(&self) -> Decimal {
        self.amount
    }

    /// Currency of the amount
    pub fn currency(&self) -> Currency {
        self.currency
    }

    /// Sum of two values of the same currency
    pub fn checked_add(&self, other: &Money) -> Result<Money> {
        self.require_same_currency(other)?;
        let sum = self
            .amount
            .checked_add(other.amount)
            .ok_or_else(|| Error::InvalidAmount("Amount overflow".to_string()))?;
        Money::new(sum, self.currency)
    }

    /// Difference of two values of the same currency
    pub fn checked_sub(&self, other: &Money) -> Result<Money> {
        self.require_same_currency(other)?;
        let diff = self
            .amount
            .checked_sub(other.amount)
            .ok_or_else(|| Error::InvalidAmount("Amount overflow".to_string()))?;
        Money::new(diff, self.currency)
    }

    /// Value with the sign flipped
    pub fn negate(&self) -> Money {
        Money {
            amount: -self.amount,
            currency: self.currency,
        }
    }

    /// Multiply by a rate and rebind to another currency, rounding half-up
    pub fn convert(&self, rate: Decimal, currency: Currency) -> Result<Money> {
        let converted = self
            .amount
            .checked_mul(rate)
            .ok_or_else(|| Error::InvalidAmount("Amount overflow during conversion".to_string()))?;
        Money::new(converted, currency)
    }

    /// Strictly greater than zero
    pub fn is_positive(&self) -> bool {
        self.amount > Decimal::ZERO
    }

    /// Strictly less than zero
    pub fn is_negative(&self) -> bool {
        self.amount < Decimal::ZERO
    }

    /// Exactly zero
    pub fn is_zero(&self) -> bool {
        self.amount.is_zero()
    }

    /// Reject zero, negative and over-limit amounts
    pub fn require_positive(self) -> Result<Money> {
        if !self.is_positive() {
            return Err(Error::InvalidAmount(format!(
                "Amount must be positive, got {}",
                self
            )));
        }
        self.require_within_limit()?;
        Ok(self)
    }

    /// Reject values with more than [`Money::MAX_INTEGER_DIGITS`] integer digits
    pub fn require_within_limit(&self) -> Result<()> {
        if self.amount.abs() >= amount_limit() || self.amount.scale() != Self::SCALE {
            return Err(Error::InvalidAmount(format!(
                "Amount {} exceeds {} integer digits",
                self,
                Self::MAX_INTEGER_DIGITS
            )));
        }
        Ok(())
    }

    /// Fail with `CurrencyMismatch` unless `other` has the same currency
    pub fn require_same_currency(&self, other: &Money) -> Result<()> {
        require_currency(self.currency, other.currency)
    }
}

/// Fail with `CurrencyMismatch` unless `actual == expected`
pub fn require_currency(expected: Currency, actual: Currency) -> Result<()> {
    if expected != actual {
        return Err(Error::CurrencyMismatch { expected, actual });
    }
    Ok(())
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.amount, self.currency)
    }
}

/// Add a signed posting amount to a running balance
pub(crate) fn accumulate(sum: Decimal, amount: Decimal) -> Result<Decimal> {
    sum.checked_add(amount)
        .ok_or_else(|| Error::InvalidAmount(format!("Balance overflow adding {} to {}", amount, sum)))
}

fn amount_limit() -> Decimal {
    Decimal::from(10i64.pow(Money::MAX_INTEGER_DIGITS))
}

fn normalize(value: Decimal) -> Result<Decimal> {
    let mut rounded = value.round_dp_with_strategy(Money::SCALE, RoundingStrategy::MidpointAwayFromZero);
    // rescale keeps a lower scale when the integer part leaves no room
    rounded.rescale(Money::SCALE);
    if rounded.scale() != Money::SCALE {
        return Err(Error::InvalidAmount(format!(
            "Amount {} cannot be held at scale {}",
            value,
            Money::SCALE
        )));
    }
    Ok(rounded)
}
