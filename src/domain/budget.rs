use crate::error::PaymentError;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, AddAssign, Sub, SubAssign};

/// Number of decimal places a spendable amount may carry (cents).
pub const CURRENCY_SCALE: u32 = 2;

/// A fixed-point monetary value that may be zero.
///
/// Wraps `rust_decimal::Decimal` so ledger arithmetic never touches binary
/// floating point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Balance(pub Decimal);

/// A strictly positive monetary amount moved by a single operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "Decimal", into = "Decimal")]
pub struct Amount(Decimal);

impl Amount {
    pub fn new(value: Decimal) -> Result<Self, PaymentError> {
        if value > Decimal::ZERO {
            Ok(Self(value))
        } else {
            Err(PaymentError::InvalidAmount(format!(
                "amount must be positive, got {value}"
            )))
        }
    }

    pub fn value(&self) -> Decimal {
        self.0
    }

    /// True when the amount can be expressed in whole cents.
    pub fn is_currency_scaled(&self) -> bool {
        self.0.normalize().scale() <= CURRENCY_SCALE
    }
}

impl TryFrom<Decimal> for Amount {
    type Error = PaymentError;

    fn try_from(value: Decimal) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Amount> for Decimal {
    fn from(amount: Amount) -> Self {
        amount.0
    }
}

impl From<Amount> for Balance {
    fn from(amount: Amount) -> Self {
        Self(amount.0)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Balance {
    pub const ZERO: Self = Self(Decimal::ZERO);

    pub fn new(amount: Decimal) -> Self {
        Self(amount)
    }

    pub fn value(&self) -> Decimal {
        self.0
    }
}

impl fmt::Display for Balance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Add for Balance {
    type Output = Self;
    fn add(self, rhs: Self) -> Self::Output {
        Self(self.0 + rhs.0)
    }
}

impl Sub for Balance {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self::Output {
        Self(self.0 - rhs.0)
    }
}

impl AddAssign for Balance {
    fn add_assign(&mut self, rhs: Self) {
        self.0 += rhs.0;
    }
}

impl SubAssign for Balance {
    fn sub_assign(&mut self, rhs: Self) {
        self.0 -= rhs.0;
    }
}

/// A named bucket of funds within a participant's support plan.
///
/// `remaining_amount == allocated_amount - spent_amount` holds at every
/// committed state, and `spent_amount` never decreases. `held_amount` is the
/// part of `remaining_amount` promised to authorized but unsettled postings;
/// new reservations only see what is left after it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetCategory {
    pub id: String,
    pub plan_id: String,
    /// Owner of the plan; only this participant may spend from the category.
    pub participant_id: String,
    /// Support category code, e.g. `transport` or `daily_activities`.
    pub category_code: String,
    pub allocated_amount: Balance,
    pub spent_amount: Balance,
    pub remaining_amount: Balance,
    #[serde(default)]
    pub held_amount: Balance,
}

impl BudgetCategory {
    pub fn new(
        id: impl Into<String>,
        plan_id: impl Into<String>,
        participant_id: impl Into<String>,
        category_code: impl Into<String>,
        allocated: Balance,
    ) -> Self {
        Self {
            id: id.into(),
            plan_id: plan_id.into(),
            participant_id: participant_id.into(),
            category_code: category_code.into(),
            allocated_amount: allocated,
            spent_amount: Balance::ZERO,
            remaining_amount: allocated,
            held_amount: Balance::ZERO,
        }
    }

    pub fn is_balanced(&self) -> bool {
        self.allocated_amount == self.spent_amount + self.remaining_amount
    }

    /// Remaining funds not yet promised to a held posting.
    pub fn available(&self) -> Balance {
        self.remaining_amount - self.held_amount
    }

    pub fn can_cover(&self, amount: Amount) -> bool {
        self.available() >= amount.into()
    }

    /// Sets `amount` aside for a posting that will be committed later.
    pub fn hold(&mut self, amount: Amount) -> Result<(), PaymentError> {
        if !self.can_cover(amount) {
            return Err(PaymentError::InsufficientFunds {
                category_id: self.id.clone(),
                requested: amount.value(),
                remaining: self.available().value(),
            });
        }
        self.held_amount += amount.into();
        Ok(())
    }

    pub fn release(&mut self, amount: Amount) {
        self.held_amount = Balance((self.held_amount.0 - amount.value()).max(Decimal::ZERO));
    }

    /// Moves `amount` from remaining to spent if the unheld funds cover it.
    /// A posting that converts its own hold must release it first.
    ///
    /// Callers must hold whatever guard makes the check and the write one
    /// atomic step.
    pub fn debit(&mut self, amount: Amount) -> Result<(), PaymentError> {
        if !self.can_cover(amount) {
            return Err(PaymentError::LedgerViolation(format!(
                "category '{}' has {} available, cannot commit {}",
                self.id,
                self.available(),
                amount
            )));
        }
        self.spent_amount += amount.into();
        self.remaining_amount -= amount.into();
        Ok(())
    }
}

/// Funds held at authorization for the posting with `posting_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reservation {
    pub posting_id: String,
    pub category_id: String,
    pub amount: Amount,
    /// Unheld funds just before this reservation was taken.
    pub available_at_authorization: Balance,
}

/// What caused a ledger debit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum PostingSource {
    /// A payment transaction reached COMPLETED.
    Settlement(String),
    /// Budget was tokenized into a voucher.
    VoucherMint(String),
}

impl PostingSource {
    /// Deterministic posting id; a second commit with the same source is a no-op.
    pub fn posting_id(&self) -> String {
        match self {
            Self::Settlement(id) => format!("settlement:{id}"),
            Self::VoucherMint(id) => format!("voucher_mint:{id}"),
        }
    }
}

/// One committed debit against a budget category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerPosting {
    pub id: String,
    pub category_id: String,
    pub amount: Amount,
    pub source: PostingSource,
    pub posted_at: DateTime<Utc>,
}

impl LedgerPosting {
    pub fn new(category_id: impl Into<String>, amount: Amount, source: PostingSource) -> Self {
        Self {
            id: source.posting_id(),
            category_id: category_id.into(),
            amount,
            source,
            posted_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn category(allocated: Decimal) -> BudgetCategory {
        BudgetCategory::new("cat-1", "plan-1", "participant-1", "transport", Balance(allocated))
    }

    #[test]
    fn test_balance_arithmetic() {
        let b1 = Balance::new(dec!(10.0));
        let b2 = Balance::new(dec!(5.0));
        assert_eq!(b1 + b2, Balance::new(dec!(15.0)));
        assert_eq!(b1 - b2, Balance::new(dec!(5.0)));
    }

    #[test]
    fn test_amount_validation() {
        assert!(Amount::new(dec!(1.0)).is_ok());
        assert!(matches!(
            Amount::new(dec!(0.0)),
            Err(PaymentError::InvalidAmount(_))
        ));
        assert!(matches!(
            Amount::new(dec!(-1.0)),
            Err(PaymentError::InvalidAmount(_))
        ));
    }

    #[test]
    fn test_amount_currency_scale() {
        assert!(Amount::new(dec!(150.00)).unwrap().is_currency_scaled());
        assert!(Amount::new(dec!(150.100)).unwrap().is_currency_scaled());
        assert!(!Amount::new(dec!(0.001)).unwrap().is_currency_scaled());
    }

    #[test]
    fn test_amount_rejects_non_positive_json() {
        let parsed: Result<Amount, _> = serde_json::from_str("\"-5\"");
        assert!(parsed.is_err());
        let parsed: Amount = serde_json::from_str("\"12.50\"").unwrap();
        assert_eq!(parsed.value(), dec!(12.50));
    }

    #[test]
    fn test_new_category_is_balanced() {
        let category = category(dec!(500));
        assert_eq!(category.remaining_amount, Balance(dec!(500)));
        assert_eq!(category.spent_amount, Balance::ZERO);
        assert!(category.is_balanced());
    }

    #[test]
    fn test_debit_moves_remaining_to_spent() {
        let mut category = category(dec!(500));
        category.debit(Amount::new(dec!(200)).unwrap()).unwrap();
        assert_eq!(category.spent_amount, Balance(dec!(200)));
        assert_eq!(category.remaining_amount, Balance(dec!(300)));
        assert!(category.is_balanced());
    }

    #[test]
    fn test_debit_guard_rejects_overdraw() {
        let mut category = category(dec!(100));
        let result = category.debit(Amount::new(dec!(100.01)).unwrap());
        assert!(matches!(result, Err(PaymentError::LedgerViolation(_))));
        assert_eq!(category.remaining_amount, Balance(dec!(100)));
        assert_eq!(category.spent_amount, Balance::ZERO);
    }

    #[test]
    fn test_holds_gate_later_reservations() {
        let mut category = category(dec!(500));
        category.hold(Amount::new(dec!(300)).unwrap()).unwrap();
        assert_eq!(category.available(), Balance(dec!(200)));
        assert_eq!(category.remaining_amount, Balance(dec!(500)));
        assert!(category.is_balanced());

        let result = category.hold(Amount::new(dec!(300)).unwrap());
        match result {
            Err(PaymentError::InsufficientFunds { remaining, .. }) => {
                assert_eq!(remaining, dec!(200))
            }
            other => panic!("expected InsufficientFunds, got {other:?}"),
        }

        category.release(Amount::new(dec!(300)).unwrap());
        assert_eq!(category.available(), Balance(dec!(500)));
    }

    #[test]
    fn test_debit_cannot_consume_another_hold() {
        let mut category = category(dec!(500));
        category.hold(Amount::new(dec!(300)).unwrap()).unwrap();
        let result = category.debit(Amount::new(dec!(300)).unwrap());
        assert!(matches!(result, Err(PaymentError::LedgerViolation(_))));
        assert_eq!(category.spent_amount, Balance::ZERO);
    }

    #[test]
    fn test_posting_id_is_derived_from_source() {
        let amount = Amount::new(dec!(1)).unwrap();
        let a = LedgerPosting::new("cat-1", amount, PostingSource::Settlement("tx-1".into()));
        let b = LedgerPosting::new("cat-1", amount, PostingSource::Settlement("tx-1".into()));
        assert_eq!(a.id, b.id);
        assert_eq!(a.id, "settlement:tx-1");
    }
}
