use super::budget::Amount;
use crate::error::{PaymentError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RedemptionStatus {
    Requested,
    Processing,
    Settled,
    Failed,
}

impl RedemptionStatus {
    /// A FAILED redemption may re-enter PROCESSING; the store re-checks
    /// transaction claims when it does.
    pub fn allowed_prior_states(target: Self) -> &'static [Self] {
        match target {
            Self::Requested => &[],
            Self::Processing => &[Self::Requested, Self::Failed],
            Self::Settled | Self::Failed => &[Self::Processing],
        }
    }

    /// Whether this redemption still holds its transactions.
    pub fn holds_claims(self) -> bool {
        self != Self::Failed
    }
}

/// Australian domestic bank account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BankDetails {
    pub account_name: String,
    pub bsb: String,
    pub account_number: String,
}

impl BankDetails {
    pub fn validate(&self) -> Result<()> {
        if self.account_name.trim().is_empty() {
            return Err(PaymentError::ValidationError(
                "account name is required".to_string(),
            ));
        }
        let bsb: String = self.bsb.chars().filter(|c| *c != '-').collect();
        if bsb.len() != 6 || !bsb.chars().all(|c| c.is_ascii_digit()) {
            return Err(PaymentError::ValidationError(format!(
                "BSB '{}' must be 6 digits",
                self.bsb
            )));
        }
        let number_len = self.account_number.len();
        if !(6..=10).contains(&number_len)
            || !self.account_number.chars().all(|c| c.is_ascii_digit())
        {
            return Err(PaymentError::ValidationError(
                "account number must be 6 to 10 digits".to_string(),
            ));
        }
        Ok(())
    }

    pub fn account_last4(&self) -> String {
        let digits: Vec<char> = self.account_number.chars().collect();
        let start = digits.len().saturating_sub(4);
        digits[start..].iter().collect()
    }
}

/// A provider's request to be paid out for completed transactions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Redemption {
    pub id: String,
    pub provider_id: String,
    pub transaction_ids: Vec<String>,
    pub bank_details: BankDetails,
    pub amount: Amount,
    pub status: RedemptionStatus,
    pub retry_eligible: bool,
    pub payout_reference: Option<String>,
    pub failure_reason: Option<String>,
    pub requested_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
}

/// Side data written together with a redemption status change.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RedemptionUpdate {
    pub payout_reference: Option<String>,
    pub failure_reason: Option<String>,
    pub retry_eligible: bool,
}

impl Redemption {
    pub fn request(
        provider_id: impl Into<String>,
        transaction_ids: Vec<String>,
        bank_details: BankDetails,
        amount: Amount,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: format!("rdm_{}", uuid::Uuid::new_v4().simple()),
            provider_id: provider_id.into(),
            transaction_ids,
            bank_details,
            amount,
            status: RedemptionStatus::Requested,
            retry_eligible: false,
            payout_reference: None,
            failure_reason: None,
            requested_at: now,
            updated_at: now,
            settled_at: None,
        }
    }

    pub fn apply_transition(&mut self, target: RedemptionStatus, update: RedemptionUpdate) -> bool {
        if !RedemptionStatus::allowed_prior_states(target).contains(&self.status) {
            return false;
        }
        if self.status == RedemptionStatus::Failed && !self.retry_eligible {
            return false;
        }
        let now = Utc::now();
        self.status = target;
        self.updated_at = now;
        if target == RedemptionStatus::Processing {
            // A retry starts a new payout; events for the old one must not match.
            self.payout_reference = update.payout_reference.clone();
        } else if let Some(reference) = update.payout_reference.clone() {
            self.payout_reference = Some(reference);
        }
        match target {
            RedemptionStatus::Settled => {
                self.settled_at = Some(now);
                self.failure_reason = None;
                self.retry_eligible = false;
            }
            RedemptionStatus::Failed => {
                self.failure_reason = update.failure_reason;
                self.retry_eligible = update.retry_eligible;
            }
            RedemptionStatus::Processing => {
                self.failure_reason = None;
                self.retry_eligible = false;
            }
            RedemptionStatus::Requested => {}
        }
        true
    }

    /// Records the rail's payout id. Only a PROCESSING redemption has an
    /// outstanding payout.
    pub fn attach_payout_reference(&mut self, reference: &str) -> bool {
        if self.status != RedemptionStatus::Processing {
            return false;
        }
        self.payout_reference = Some(reference.to_string());
        self.updated_at = Utc::now();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn details() -> BankDetails {
        BankDetails {
            account_name: "Allied Care Pty Ltd".into(),
            bsb: "062-000".into(),
            account_number: "12345678".into(),
        }
    }

    fn redemption() -> Redemption {
        Redemption::request(
            "prov-1",
            vec!["txn_1".into()],
            details(),
            Amount::new(dec!(150)).unwrap(),
        )
    }

    #[test]
    fn test_bank_details_validation() {
        assert!(details().validate().is_ok());

        let mut bad_bsb = details();
        bad_bsb.bsb = "12345".into();
        assert!(bad_bsb.validate().is_err());

        let mut bad_account = details();
        bad_account.account_number = "12ab5678".into();
        assert!(bad_account.validate().is_err());

        assert_eq!(details().account_last4(), "5678");
    }

    #[test]
    fn test_failed_retryable_redemption_can_reprocess() {
        let mut r = redemption();
        assert!(r.apply_transition(RedemptionStatus::Processing, RedemptionUpdate::default()));
        assert!(r.apply_transition(
            RedemptionStatus::Failed,
            RedemptionUpdate {
                failure_reason: Some("rail timeout".into()),
                retry_eligible: true,
                ..Default::default()
            }
        ));
        assert!(r.retry_eligible);
        assert!(r.apply_transition(RedemptionStatus::Processing, RedemptionUpdate::default()));
        assert_eq!(r.failure_reason, None);
    }

    #[test]
    fn test_failed_non_retryable_redemption_is_final() {
        let mut r = redemption();
        r.apply_transition(RedemptionStatus::Processing, RedemptionUpdate::default());
        r.apply_transition(
            RedemptionStatus::Failed,
            RedemptionUpdate {
                failure_reason: Some("account closed".into()),
                retry_eligible: false,
                ..Default::default()
            },
        );
        assert!(!r.apply_transition(RedemptionStatus::Processing, RedemptionUpdate::default()));
        assert_eq!(r.status, RedemptionStatus::Failed);
    }

    #[test]
    fn test_settled_is_terminal() {
        let mut r = redemption();
        r.apply_transition(RedemptionStatus::Processing, RedemptionUpdate::default());
        assert!(r.apply_transition(RedemptionStatus::Settled, RedemptionUpdate::default()));
        assert!(!r.apply_transition(RedemptionStatus::Failed, RedemptionUpdate::default()));
        assert!(!r.apply_transition(RedemptionStatus::Processing, RedemptionUpdate::default()));
        assert!(r.settled_at.is_some());
    }
}
