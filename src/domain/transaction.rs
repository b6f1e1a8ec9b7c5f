use super::budget::Amount;
use super::rail::RailKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl TransactionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// States a transaction may be in for a move into `target` to apply.
    ///
    /// Terminal states never appear on the right-hand side, so COMPLETED and
    /// FAILED are never overwritten.
    pub fn allowed_prior_states(target: Self) -> &'static [Self] {
        match target {
            Self::Pending => &[],
            Self::Processing => &[Self::Pending],
            Self::Completed | Self::Failed => &[Self::Pending, Self::Processing],
        }
    }
}

/// A purchase settled through one payment rail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentTransaction {
    pub id: String,
    pub participant_id: String,
    pub provider_id: String,
    pub category_id: String,
    pub voucher_id: Option<String>,
    pub amount: Amount,
    pub service_code: String,
    pub rail_kind: RailKind,
    pub status: TransactionStatus,
    /// Rail-assigned id: charge code, payment intent id, tx hash or payout id.
    pub rail_reference: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Audit copy of the last confirmation that changed this row.
    pub last_event_payload: Option<Value>,
}

/// Everything needed to open a new transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTransaction {
    pub participant_id: String,
    pub provider_id: String,
    pub category_id: String,
    pub voucher_id: Option<String>,
    pub amount: Amount,
    pub service_code: String,
    pub rail_kind: RailKind,
}

impl PaymentTransaction {
    pub fn open(request: NewTransaction) -> Self {
        let now = Utc::now();
        Self {
            id: format!("txn_{}", uuid::Uuid::new_v4().simple()),
            participant_id: request.participant_id,
            provider_id: request.provider_id,
            category_id: request.category_id,
            voucher_id: request.voucher_id,
            amount: request.amount,
            service_code: request.service_code,
            rail_kind: request.rail_kind,
            status: TransactionStatus::Pending,
            rail_reference: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
            last_event_payload: None,
        }
    }

    /// Moves the record into `target` if its current status allows it.
    ///
    /// Returns `false` and leaves the record untouched otherwise. Stores call
    /// this inside their critical section so the check and the write are one
    /// step.
    pub fn apply_transition(&mut self, target: TransactionStatus, payload: Option<Value>) -> bool {
        if !TransactionStatus::allowed_prior_states(target).contains(&self.status) {
            return false;
        }
        let now = Utc::now();
        self.status = target;
        self.updated_at = now;
        if target == TransactionStatus::Completed {
            self.completed_at = Some(now);
        }
        if payload.is_some() {
            self.last_event_payload = payload;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn pending() -> PaymentTransaction {
        PaymentTransaction::open(NewTransaction {
            participant_id: "p-1".into(),
            provider_id: "prov-1".into(),
            category_id: "cat-1".into(),
            voucher_id: None,
            amount: Amount::new(dec!(10)).unwrap(),
            service_code: "transport".into(),
            rail_kind: RailKind::Card,
        })
    }

    #[test]
    fn test_pending_to_processing_to_completed() {
        let mut tx = pending();
        assert!(tx.apply_transition(TransactionStatus::Processing, None));
        assert!(tx.apply_transition(
            TransactionStatus::Completed,
            Some(serde_json::json!({"event": "confirmed"}))
        ));
        assert_eq!(tx.status, TransactionStatus::Completed);
        assert!(tx.completed_at.is_some());
        assert!(tx.last_event_payload.is_some());
    }

    #[test]
    fn test_pending_can_fail_directly() {
        let mut tx = pending();
        assert!(tx.apply_transition(TransactionStatus::Failed, None));
        assert_eq!(tx.status, TransactionStatus::Failed);
        assert!(tx.completed_at.is_none());
    }

    #[test]
    fn test_terminal_states_are_never_overwritten() {
        let mut tx = pending();
        assert!(tx.apply_transition(TransactionStatus::Completed, None));
        let snapshot = tx.clone();

        assert!(!tx.apply_transition(TransactionStatus::Failed, None));
        assert!(!tx.apply_transition(TransactionStatus::Processing, None));
        assert!(!tx.apply_transition(TransactionStatus::Completed, None));
        assert_eq!(tx, snapshot);
    }

    #[test]
    fn test_stale_processing_after_completed_is_rejected() {
        let mut tx = pending();
        tx.apply_transition(TransactionStatus::Completed, None);
        assert!(!tx.apply_transition(TransactionStatus::Processing, None));
        assert_eq!(tx.status, TransactionStatus::Completed);
    }

    #[test]
    fn test_status_wire_format() {
        let json = serde_json::to_string(&TransactionStatus::Processing).unwrap();
        assert_eq!(json, "\"PROCESSING\"");
    }
}
