use super::gateway::release_reservations;
use super::vouchers::VoucherService;
use crate::domain::budget::{LedgerPosting, PostingSource};
use crate::domain::ports::{
    SharedLedgerStore, SharedRedemptionStore, SharedTransactionStore, Transition,
};
use crate::domain::rail::{RailEvent, RailFailure, RailKind, RailRegistry, RailStatus, WebhookHeaders};
use crate::domain::redemption::{Redemption, RedemptionStatus, RedemptionUpdate};
use crate::domain::transaction::{PaymentTransaction, TransactionStatus};
use crate::error::{PaymentError, Result};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{error, info, warn};

/// What applying one rail confirmation did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(
    tag = "outcome",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum ReconcileOutcome {
    Transaction {
        transaction_id: String,
        status: TransactionStatus,
        applied: bool,
    },
    Redemption {
        redemption_id: String,
        status: RedemptionStatus,
        applied: bool,
    },
    Unmatched {
        rail: RailKind,
        rail_reference: String,
    },
}

impl ReconcileOutcome {
    pub fn applied(&self) -> bool {
        match self {
            Self::Transaction { applied, .. } | Self::Redemption { applied, .. } => *applied,
            Self::Unmatched { .. } => false,
        }
    }
}

/// Applies asynchronous rail confirmations to transactions and redemptions.
///
/// Webhooks and polls end in the same conditional transition, so duplicate,
/// late and reordered confirmations collapse to at most one state change per
/// target. The ledger commit only ever follows a COMPLETED status, and is
/// re-run by every later confirmation or poll of that transaction until it
/// sticks; the posting id makes the repeats no-ops.
#[derive(Clone)]
pub struct SettlementReconciler {
    ledger: SharedLedgerStore,
    transactions: SharedTransactionStore,
    redemptions: SharedRedemptionStore,
    vouchers: VoucherService,
    rails: RailRegistry,
}

impl SettlementReconciler {
    pub fn new(
        ledger: SharedLedgerStore,
        transactions: SharedTransactionStore,
        redemptions: SharedRedemptionStore,
        vouchers: VoucherService,
        rails: RailRegistry,
    ) -> Self {
        Self {
            ledger,
            transactions,
            redemptions,
            vouchers,
            rails,
        }
    }

    /// Verifies and applies a raw webhook delivery.
    pub async fn ingest_webhook(
        &self,
        rail: RailKind,
        raw_body: &[u8],
        headers: &WebhookHeaders,
    ) -> Result<ReconcileOutcome> {
        let adapter = self.rails.get(rail)?;
        let event = adapter.parse_event(raw_body, headers).inspect_err(|e| {
            warn!(%rail, error = %e, "Rejected webhook");
        })?;
        self.apply_event(event).await
    }

    pub async fn apply_event(&self, event: RailEvent) -> Result<ReconcileOutcome> {
        if let Some(tx) = self
            .transactions
            .find_by_rail_reference(event.rail, &event.rail_reference)
            .await?
        {
            return self
                .apply_to_transaction(tx, event.status, Some(event.payload))
                .await;
        }

        if event.rail == RailKind::BankTransfer
            && let Some(redemption) = self
                .redemptions
                .find_by_payout_reference(&event.rail_reference)
                .await?
            && redemption.payout_reference.as_deref() == Some(event.rail_reference.as_str())
        {
            return self
                .apply_to_redemption(redemption, event.status, event.failure)
                .await;
        }

        warn!(
            rail = %event.rail,
            rail_reference = %event.rail_reference,
            event_id = %event.event_id,
            "Event matches no transaction or payout"
        );
        Ok(ReconcileOutcome::Unmatched {
            rail: event.rail,
            rail_reference: event.rail_reference,
        })
    }

    /// Asks the rail for the current status of a non-terminal transaction.
    /// For a terminal one, re-runs its settlement or release instead.
    pub async fn poll_transaction(&self, tx_id: &str) -> Result<ReconcileOutcome> {
        let tx = self
            .transactions
            .get(tx_id)
            .await?
            .ok_or_else(|| PaymentError::not_found("transaction", tx_id))?;
        if tx.status.is_terminal() {
            self.finalize(&tx).await?;
            return Ok(ReconcileOutcome::Transaction {
                transaction_id: tx.id,
                status: tx.status,
                applied: false,
            });
        }
        let Some(reference) = tx.rail_reference.clone() else {
            return Err(PaymentError::Conflict(format!(
                "transaction '{tx_id}' has no rail reference yet"
            )));
        };

        let adapter = self.rails.get(tx.rail_kind)?;
        let status = adapter.query_status(&reference).await?;
        let payload = json!({ "source": "poll", "railStatus": status });
        self.apply_to_transaction(tx, status, Some(payload)).await
    }

    /// Asks the payout rail for the current status of a PROCESSING redemption.
    pub async fn poll_redemption(&self, redemption_id: &str) -> Result<ReconcileOutcome> {
        let redemption = self
            .redemptions
            .get(redemption_id)
            .await?
            .ok_or_else(|| PaymentError::not_found("redemption", redemption_id))?;
        let reference = match (&redemption.status, &redemption.payout_reference) {
            (RedemptionStatus::Processing, Some(reference)) => reference.clone(),
            _ => {
                return Ok(ReconcileOutcome::Redemption {
                    redemption_id: redemption.id,
                    status: redemption.status,
                    applied: false,
                });
            }
        };

        let status = self.rails.payout()?.query_status(&reference).await?;
        let failure = matches!(status, RailStatus::Failed | RailStatus::Cancelled).then(|| {
            RailFailure {
                code: format!("{status:?}").to_ascii_lowercase(),
                retryable: status == RailStatus::Cancelled,
            }
        });
        self.apply_to_redemption(redemption, status, failure).await
    }

    async fn apply_to_transaction(
        &self,
        tx: PaymentTransaction,
        status: RailStatus,
        payload: Option<Value>,
    ) -> Result<ReconcileOutcome> {
        let Some(target) = status.target_status() else {
            info!(tx_id = %tx.id, rail_status = ?status, "Rail status drives no transition");
            return Ok(ReconcileOutcome::Transaction {
                transaction_id: tx.id,
                status: tx.status,
                applied: false,
            });
        };

        let transition = self
            .transactions
            .transition(
                &tx.id,
                target,
                TransactionStatus::allowed_prior_states(target),
                payload,
            )
            .await?;

        match transition {
            Transition::Applied(tx) => {
                info!(tx_id = %tx.id, status = ?tx.status, "Transaction transitioned");
                self.finalize(&tx).await?;
                Ok(ReconcileOutcome::Transaction {
                    transaction_id: tx.id,
                    status: tx.status,
                    applied: true,
                })
            }
            Transition::Unchanged(tx) => {
                info!(
                    tx_id = %tx.id,
                    current = ?tx.status,
                    target = ?target,
                    "Stale or duplicate confirmation, no-op"
                );
                self.finalize(&tx).await?;
                Ok(ReconcileOutcome::Transaction {
                    transaction_id: tx.id,
                    status: tx.status,
                    applied: false,
                })
            }
        }
    }

    /// Brings the ledger and voucher in line with a terminal transaction.
    async fn finalize(&self, tx: &PaymentTransaction) -> Result<()> {
        match tx.status {
            TransactionStatus::Completed => self.settle(tx).await,
            TransactionStatus::Failed => release_reservations(&self.ledger, &self.vouchers, tx).await,
            TransactionStatus::Pending | TransactionStatus::Processing => Ok(()),
        }
    }

    /// Ledger commit and voucher spend for a COMPLETED transaction. Both steps
    /// are idempotent.
    async fn settle(&self, tx: &PaymentTransaction) -> Result<()> {
        let posting = LedgerPosting::new(
            &tx.category_id,
            tx.amount,
            PostingSource::Settlement(tx.id.clone()),
        );
        match self.ledger.commit(posting).await {
            Ok(category) => info!(
                tx_id = %tx.id,
                category_id = %category.id,
                spent = %category.spent_amount,
                remaining = %category.remaining_amount,
                "Settlement committed"
            ),
            Err(e @ PaymentError::LedgerViolation(_)) => {
                error!(tx_id = %tx.id, category_id = %tx.category_id, error = %e, "Ledger violation on settlement");
                return Err(e);
            }
            Err(e) => return Err(e),
        }

        if let Some(voucher_id) = &tx.voucher_id {
            self.vouchers.mark_spent(voucher_id, &tx.id).await?;
        }
        Ok(())
    }

    async fn apply_to_redemption(
        &self,
        redemption: Redemption,
        status: RailStatus,
        failure: Option<RailFailure>,
    ) -> Result<ReconcileOutcome> {
        let (target, update) = match status {
            RailStatus::Created | RailStatus::Pending => {
                return Ok(ReconcileOutcome::Redemption {
                    redemption_id: redemption.id,
                    status: redemption.status,
                    applied: false,
                });
            }
            RailStatus::Confirmed => (RedemptionStatus::Settled, RedemptionUpdate::default()),
            RailStatus::Failed | RailStatus::Cancelled => {
                let failure = failure.unwrap_or(RailFailure {
                    code: format!("{status:?}").to_ascii_lowercase(),
                    retryable: false,
                });
                (
                    RedemptionStatus::Failed,
                    RedemptionUpdate {
                        failure_reason: Some(failure.code),
                        retry_eligible: failure.retryable,
                        ..Default::default()
                    },
                )
            }
        };

        let transition = self
            .redemptions
            .transition(
                &redemption.id,
                target,
                RedemptionStatus::allowed_prior_states(target),
                update,
            )
            .await?;
        let applied = transition.is_applied();
        let redemption = transition.into_inner();
        if applied {
            info!(
                redemption_id = %redemption.id,
                status = ?redemption.status,
                retry_eligible = redemption.retry_eligible,
                "Redemption transitioned"
            );
        } else {
            info!(redemption_id = %redemption.id, current = ?redemption.status, "Stale payout confirmation, no-op");
        }
        Ok(ReconcileOutcome::Redemption {
            redemption_id: redemption.id,
            status: redemption.status,
            applied,
        })
    }
}
