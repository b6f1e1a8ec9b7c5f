use crate::domain::budget::Amount;
use crate::domain::ports::{SharedRedemptionStore, SharedTransactionStore, Transition};
use crate::domain::rail::{PayoutInstruction, RailRegistry};
use crate::domain::redemption::{BankDetails, Redemption, RedemptionStatus, RedemptionUpdate};
use crate::domain::transaction::{PaymentTransaction, TransactionStatus};
use crate::error::{PaymentError, Result};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashSet;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedemptionRequest {
    pub provider_id: String,
    pub transaction_ids: Vec<String>,
    pub bank_details: BankDetails,
}

/// Turns a provider's completed transactions into one bank payout.
#[derive(Clone)]
pub struct RedemptionService {
    transactions: SharedTransactionStore,
    redemptions: SharedRedemptionStore,
    rails: RailRegistry,
}

impl RedemptionService {
    pub fn new(
        transactions: SharedTransactionStore,
        redemptions: SharedRedemptionStore,
        rails: RailRegistry,
    ) -> Self {
        Self {
            transactions,
            redemptions,
            rails,
        }
    }

    pub async fn get(&self, redemption_id: &str) -> Result<Redemption> {
        self.redemptions
            .get(redemption_id)
            .await?
            .ok_or_else(|| PaymentError::not_found("redemption", redemption_id))
    }

    /// Creates a REQUESTED redemption, claiming every referenced transaction.
    pub async fn request_redemption(
        &self,
        caller: &str,
        request: RedemptionRequest,
    ) -> Result<Redemption> {
        if caller != request.provider_id {
            return Err(PaymentError::Forbidden(
                "providers may only redeem their own transactions".to_string(),
            ));
        }
        if request.transaction_ids.is_empty() {
            return Err(PaymentError::ValidationError(
                "at least one transaction is required".to_string(),
            ));
        }
        let unique: HashSet<&String> = request.transaction_ids.iter().collect();
        if unique.len() != request.transaction_ids.len() {
            return Err(PaymentError::ValidationError(
                "transaction ids must be unique".to_string(),
            ));
        }
        request.bank_details.validate()?;

        let transactions = self
            .load_redeemable(&request.provider_id, &request.transaction_ids)
            .await?;
        let total: Decimal = transactions.iter().map(|tx| tx.amount.value()).sum();
        let redemption = Redemption::request(
            request.provider_id,
            request.transaction_ids,
            request.bank_details,
            Amount::new(total)?,
        );
        self.redemptions.insert_claiming(redemption.clone()).await?;

        info!(
            redemption_id = %redemption.id,
            provider_id = %redemption.provider_id,
            amount = %redemption.amount,
            transactions = redemption.transaction_ids.len(),
            "Redemption requested"
        );
        Ok(redemption)
    }

    /// Moves a REQUESTED (or retry-eligible FAILED) redemption to PROCESSING
    /// and pushes the payout. Settlement arrives later through the reconciler.
    pub async fn process_redemption(&self, caller: &str, redemption_id: &str) -> Result<Redemption> {
        let redemption = self.get(redemption_id).await?;
        if caller != redemption.provider_id {
            return Err(PaymentError::Forbidden(
                "providers may only settle their own redemptions".to_string(),
            ));
        }
        self.load_redeemable(&redemption.provider_id, &redemption.transaction_ids)
            .await?;

        let redemption = match self
            .redemptions
            .transition(
                redemption_id,
                RedemptionStatus::Processing,
                RedemptionStatus::allowed_prior_states(RedemptionStatus::Processing),
                RedemptionUpdate::default(),
            )
            .await?
        {
            Transition::Applied(redemption) => redemption,
            Transition::Unchanged(redemption) => {
                return Err(PaymentError::Conflict(format!(
                    "redemption '{redemption_id}' is {:?}{}",
                    redemption.status,
                    if redemption.status == RedemptionStatus::Failed {
                        " and not eligible for retry"
                    } else {
                        ""
                    }
                )));
            }
        };

        let payout = self.rails.payout()?;
        let instruction = PayoutInstruction {
            redemption_id: redemption.id.clone(),
            provider_id: redemption.provider_id.clone(),
            amount: redemption.amount,
            bank_details: redemption.bank_details.clone(),
        };
        let artifact = match payout.push_payout(&instruction).await {
            Ok(artifact) => artifact,
            Err(e) => {
                warn!(redemption_id, error = %e, "Payout push failed");
                self.redemptions
                    .transition(
                        redemption_id,
                        RedemptionStatus::Failed,
                        RedemptionStatus::allowed_prior_states(RedemptionStatus::Failed),
                        RedemptionUpdate {
                            failure_reason: Some(e.to_string()),
                            retry_eligible: true,
                            ..Default::default()
                        },
                    )
                    .await?;
                return Err(e);
            }
        };

        let redemption = self
            .redemptions
            .attach_payout_reference(redemption_id, artifact.rail_reference())
            .await?;
        info!(
            redemption_id,
            payout_reference = artifact.rail_reference(),
            amount = %redemption.amount,
            "Payout pushed"
        );
        Ok(redemption)
    }

    /// Loads the transactions and checks each is COMPLETED and paid to
    /// `provider_id`.
    async fn load_redeemable(
        &self,
        provider_id: &str,
        transaction_ids: &[String],
    ) -> Result<Vec<PaymentTransaction>> {
        let mut transactions = Vec::with_capacity(transaction_ids.len());
        for tx_id in transaction_ids {
            let tx = self
                .transactions
                .get(tx_id)
                .await?
                .ok_or_else(|| PaymentError::not_found("transaction", tx_id.clone()))?;
            if tx.provider_id != provider_id {
                return Err(PaymentError::Forbidden(format!(
                    "transaction '{tx_id}' was not paid to provider '{provider_id}'"
                )));
            }
            if tx.status != TransactionStatus::Completed {
                return Err(PaymentError::ValidationError(format!(
                    "transaction '{tx_id}' is {:?}, only COMPLETED transactions can be redeemed",
                    tx.status
                )));
            }
            transactions.push(tx);
        }
        Ok(transactions)
    }
}
