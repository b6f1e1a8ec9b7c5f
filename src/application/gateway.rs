use super::step_up::StepUpGate;
use super::vouchers::VoucherService;
use crate::config::AmountBounds;
use crate::domain::budget::{Amount, BudgetCategory, CURRENCY_SCALE, PostingSource};
use crate::domain::ports::{
    SharedLedgerStore, SharedProviderDirectory, SharedTransactionStore,
};
use crate::domain::rail::{RailArtifact, RailKind, RailRegistry};
use crate::domain::step_up::{StepUpDecision, StepUpEvidence};
use crate::domain::transaction::{NewTransaction, PaymentTransaction, TransactionStatus};
use crate::domain::voucher::VoucherStatus;
use crate::error::{PaymentError, Result};
use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

/// A participant's request to pay a provider from one budget category.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequest {
    pub participant_id: String,
    pub provider_id: String,
    pub category_id: String,
    pub service_code: String,
    /// Raw decimal; bounds are checked by the gateway, not by deserialization.
    pub amount: Decimal,
    pub rail_kind: RailKind,
    #[serde(default)]
    pub voucher_id: Option<String>,
    #[serde(default)]
    pub step_up_evidence: Option<StepUpEvidence>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiatedPayment {
    pub transaction: PaymentTransaction,
    pub rail_artifact: RailArtifact,
}

/// Entry point for new payments. Runs every precondition before anything is
/// persisted, then hands the PENDING transaction to its rail.
#[derive(Clone)]
pub struct PaymentGateway {
    ledger: SharedLedgerStore,
    transactions: SharedTransactionStore,
    providers: SharedProviderDirectory,
    vouchers: VoucherService,
    step_up: StepUpGate,
    rails: RailRegistry,
    bounds: AmountBounds,
}

impl PaymentGateway {
    pub fn new(
        ledger: SharedLedgerStore,
        transactions: SharedTransactionStore,
        providers: SharedProviderDirectory,
        vouchers: VoucherService,
        step_up: StepUpGate,
        rails: RailRegistry,
        bounds: AmountBounds,
    ) -> Self {
        Self {
            ledger,
            transactions,
            providers,
            vouchers,
            step_up,
            rails,
            bounds,
        }
    }

    pub async fn initiate(&self, caller: &str, request: PaymentRequest) -> Result<InitiatedPayment> {
        let category = self.authorize_caller(caller, &request).await?;
        self.ensure_provider_registered(&request.provider_id).await?;
        let amount = self.check_amount(request.amount)?;
        self.check_step_up(&request, amount).await?;
        let adapter = self.rails.get(request.rail_kind)?;

        let transaction = PaymentTransaction::open(NewTransaction {
            participant_id: request.participant_id.clone(),
            provider_id: request.provider_id.clone(),
            category_id: category.id.clone(),
            voucher_id: request.voucher_id.clone(),
            amount,
            service_code: request.service_code.clone(),
            rail_kind: request.rail_kind,
        });
        let source = PostingSource::Settlement(transaction.id.clone());
        self.ledger.reserve(&category.id, &source, amount).await?;
        if let Err(e) = self.persist(&transaction, &category, &request).await {
            self.release_or_log(&transaction).await;
            return Err(e);
        }
        info!(
            tx_id = %transaction.id,
            rail = %transaction.rail_kind,
            %amount,
            "Payment transaction opened"
        );

        let artifact = match adapter.prepare(&transaction).await {
            Ok(artifact) => artifact,
            Err(e) => return Err(self.fail_on_rail_error(&transaction, e).await),
        };
        let transaction = self
            .transactions
            .attach_rail_reference(&transaction.id, artifact.rail_reference())
            .await?;

        Ok(InitiatedPayment {
            transaction,
            rail_artifact: artifact,
        })
    }

    /// Claims the voucher, if any, and stores the PENDING transaction. Runs
    /// after the funds are held; the caller releases them on error.
    async fn persist(
        &self,
        transaction: &PaymentTransaction,
        category: &BudgetCategory,
        request: &PaymentRequest,
    ) -> Result<()> {
        if let Some(voucher_id) = &request.voucher_id {
            self.check_voucher(voucher_id, category, request, transaction.amount)
                .await?;
            self.vouchers.claim(voucher_id, &transaction.id).await?;
        }
        self.transactions.insert(transaction.clone()).await
    }

    async fn release_or_log(&self, transaction: &PaymentTransaction) {
        if let Err(e) = release_reservations(&self.ledger, &self.vouchers, transaction).await {
            error!(tx_id = %transaction.id, error = %e, "Failed to release reservations");
        }
    }

    async fn authorize_caller(
        &self,
        caller: &str,
        request: &PaymentRequest,
    ) -> Result<BudgetCategory> {
        if caller != request.participant_id {
            warn!(caller, participant_id = %request.participant_id, "Caller is not the participant");
            return Err(PaymentError::Forbidden(
                "caller may only pay on their own behalf".to_string(),
            ));
        }
        let category = self
            .ledger
            .category(&request.category_id)
            .await?
            .ok_or_else(|| PaymentError::not_found("category", request.category_id.clone()))?;
        if category.participant_id != request.participant_id {
            warn!(
                caller,
                category_id = %category.id,
                "Category belongs to another participant"
            );
            return Err(PaymentError::Forbidden(format!(
                "category '{}' does not belong to the caller",
                category.id
            )));
        }
        Ok(category)
    }

    async fn ensure_provider_registered(&self, provider_id: &str) -> Result<()> {
        let current = self
            .providers
            .registration(provider_id)
            .await?
            .is_some_and(|registration| registration.is_current(Utc::now()));
        if !current {
            warn!(provider_id, "Provider registration missing or lapsed");
            return Err(PaymentError::ProviderNotRegistered(provider_id.to_string()));
        }
        Ok(())
    }

    fn check_amount(&self, value: Decimal) -> Result<Amount> {
        let amount = Amount::new(value)?;
        if value > self.bounds.max {
            return Err(PaymentError::InvalidAmount(format!(
                "{value} exceeds the maximum of {}",
                self.bounds.max
            )));
        }
        if !amount.is_currency_scaled() {
            return Err(PaymentError::InvalidAmount(format!(
                "{value} has more than {CURRENCY_SCALE} decimal places"
            )));
        }
        Ok(amount)
    }

    async fn check_step_up(&self, request: &PaymentRequest, amount: Amount) -> Result<()> {
        let evidence = request.step_up_evidence.clone().unwrap_or_default();
        let evaluation = self
            .step_up
            .evaluate(&request.participant_id, amount.value(), &evidence)
            .await?;
        match evaluation.decision {
            StepUpDecision::Allowed { .. } => Ok(()),
            StepUpDecision::ChallengeRequired { methods } => {
                Err(PaymentError::StepUpRequired { methods })
            }
        }
    }

    async fn check_voucher(
        &self,
        voucher_id: &str,
        category: &BudgetCategory,
        request: &PaymentRequest,
        amount: Amount,
    ) -> Result<()> {
        let voucher = self.vouchers.get(voucher_id).await?;
        if voucher.status != VoucherStatus::Active {
            return Err(PaymentError::ValidationError(format!(
                "voucher '{voucher_id}' is {:?}",
                voucher.status
            )));
        }
        if voucher.category_id != category.id {
            return Err(PaymentError::ValidationError(format!(
                "voucher '{voucher_id}' belongs to another category"
            )));
        }
        if voucher.amount < amount {
            return Err(PaymentError::ValidationError(format!(
                "voucher '{voucher_id}' covers {} but {} was requested",
                voucher.amount, amount
            )));
        }
        let check = self.vouchers.rules().check(
            &voucher,
            category,
            &request.service_code,
            &request.provider_id,
        );
        if !check.allowed {
            return Err(PaymentError::ValidationError(
                check.reason.unwrap_or_default(),
            ));
        }
        Ok(())
    }

    async fn fail_on_rail_error(
        &self,
        transaction: &PaymentTransaction,
        cause: PaymentError,
    ) -> PaymentError {
        warn!(tx_id = %transaction.id, error = %cause, "Rail rejected prepare");
        if let Err(e) = self
            .transactions
            .transition(
                &transaction.id,
                TransactionStatus::Failed,
                &[TransactionStatus::Pending],
                None,
            )
            .await
        {
            error!(tx_id = %transaction.id, error = %e, "Failed to mark transaction FAILED");
        }
        self.release_or_log(transaction).await;
        match cause {
            PaymentError::RailUnavailable { .. } => cause,
            other => PaymentError::RailUnavailable {
                rail: transaction.rail_kind,
                message: other.to_string(),
            },
        }
    }
}

/// Returns the funds held for a transaction that will never settle, and frees
/// its voucher. Both steps are idempotent.
pub(super) async fn release_reservations(
    ledger: &SharedLedgerStore,
    vouchers: &VoucherService,
    transaction: &PaymentTransaction,
) -> Result<()> {
    let source = PostingSource::Settlement(transaction.id.clone());
    if ledger.release(&transaction.category_id, &source).await? {
        info!(tx_id = %transaction.id, category_id = %transaction.category_id, "Funds hold released");
    }
    if let Some(voucher_id) = &transaction.voucher_id {
        vouchers.release_claim(voucher_id, &transaction.id).await?;
    }
    Ok(())
}
