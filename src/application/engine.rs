use super::gateway::{InitiatedPayment, PaymentGateway, PaymentRequest};
use super::reconciler::{ReconcileOutcome, SettlementReconciler};
use super::redemption::{RedemptionRequest, RedemptionService};
use super::step_up::StepUpGate;
use super::vouchers::VoucherService;
use crate::config::EngineConfig;
use crate::domain::budget::{Amount, BudgetCategory};
use crate::domain::ports::{
    SharedCredentialStore, SharedLedgerStore, SharedProviderDirectory, SharedRedemptionStore,
    SharedTransactionStore, SharedVoucherStore,
};
use crate::domain::rail::{RailKind, RailRegistry, WebhookHeaders};
use crate::domain::redemption::Redemption;
use crate::domain::transaction::PaymentTransaction;
use crate::domain::voucher::{RuleCheck, Voucher};
use crate::error::{PaymentError, Result};
use tracing::info;

/// Storage backends and external collaborators, injected as trait objects.
#[derive(Clone)]
pub struct Stores {
    pub ledger: SharedLedgerStore,
    pub vouchers: SharedVoucherStore,
    pub transactions: SharedTransactionStore,
    pub redemptions: SharedRedemptionStore,
    pub providers: SharedProviderDirectory,
    pub credentials: SharedCredentialStore,
}

/// The settlement engine: one handle over every service, shared by all
/// request tasks.
///
/// Services hold no state of their own; every coordination point is a
/// conditional update inside a store, so cloning the engine is cheap and
/// concurrent calls need no further locking.
#[derive(Clone)]
pub struct SettlementEngine {
    ledger: SharedLedgerStore,
    transactions: SharedTransactionStore,
    gateway: PaymentGateway,
    vouchers: VoucherService,
    step_up: StepUpGate,
    reconciler: SettlementReconciler,
    redemptions: RedemptionService,
}

impl SettlementEngine {
    pub fn new(stores: Stores, rails: RailRegistry, config: &EngineConfig) -> Self {
        let vouchers = VoucherService::new(stores.ledger.clone(), stores.vouchers.clone());
        let step_up = StepUpGate::new(stores.credentials.clone(), config.step_up.clone());
        let gateway = PaymentGateway::new(
            stores.ledger.clone(),
            stores.transactions.clone(),
            stores.providers.clone(),
            vouchers.clone(),
            step_up.clone(),
            rails.clone(),
            config.amount_bounds.clone(),
        );
        let reconciler = SettlementReconciler::new(
            stores.ledger.clone(),
            stores.transactions.clone(),
            stores.redemptions.clone(),
            vouchers.clone(),
            rails.clone(),
        );
        let redemptions = RedemptionService::new(
            stores.transactions.clone(),
            stores.redemptions.clone(),
            rails,
        );

        Self {
            ledger: stores.ledger,
            transactions: stores.transactions,
            gateway,
            vouchers,
            step_up,
            reconciler,
            redemptions,
        }
    }

    pub fn gateway(&self) -> &PaymentGateway {
        &self.gateway
    }

    pub fn vouchers(&self) -> &VoucherService {
        &self.vouchers
    }

    pub fn step_up(&self) -> &StepUpGate {
        &self.step_up
    }

    pub fn reconciler(&self) -> &SettlementReconciler {
        &self.reconciler
    }

    pub fn redemptions(&self) -> &RedemptionService {
        &self.redemptions
    }

    /// Registers a category for a provisioned plan.
    pub async fn provision_category(&self, category: BudgetCategory) -> Result<()> {
        if !category.is_balanced() {
            return Err(PaymentError::ValidationError(format!(
                "category '{}' does not balance: allocated {} != spent {} + remaining {}",
                category.id,
                category.allocated_amount,
                category.spent_amount,
                category.remaining_amount
            )));
        }
        let category_id = category.id.clone();
        self.ledger.provision(category).await?;
        info!(category_id, "Category provisioned");
        Ok(())
    }

    pub async fn categories(&self) -> Result<Vec<BudgetCategory>> {
        self.ledger.categories().await
    }

    pub async fn category_for(&self, caller: &str, category_id: &str) -> Result<BudgetCategory> {
        let category = self
            .ledger
            .category(category_id)
            .await?
            .ok_or_else(|| PaymentError::not_found("category", category_id))?;
        if category.participant_id != caller {
            return Err(PaymentError::Forbidden(format!(
                "category '{category_id}' belongs to another participant"
            )));
        }
        Ok(category)
    }

    pub async fn initiate_payment(
        &self,
        caller: &str,
        request: PaymentRequest,
    ) -> Result<InitiatedPayment> {
        self.gateway.initiate(caller, request).await
    }

    /// Visible to the paying participant and the paid provider.
    pub async fn transaction_for(&self, caller: &str, tx_id: &str) -> Result<PaymentTransaction> {
        let tx = self
            .transactions
            .get(tx_id)
            .await?
            .ok_or_else(|| PaymentError::not_found("transaction", tx_id))?;
        if caller != tx.participant_id && caller != tx.provider_id {
            return Err(PaymentError::Forbidden(format!(
                "transaction '{tx_id}' is not visible to the caller"
            )));
        }
        Ok(tx)
    }

    pub async fn refresh_payment(&self, caller: &str, tx_id: &str) -> Result<PaymentTransaction> {
        self.transaction_for(caller, tx_id).await?;
        self.reconciler.poll_transaction(tx_id).await?;
        self.transaction_for(caller, tx_id).await
    }

    pub async fn mint_voucher(
        &self,
        caller: &str,
        category_id: &str,
        amount: Amount,
        provider_id: Option<String>,
    ) -> Result<Voucher> {
        self.category_for(caller, category_id).await?;
        self.vouchers.mint(category_id, amount, provider_id).await
    }

    pub async fn voucher(&self, voucher_id: &str) -> Result<Voucher> {
        self.vouchers.get(voucher_id).await
    }

    pub async fn validate_voucher(
        &self,
        voucher_id: &str,
        service_code: &str,
        provider_id: &str,
    ) -> Result<RuleCheck> {
        self.vouchers
            .validate_rules(voucher_id, service_code, provider_id)
            .await
    }

    pub async fn ingest_webhook(
        &self,
        rail: RailKind,
        raw_body: &[u8],
        headers: &WebhookHeaders,
    ) -> Result<ReconcileOutcome> {
        self.reconciler.ingest_webhook(rail, raw_body, headers).await
    }

    pub async fn request_redemption(
        &self,
        caller: &str,
        request: RedemptionRequest,
    ) -> Result<Redemption> {
        self.redemptions.request_redemption(caller, request).await
    }

    pub async fn settle_redemption(&self, caller: &str, redemption_id: &str) -> Result<Redemption> {
        self.redemptions
            .process_redemption(caller, redemption_id)
            .await
    }

    /// Polls the payout rail for a PROCESSING redemption.
    pub async fn refresh_redemption(&self, caller: &str, redemption_id: &str) -> Result<Redemption> {
        self.redemption_for(caller, redemption_id).await?;
        self.reconciler.poll_redemption(redemption_id).await?;
        self.redemption_for(caller, redemption_id).await
    }

    pub async fn redemption_for(&self, caller: &str, redemption_id: &str) -> Result<Redemption> {
        let redemption = self.redemptions.get(redemption_id).await?;
        if redemption.provider_id != caller {
            return Err(PaymentError::Forbidden(format!(
                "redemption '{redemption_id}' belongs to another provider"
            )));
        }
        Ok(redemption)
    }
}
