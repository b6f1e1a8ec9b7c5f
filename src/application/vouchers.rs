use crate::domain::budget::{Amount, LedgerPosting, PostingSource};
use crate::domain::ports::{SharedLedgerStore, SharedVoucherStore, Transition};
use crate::domain::voucher::{EligibilityRules, RuleCheck, Voucher, VoucherStatus};
use crate::error::{PaymentError, Result};
use tracing::{error, info, warn};

/// Tokenizes budget into provider-redeemable vouchers.
#[derive(Clone)]
pub struct VoucherService {
    ledger: SharedLedgerStore,
    vouchers: SharedVoucherStore,
    rules: EligibilityRules,
}

impl VoucherService {
    pub fn new(ledger: SharedLedgerStore, vouchers: SharedVoucherStore) -> Self {
        Self {
            ledger,
            vouchers,
            rules: EligibilityRules::default(),
        }
    }

    pub fn rules(&self) -> &EligibilityRules {
        &self.rules
    }

    /// Mints an ACTIVE voucher and debits its amount from the category.
    ///
    /// The funds are held before the voucher is stored and debited after, so a
    /// failed insert leaves no debit behind.
    pub async fn mint(
        &self,
        category_id: &str,
        amount: Amount,
        provider_id: Option<String>,
    ) -> Result<Voucher> {
        if !amount.is_currency_scaled() {
            return Err(PaymentError::InvalidAmount(format!(
                "{amount} has more than two decimal places"
            )));
        }
        let voucher = Voucher::mint(category_id, amount, provider_id);
        let source = PostingSource::VoucherMint(voucher.id.clone());
        self.ledger.reserve(category_id, &source, amount).await?;

        if let Err(e) = self.vouchers.insert(voucher.clone()).await {
            self.ledger.release(category_id, &source).await?;
            return Err(e);
        }

        let posting = LedgerPosting::new(category_id, amount, source.clone());
        let category = match self.ledger.commit(posting).await {
            Ok(category) => category,
            Err(e) => {
                error!(voucher_id = %voucher.id, category_id, error = %e, "Mint posting failed, voiding voucher");
                if let Err(void_error) = self.expire(&voucher.id).await {
                    error!(voucher_id = %voucher.id, error = %void_error, "Failed to void unfunded voucher");
                }
                if let Err(release_error) = self.ledger.release(category_id, &source).await {
                    error!(voucher_id = %voucher.id, error = %release_error, "Failed to release mint hold");
                }
                return Err(e);
            }
        };

        info!(
            voucher_id = %voucher.id,
            category_id,
            %amount,
            remaining = %category.remaining_amount,
            "Voucher minted"
        );
        Ok(voucher)
    }

    pub async fn get(&self, voucher_id: &str) -> Result<Voucher> {
        self.vouchers
            .get(voucher_id)
            .await?
            .ok_or_else(|| PaymentError::not_found("voucher", voucher_id))
    }

    /// Binds the voucher to the transaction it will pay for. A voucher backs
    /// at most one open transaction at a time.
    pub async fn claim(&self, voucher_id: &str, tx_id: &str) -> Result<Voucher> {
        match self.vouchers.claim(voucher_id, tx_id).await? {
            Transition::Applied(voucher) => Ok(voucher),
            Transition::Unchanged(voucher) if voucher.claimed_by.as_deref() == Some(tx_id) => {
                Ok(voucher)
            }
            Transition::Unchanged(voucher) if voucher.status != VoucherStatus::Active => {
                Err(PaymentError::ValidationError(format!(
                    "voucher '{voucher_id}' is {:?}",
                    voucher.status
                )))
            }
            Transition::Unchanged(_) => {
                warn!(voucher_id, tx_id, "Voucher already backs another transaction");
                Err(PaymentError::Conflict(format!(
                    "voucher '{voucher_id}' already backs another transaction"
                )))
            }
        }
    }

    /// Frees the voucher after its transaction failed.
    pub async fn release_claim(&self, voucher_id: &str, tx_id: &str) -> Result<()> {
        if self
            .vouchers
            .release_claim(voucher_id, tx_id)
            .await?
            .is_applied()
        {
            info!(voucher_id, tx_id, "Voucher claim released");
        }
        Ok(())
    }

    /// ACTIVE -> SPENT by the transaction holding the claim. Already SPENT by
    /// that transaction is a no-op; anything else is a conflict.
    pub async fn mark_spent(&self, voucher_id: &str, tx_id: &str) -> Result<Voucher> {
        match self
            .vouchers
            .transition(voucher_id, VoucherStatus::Spent, Some(tx_id))
            .await?
        {
            Transition::Applied(voucher) => {
                info!(voucher_id, tx_id, "Voucher spent");
                Ok(voucher)
            }
            Transition::Unchanged(voucher)
                if voucher.status == VoucherStatus::Spent
                    && voucher.claimed_by.as_deref() == Some(tx_id) =>
            {
                info!(voucher_id, "Voucher already spent, ignoring");
                Ok(voucher)
            }
            Transition::Unchanged(voucher) => Err(PaymentError::Conflict(format!(
                "voucher '{voucher_id}' is {:?} and cannot be spent by '{tx_id}'",
                voucher.status
            ))),
        }
    }

    /// ACTIVE -> EXPIRED, for the expiry sweep. Minted funds stay debited.
    pub async fn expire(&self, voucher_id: &str) -> Result<Voucher> {
        match self
            .vouchers
            .transition(voucher_id, VoucherStatus::Expired, None)
            .await?
        {
            Transition::Applied(voucher) => {
                info!(voucher_id, "Voucher expired");
                Ok(voucher)
            }
            Transition::Unchanged(voucher) if voucher.status == VoucherStatus::Expired => {
                Ok(voucher)
            }
            Transition::Unchanged(voucher) => Err(PaymentError::Conflict(format!(
                "voucher '{voucher_id}' is {:?} and cannot expire",
                voucher.status
            ))),
        }
    }

    pub async fn validate_rules(
        &self,
        voucher_id: &str,
        service_code: &str,
        provider_id: &str,
    ) -> Result<RuleCheck> {
        let voucher = self.get(voucher_id).await?;
        let category = self
            .ledger
            .category(&voucher.category_id)
            .await?
            .ok_or_else(|| PaymentError::not_found("category", voucher.category_id.clone()))?;

        let check = self
            .rules
            .check(&voucher, &category, service_code, provider_id);
        if !check.allowed {
            warn!(voucher_id, service_code, provider_id, reason = ?check.reason, "Voucher rule check denied");
        }
        Ok(check)
    }
}
