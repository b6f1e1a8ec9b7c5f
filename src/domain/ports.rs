//! Storage and collaborator ports.
//!
//! Every state-changing method is a single conditional update: the check and
//! the write happen in one step inside the backend, never as a read followed
//! by a separate write in the caller. This is the only synchronization the
//! engine relies on across concurrent requests.

use super::budget::{Amount, BudgetCategory, LedgerPosting, PostingSource, Reservation};
use super::provider::ProviderRegistration;
use super::rail::RailKind;
use super::redemption::{Redemption, RedemptionStatus, RedemptionUpdate};
use super::step_up::StepUpEnrollment;
use super::transaction::{PaymentTransaction, TransactionStatus};
use super::voucher::{Voucher, VoucherStatus};
use crate::error::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// Result of a conditional status update.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition<T> {
    /// The record was in an allowed prior state and now holds the target.
    Applied(T),
    /// Nothing matched; carries the record as it currently stands.
    Unchanged(T),
}

impl<T> Transition<T> {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }

    pub fn into_inner(self) -> T {
        match self {
            Self::Applied(record) | Self::Unchanged(record) => record,
        }
    }
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Registers a category for a newly provisioned plan. Fails with
    /// `Conflict` if the id is taken.
    async fn provision(&self, category: BudgetCategory) -> Result<()>;
    async fn category(&self, category_id: &str) -> Result<Option<BudgetCategory>>;
    async fn categories(&self) -> Result<Vec<BudgetCategory>>;

    /// Holds `amount` for the posting `source` will produce, guarded by
    /// `remaining - held >= amount`. Fails with `InsufficientFunds`. Holding
    /// the same source again returns the existing reservation.
    async fn reserve(
        &self,
        category_id: &str,
        source: &PostingSource,
        amount: Amount,
    ) -> Result<Reservation>;

    /// Drops the hold for `source`, if any. Returns whether one was dropped.
    async fn release(&self, category_id: &str, source: &PostingSource) -> Result<bool>;

    /// Converts the posting's hold (if any) into a debit guarded by
    /// `remaining - held >= amount`, and appends the posting. A posting whose
    /// id was already committed is a no-op returning the current category.
    async fn commit(&self, posting: LedgerPosting) -> Result<BudgetCategory>;

    async fn postings(&self, category_id: &str) -> Result<Vec<LedgerPosting>>;
}

#[async_trait]
pub trait VoucherStore: Send + Sync {
    async fn insert(&self, voucher: Voucher) -> Result<()>;
    async fn get(&self, voucher_id: &str) -> Result<Option<Voucher>>;

    /// Binds an ACTIVE, unclaimed voucher to the transaction it backs.
    async fn claim(&self, voucher_id: &str, tx_id: &str) -> Result<Transition<Voucher>>;
    async fn release_claim(&self, voucher_id: &str, tx_id: &str) -> Result<Transition<Voucher>>;

    /// `holder` is the transaction spending the voucher; see
    /// `Voucher::apply_transition`.
    async fn transition(
        &self,
        voucher_id: &str,
        target: VoucherStatus,
        holder: Option<&str>,
    ) -> Result<Transition<Voucher>>;
}

#[async_trait]
pub trait TransactionStore: Send + Sync {
    async fn insert(&self, tx: PaymentTransaction) -> Result<()>;
    async fn get(&self, tx_id: &str) -> Result<Option<PaymentTransaction>>;

    /// Records the rail reference returned by `prepare`. Only PENDING rows
    /// accept a reference, and only once.
    async fn attach_rail_reference(&self, tx_id: &str, reference: &str)
    -> Result<PaymentTransaction>;

    async fn find_by_rail_reference(
        &self,
        rail: RailKind,
        reference: &str,
    ) -> Result<Option<PaymentTransaction>>;

    /// Sets `status = target` where `status ∈ allowed_from`.
    async fn transition(
        &self,
        tx_id: &str,
        target: TransactionStatus,
        allowed_from: &[TransactionStatus],
        payload: Option<Value>,
    ) -> Result<Transition<PaymentTransaction>>;
}

#[async_trait]
pub trait RedemptionStore: Send + Sync {
    /// Inserts the redemption if none of its transactions is held by another
    /// non-failed redemption; fails with `Conflict` otherwise.
    async fn insert_claiming(&self, redemption: Redemption) -> Result<()>;
    async fn get(&self, redemption_id: &str) -> Result<Option<Redemption>>;
    async fn find_by_payout_reference(&self, reference: &str) -> Result<Option<Redemption>>;

    /// Binds the payout id returned by the rail. Fails with `Conflict` unless
    /// the redemption is PROCESSING.
    async fn attach_payout_reference(&self, redemption_id: &str, reference: &str)
    -> Result<Redemption>;

    /// Sets `status = target` where `status ∈ allowed_from`. Leaving FAILED
    /// re-claims the transactions and fails with `Conflict` if another
    /// redemption took them meanwhile.
    async fn transition(
        &self,
        redemption_id: &str,
        target: RedemptionStatus,
        allowed_from: &[RedemptionStatus],
        update: RedemptionUpdate,
    ) -> Result<Transition<Redemption>>;
}

/// Read access to the provider registry (external collaborator).
#[async_trait]
pub trait ProviderDirectory: Send + Sync {
    async fn registration(&self, provider_id: &str) -> Result<Option<ProviderRegistration>>;
}

/// Second-factor material owned by the identity system (external collaborator).
#[async_trait]
pub trait StepUpCredentialStore: Send + Sync {
    async fn enrollment(&self, user_id: &str) -> Result<Option<StepUpEnrollment>>;

    /// Removes the backup code with this SHA-256 hash. Returns whether it was
    /// present; a code can be consumed exactly once.
    async fn consume_backup_code(&self, user_id: &str, code_hash: &[u8; 32]) -> Result<bool>;
}

pub type SharedLedgerStore = Arc<dyn LedgerStore>;
pub type SharedVoucherStore = Arc<dyn VoucherStore>;
pub type SharedTransactionStore = Arc<dyn TransactionStore>;
pub type SharedRedemptionStore = Arc<dyn RedemptionStore>;
pub type SharedProviderDirectory = Arc<dyn ProviderDirectory>;
pub type SharedCredentialStore = Arc<dyn StepUpCredentialStore>;
