use crate::application::engine::Stores;
use crate::application::step_up::hash_backup_code;
use crate::domain::budget::{Amount, BudgetCategory, LedgerPosting, PostingSource, Reservation};
use crate::domain::ports::{
    LedgerStore, ProviderDirectory, RedemptionStore, SharedCredentialStore,
    SharedProviderDirectory, StepUpCredentialStore, TransactionStore, Transition, VoucherStore,
};
use crate::domain::provider::ProviderRegistration;
use crate::domain::rail::RailKind;
use crate::domain::redemption::{Redemption, RedemptionStatus, RedemptionUpdate};
use crate::domain::step_up::StepUpEnrollment;
use crate::domain::transaction::{PaymentTransaction, TransactionStatus};
use crate::domain::voucher::{Voucher, VoucherStatus};
use crate::error::{PaymentError, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Default)]
struct LedgerState {
    categories: HashMap<String, BudgetCategory>,
    postings: Vec<LedgerPosting>,
    posting_ids: HashSet<String>,
    /// posting id -> funds held for it
    holds: HashMap<String, Reservation>,
}

/// A thread-safe in-memory ledger of budget categories.
///
/// Each mutation runs under one write guard, so the available-funds check and
/// the hold or debit are a single step with respect to every other caller.
#[derive(Default, Clone)]
pub struct InMemoryLedgerStore {
    state: Arc<RwLock<LedgerState>>,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn provision(&self, category: BudgetCategory) -> Result<()> {
        let mut state = self.state.write().await;
        if state.categories.contains_key(&category.id) {
            return Err(PaymentError::Conflict(format!(
                "category '{}' already provisioned",
                category.id
            )));
        }
        state.categories.insert(category.id.clone(), category);
        Ok(())
    }

    async fn category(&self, category_id: &str) -> Result<Option<BudgetCategory>> {
        let state = self.state.read().await;
        Ok(state.categories.get(category_id).cloned())
    }

    async fn categories(&self) -> Result<Vec<BudgetCategory>> {
        let state = self.state.read().await;
        let mut categories: Vec<_> = state.categories.values().cloned().collect();
        categories.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(categories)
    }

    async fn reserve(
        &self,
        category_id: &str,
        source: &PostingSource,
        amount: Amount,
    ) -> Result<Reservation> {
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        let posting_id = source.posting_id();
        if let Some(existing) = state.holds.get(&posting_id) {
            return Ok(existing.clone());
        }
        let category = state
            .categories
            .get_mut(category_id)
            .ok_or_else(|| PaymentError::not_found("category", category_id))?;

        let available = category.available();
        category.hold(amount)?;
        let reservation = Reservation {
            posting_id: posting_id.clone(),
            category_id: category_id.to_string(),
            amount,
            available_at_authorization: available,
        };
        state.holds.insert(posting_id, reservation.clone());
        Ok(reservation)
    }

    async fn release(&self, category_id: &str, source: &PostingSource) -> Result<bool> {
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        let Some(hold) = state.holds.remove(&source.posting_id()) else {
            return Ok(false);
        };
        if let Some(category) = state.categories.get_mut(category_id) {
            category.release(hold.amount);
        }
        Ok(true)
    }

    async fn commit(&self, posting: LedgerPosting) -> Result<BudgetCategory> {
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        let current = state
            .categories
            .get(&posting.category_id)
            .ok_or_else(|| PaymentError::not_found("category", posting.category_id.clone()))?;

        if state.posting_ids.contains(&posting.id) {
            return Ok(current.clone());
        }

        let mut category = current.clone();
        if let Some(hold) = state.holds.get(&posting.id) {
            category.release(hold.amount);
        }
        category.debit(posting.amount)?;

        state.holds.remove(&posting.id);
        state
            .categories
            .insert(category.id.clone(), category.clone());
        state.posting_ids.insert(posting.id.clone());
        state.postings.push(posting);
        Ok(category)
    }

    async fn postings(&self, category_id: &str) -> Result<Vec<LedgerPosting>> {
        let state = self.state.read().await;
        Ok(state
            .postings
            .iter()
            .filter(|posting| posting.category_id == category_id)
            .cloned()
            .collect())
    }
}

#[derive(Default, Clone)]
pub struct InMemoryVoucherStore {
    vouchers: Arc<RwLock<HashMap<String, Voucher>>>,
}

impl InMemoryVoucherStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn update(
        &self,
        voucher_id: &str,
        change: impl FnOnce(&mut Voucher) -> bool + Send,
    ) -> Result<Transition<Voucher>> {
        let mut vouchers = self.vouchers.write().await;
        let voucher = vouchers
            .get_mut(voucher_id)
            .ok_or_else(|| PaymentError::not_found("voucher", voucher_id))?;
        if change(voucher) {
            Ok(Transition::Applied(voucher.clone()))
        } else {
            Ok(Transition::Unchanged(voucher.clone()))
        }
    }
}

#[async_trait]
impl VoucherStore for InMemoryVoucherStore {
    async fn insert(&self, voucher: Voucher) -> Result<()> {
        let mut vouchers = self.vouchers.write().await;
        if vouchers.contains_key(&voucher.id) {
            return Err(PaymentError::Conflict(format!(
                "voucher '{}' already exists",
                voucher.id
            )));
        }
        vouchers.insert(voucher.id.clone(), voucher);
        Ok(())
    }

    async fn get(&self, voucher_id: &str) -> Result<Option<Voucher>> {
        let vouchers = self.vouchers.read().await;
        Ok(vouchers.get(voucher_id).cloned())
    }

    async fn claim(&self, voucher_id: &str, tx_id: &str) -> Result<Transition<Voucher>> {
        self.update(voucher_id, |voucher| voucher.claim(tx_id)).await
    }

    async fn release_claim(&self, voucher_id: &str, tx_id: &str) -> Result<Transition<Voucher>> {
        self.update(voucher_id, |voucher| voucher.release_claim(tx_id))
            .await
    }

    async fn transition(
        &self,
        voucher_id: &str,
        target: VoucherStatus,
        holder: Option<&str>,
    ) -> Result<Transition<Voucher>> {
        self.update(voucher_id, |voucher| voucher.apply_transition(target, holder))
            .await
    }
}

#[derive(Default)]
struct TransactionState {
    transactions: HashMap<String, PaymentTransaction>,
    by_reference: HashMap<(RailKind, String), String>,
}

/// A thread-safe in-memory store for payment transactions.
#[derive(Default, Clone)]
pub struct InMemoryTransactionStore {
    state: Arc<RwLock<TransactionState>>,
}

impl InMemoryTransactionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TransactionStore for InMemoryTransactionStore {
    async fn insert(&self, tx: PaymentTransaction) -> Result<()> {
        let mut state = self.state.write().await;
        if state.transactions.contains_key(&tx.id) {
            return Err(PaymentError::Conflict(format!(
                "transaction '{}' already exists",
                tx.id
            )));
        }
        state.transactions.insert(tx.id.clone(), tx);
        Ok(())
    }

    async fn get(&self, tx_id: &str) -> Result<Option<PaymentTransaction>> {
        let state = self.state.read().await;
        Ok(state.transactions.get(tx_id).cloned())
    }

    async fn attach_rail_reference(
        &self,
        tx_id: &str,
        reference: &str,
    ) -> Result<PaymentTransaction> {
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        let tx = state
            .transactions
            .get_mut(tx_id)
            .ok_or_else(|| PaymentError::not_found("transaction", tx_id))?;

        match tx.rail_reference.as_deref() {
            Some(existing) if existing == reference => return Ok(tx.clone()),
            Some(existing) => {
                return Err(PaymentError::Conflict(format!(
                    "transaction '{tx_id}' already bound to rail reference '{existing}'"
                )));
            }
            None => {}
        }
        if tx.status != TransactionStatus::Pending {
            return Err(PaymentError::Conflict(format!(
                "transaction '{tx_id}' is {:?}, cannot attach a rail reference",
                tx.status
            )));
        }

        tx.rail_reference = Some(reference.to_string());
        state
            .by_reference
            .insert((tx.rail_kind, reference.to_string()), tx_id.to_string());
        Ok(tx.clone())
    }

    async fn find_by_rail_reference(
        &self,
        rail: RailKind,
        reference: &str,
    ) -> Result<Option<PaymentTransaction>> {
        let state = self.state.read().await;
        Ok(state
            .by_reference
            .get(&(rail, reference.to_string()))
            .and_then(|id| state.transactions.get(id))
            .cloned())
    }

    async fn transition(
        &self,
        tx_id: &str,
        target: TransactionStatus,
        allowed_from: &[TransactionStatus],
        payload: Option<Value>,
    ) -> Result<Transition<PaymentTransaction>> {
        let mut state = self.state.write().await;
        let tx = state
            .transactions
            .get_mut(tx_id)
            .ok_or_else(|| PaymentError::not_found("transaction", tx_id))?;
        if allowed_from.contains(&tx.status) && tx.apply_transition(target, payload) {
            Ok(Transition::Applied(tx.clone()))
        } else {
            Ok(Transition::Unchanged(tx.clone()))
        }
    }
}

#[derive(Default)]
struct RedemptionState {
    redemptions: HashMap<String, Redemption>,
    /// transaction id -> id of the non-failed redemption holding it
    claims: HashMap<String, String>,
    /// payout reference -> redemption id
    by_payout_reference: HashMap<String, String>,
}

impl RedemptionState {
    fn first_conflict(&self, redemption_id: &str, transaction_ids: &[String]) -> Option<String> {
        transaction_ids
            .iter()
            .find(|tx_id| {
                self.claims
                    .get(*tx_id)
                    .is_some_and(|holder| holder != redemption_id)
            })
            .cloned()
    }
}

#[derive(Default, Clone)]
pub struct InMemoryRedemptionStore {
    state: Arc<RwLock<RedemptionState>>,
}

impl InMemoryRedemptionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RedemptionStore for InMemoryRedemptionStore {
    async fn insert_claiming(&self, redemption: Redemption) -> Result<()> {
        let mut state = self.state.write().await;
        if let Some(tx_id) = state.first_conflict(&redemption.id, &redemption.transaction_ids) {
            return Err(PaymentError::Conflict(format!(
                "transaction '{tx_id}' is already part of another redemption"
            )));
        }
        for tx_id in &redemption.transaction_ids {
            state.claims.insert(tx_id.clone(), redemption.id.clone());
        }
        state.redemptions.insert(redemption.id.clone(), redemption);
        Ok(())
    }

    async fn get(&self, redemption_id: &str) -> Result<Option<Redemption>> {
        let state = self.state.read().await;
        Ok(state.redemptions.get(redemption_id).cloned())
    }

    async fn find_by_payout_reference(&self, reference: &str) -> Result<Option<Redemption>> {
        let state = self.state.read().await;
        Ok(state
            .by_payout_reference
            .get(reference)
            .and_then(|id| state.redemptions.get(id))
            .cloned())
    }

    async fn attach_payout_reference(
        &self,
        redemption_id: &str,
        reference: &str,
    ) -> Result<Redemption> {
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        let redemption = state
            .redemptions
            .get_mut(redemption_id)
            .ok_or_else(|| PaymentError::not_found("redemption", redemption_id))?;
        let previous = redemption.payout_reference.clone();
        if !redemption.attach_payout_reference(reference) {
            return Err(PaymentError::Conflict(format!(
                "redemption '{redemption_id}' is {:?}, cannot attach a payout",
                redemption.status
            )));
        }
        if let Some(previous) = previous {
            state.by_payout_reference.remove(&previous);
        }
        state
            .by_payout_reference
            .insert(reference.to_string(), redemption_id.to_string());
        Ok(redemption.clone())
    }

    async fn transition(
        &self,
        redemption_id: &str,
        target: RedemptionStatus,
        allowed_from: &[RedemptionStatus],
        update: RedemptionUpdate,
    ) -> Result<Transition<Redemption>> {
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        let current = state
            .redemptions
            .get(redemption_id)
            .ok_or_else(|| PaymentError::not_found("redemption", redemption_id))?;

        let reclaiming = !current.status.holds_claims() && target.holds_claims();
        if reclaiming
            && current.retry_eligible
            && allowed_from.contains(&current.status)
            && let Some(tx_id) = state.first_conflict(redemption_id, &current.transaction_ids)
        {
            return Err(PaymentError::Conflict(format!(
                "transaction '{tx_id}' was claimed by another redemption"
            )));
        }

        let Some(redemption) = state.redemptions.get_mut(redemption_id) else {
            return Err(PaymentError::not_found("redemption", redemption_id));
        };
        let previous_reference = redemption.payout_reference.clone();
        if !allowed_from.contains(&redemption.status) || !redemption.apply_transition(target, update)
        {
            return Ok(Transition::Unchanged(redemption.clone()));
        }

        let snapshot = redemption.clone();
        if let Some(previous) = previous_reference
            && snapshot.payout_reference.as_deref() != Some(previous.as_str())
        {
            state.by_payout_reference.remove(&previous);
        }
        if reclaiming {
            for tx_id in &snapshot.transaction_ids {
                state.claims.insert(tx_id.clone(), snapshot.id.clone());
            }
        } else if !target.holds_claims() {
            state.claims.retain(|_, holder| holder != &snapshot.id);
        }
        Ok(Transition::Applied(snapshot))
    }
}

/// Provider registry fixture for local runs and tests.
#[derive(Default, Clone)]
pub struct InMemoryProviderDirectory {
    registrations: Arc<RwLock<HashMap<String, ProviderRegistration>>>,
}

impl InMemoryProviderDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, registration: ProviderRegistration) {
        let mut registrations = self.registrations.write().await;
        registrations.insert(registration.provider_id.clone(), registration);
    }
}

#[async_trait]
impl ProviderDirectory for InMemoryProviderDirectory {
    async fn registration(&self, provider_id: &str) -> Result<Option<ProviderRegistration>> {
        let registrations = self.registrations.read().await;
        Ok(registrations.get(provider_id).cloned())
    }
}

#[derive(Default)]
struct CredentialState {
    enrollments: HashMap<String, StepUpEnrollment>,
    backup_codes: HashMap<String, HashSet<[u8; 32]>>,
}

/// Step-up enrollment fixture standing in for the identity system.
#[derive(Default, Clone)]
pub struct InMemoryCredentialStore {
    state: Arc<RwLock<CredentialState>>,
}

impl InMemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enrolls a user; backup codes are stored hashed.
    pub async fn enroll(
        &self,
        user_id: &str,
        totp_secret: Option<Vec<u8>>,
        biometric_key: Option<[u8; 32]>,
        backup_codes: &[&str],
    ) {
        let mut state = self.state.write().await;
        state.enrollments.insert(
            user_id.to_string(),
            StepUpEnrollment {
                user_id: user_id.to_string(),
                totp_secret,
                biometric_key,
                has_backup_codes: false,
            },
        );
        state.backup_codes.insert(
            user_id.to_string(),
            backup_codes.iter().map(|code| hash_backup_code(code)).collect(),
        );
    }
}

#[async_trait]
impl StepUpCredentialStore for InMemoryCredentialStore {
    async fn enrollment(&self, user_id: &str) -> Result<Option<StepUpEnrollment>> {
        let state = self.state.read().await;
        Ok(state.enrollments.get(user_id).map(|enrollment| {
            let mut enrollment = enrollment.clone();
            enrollment.has_backup_codes = state
                .backup_codes
                .get(user_id)
                .is_some_and(|codes| !codes.is_empty());
            enrollment
        }))
    }

    async fn consume_backup_code(&self, user_id: &str, code_hash: &[u8; 32]) -> Result<bool> {
        let mut state = self.state.write().await;
        Ok(state
            .backup_codes
            .get_mut(user_id)
            .is_some_and(|codes| codes.remove(code_hash)))
    }
}

/// Fresh in-memory stores wired to the given collaborators.
pub fn in_memory_stores(
    providers: SharedProviderDirectory,
    credentials: SharedCredentialStore,
) -> Stores {
    Stores {
        ledger: Arc::new(InMemoryLedgerStore::new()),
        vouchers: Arc::new(InMemoryVoucherStore::new()),
        transactions: Arc::new(InMemoryTransactionStore::new()),
        redemptions: Arc::new(InMemoryRedemptionStore::new()),
        providers,
        credentials,
    }
}
