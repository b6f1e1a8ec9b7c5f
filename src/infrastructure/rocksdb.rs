use crate::domain::budget::{Amount, BudgetCategory, LedgerPosting, PostingSource, Reservation};
use crate::domain::ports::{
    LedgerStore, RedemptionStore, TransactionStore, Transition, VoucherStore,
};
use crate::domain::rail::RailKind;
use crate::domain::redemption::{Redemption, RedemptionStatus, RedemptionUpdate};
use crate::domain::transaction::{PaymentTransaction, TransactionStatus};
use crate::domain::voucher::{Voucher, VoucherStatus};
use crate::error::{PaymentError, Result};
use async_trait::async_trait;
use rocksdb::{
    ColumnFamily, ColumnFamilyDescriptor, IteratorMode, Options, TransactionDB,
    TransactionDBOptions,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;

/// Budget categories keyed by category id.
pub const CF_CATEGORIES: &str = "categories";
/// Committed postings keyed by `{category_id}/{posting_id}`.
pub const CF_POSTINGS: &str = "postings";
/// Open reservations keyed by posting id.
pub const CF_HOLDS: &str = "holds";
pub const CF_VOUCHERS: &str = "vouchers";
pub const CF_TRANSACTIONS: &str = "transactions";
/// `{RAIL}/{reference}` -> transaction id.
pub const CF_RAIL_REFERENCES: &str = "rail_references";
pub const CF_REDEMPTIONS: &str = "redemptions";
/// Transaction id -> id of the non-failed redemption holding it.
pub const CF_CLAIMS: &str = "claims";
/// Payout reference -> redemption id.
pub const CF_PAYOUT_REFERENCES: &str = "payout_references";

const COLUMN_FAMILIES: [&str; 9] = [
    CF_CATEGORIES,
    CF_POSTINGS,
    CF_HOLDS,
    CF_VOUCHERS,
    CF_TRANSACTIONS,
    CF_RAIL_REFERENCES,
    CF_REDEMPTIONS,
    CF_CLAIMS,
    CF_PAYOUT_REFERENCES,
];

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(bytes)?)
}

fn posting_key(category_id: &str, posting_id: &str) -> String {
    format!("{category_id}/{posting_id}")
}

fn rail_reference_key(rail: RailKind, reference: &str) -> String {
    format!("{rail}/{reference}")
}

/// A persistent store implementation using RocksDB.
///
/// Every conditional update runs inside one pessimistic transaction: rows are
/// read with `get_for_update_cf`, which locks them until commit, so the guard
/// and the write are atomic across concurrent callers. Dropping a transaction
/// without committing rolls it back.
///
/// This struct is thread-safe (`Clone` shares the underlying `Arc<TransactionDB>`).
#[derive(Clone)]
pub struct RocksDBStore {
    db: Arc<TransactionDB>,
}

impl RocksDBStore {
    /// Opens or creates a RocksDB instance at the specified path, creating any
    /// missing column families.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let descriptors = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()));
        let db = TransactionDB::open_cf_descriptors(
            &opts,
            &TransactionDBOptions::default(),
            path,
            descriptors,
        )?;

        Ok(Self { db: Arc::new(db) })
    }

    fn handle(&self, name: &str) -> Result<&ColumnFamily> {
        self.db.cf_handle(name).ok_or_else(|| {
            PaymentError::InternalError(Box::new(std::io::Error::other(format!(
                "column family '{name}' not found"
            ))))
        })
    }

    fn read<T: DeserializeOwned>(&self, cf: &str, key: &str) -> Result<Option<T>> {
        let handle = self.handle(cf)?;
        self.db
            .get_cf(handle, key)?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    fn scan<T: DeserializeOwned>(&self, cf: &str, prefix: &str) -> Result<Vec<T>> {
        let handle = self.handle(cf)?;
        let mut values = Vec::new();
        for item in self.db.iterator_cf(handle, IteratorMode::Start) {
            let (key, value) = item?;
            if key.starts_with(prefix.as_bytes()) {
                values.push(decode(&value)?);
            }
        }
        Ok(values)
    }

    fn insert_new<T: Serialize>(&self, cf: &str, key: &str, value: &T, entity: &str) -> Result<()> {
        let handle = self.handle(cf)?;
        let txn = self.db.transaction();
        if txn.get_for_update_cf(handle, key, true)?.is_some() {
            return Err(PaymentError::Conflict(format!(
                "{entity} '{key}' already exists"
            )));
        }
        txn.put_cf(handle, key, encode(value)?)?;
        txn.commit()?;
        Ok(())
    }

    fn locked_category(
        &self,
        txn: &rocksdb::Transaction<'_, TransactionDB>,
        category_id: &str,
    ) -> Result<BudgetCategory> {
        txn.get_for_update_cf(self.handle(CF_CATEGORIES)?, category_id, true)?
            .map(|bytes| decode(&bytes))
            .transpose()?
            .ok_or_else(|| PaymentError::not_found("category", category_id))
    }

    fn hold_funds(
        &self,
        category_id: &str,
        source: &PostingSource,
        amount: Amount,
    ) -> Result<Reservation> {
        let categories = self.handle(CF_CATEGORIES)?;
        let holds = self.handle(CF_HOLDS)?;
        let txn = self.db.transaction();
        let posting_id = source.posting_id();

        if let Some(existing) = txn.get_for_update_cf(holds, &posting_id, true)? {
            return decode(&existing);
        }
        let mut category = self.locked_category(&txn, category_id)?;
        let available = category.available();
        category.hold(amount)?;

        let reservation = Reservation {
            posting_id: posting_id.clone(),
            category_id: category_id.to_string(),
            amount,
            available_at_authorization: available,
        };
        txn.put_cf(categories, category_id, encode(&category)?)?;
        txn.put_cf(holds, &posting_id, encode(&reservation)?)?;
        txn.commit()?;
        Ok(reservation)
    }

    fn release_hold(&self, category_id: &str, source: &PostingSource) -> Result<bool> {
        let categories = self.handle(CF_CATEGORIES)?;
        let holds = self.handle(CF_HOLDS)?;
        let txn = self.db.transaction();
        let posting_id = source.posting_id();

        let Some(bytes) = txn.get_for_update_cf(holds, &posting_id, true)? else {
            return Ok(false);
        };
        let hold: Reservation = decode(&bytes)?;
        let mut category = self.locked_category(&txn, category_id)?;
        category.release(hold.amount);
        txn.put_cf(categories, category_id, encode(&category)?)?;
        txn.delete_cf(holds, &posting_id)?;
        txn.commit()?;
        Ok(true)
    }

    fn commit_posting(&self, posting: &LedgerPosting) -> Result<BudgetCategory> {
        let categories = self.handle(CF_CATEGORIES)?;
        let postings = self.handle(CF_POSTINGS)?;
        let holds = self.handle(CF_HOLDS)?;
        let txn = self.db.transaction();

        let mut category = self.locked_category(&txn, &posting.category_id)?;
        let key = posting_key(&posting.category_id, &posting.id);
        if txn.get_for_update_cf(postings, &key, true)?.is_some() {
            return Ok(category);
        }

        if let Some(bytes) = txn.get_for_update_cf(holds, &posting.id, true)? {
            let hold: Reservation = decode(&bytes)?;
            category.release(hold.amount);
            txn.delete_cf(holds, &posting.id)?;
        }
        category.debit(posting.amount)?;
        txn.put_cf(categories, &category.id, encode(&category)?)?;
        txn.put_cf(postings, &key, encode(posting)?)?;
        txn.commit()?;
        Ok(category)
    }

    fn update_voucher(
        &self,
        voucher_id: &str,
        change: impl FnOnce(&mut Voucher) -> bool,
    ) -> Result<Transition<Voucher>> {
        let vouchers = self.handle(CF_VOUCHERS)?;
        let txn = self.db.transaction();
        let mut voucher: Voucher = txn
            .get_for_update_cf(vouchers, voucher_id, true)?
            .map(|bytes| decode(&bytes))
            .transpose()?
            .ok_or_else(|| PaymentError::not_found("voucher", voucher_id))?;

        if !change(&mut voucher) {
            return Ok(Transition::Unchanged(voucher));
        }
        txn.put_cf(vouchers, voucher_id, encode(&voucher)?)?;
        txn.commit()?;
        Ok(Transition::Applied(voucher))
    }

    fn attach_reference(&self, tx_id: &str, reference: &str) -> Result<PaymentTransaction> {
        let transactions = self.handle(CF_TRANSACTIONS)?;
        let references = self.handle(CF_RAIL_REFERENCES)?;
        let txn = self.db.transaction();
        let mut tx: PaymentTransaction = txn
            .get_for_update_cf(transactions, tx_id, true)?
            .map(|bytes| decode(&bytes))
            .transpose()?
            .ok_or_else(|| PaymentError::not_found("transaction", tx_id))?;

        match tx.rail_reference.as_deref() {
            Some(existing) if existing == reference => return Ok(tx),
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
        txn.put_cf(transactions, tx_id, encode(&tx)?)?;
        txn.put_cf(
            references,
            rail_reference_key(tx.rail_kind, reference),
            tx_id.as_bytes(),
        )?;
        txn.commit()?;
        Ok(tx)
    }

    fn transition_transaction(
        &self,
        tx_id: &str,
        target: TransactionStatus,
        allowed_from: &[TransactionStatus],
        payload: Option<Value>,
    ) -> Result<Transition<PaymentTransaction>> {
        let transactions = self.handle(CF_TRANSACTIONS)?;
        let txn = self.db.transaction();
        let mut tx: PaymentTransaction = txn
            .get_for_update_cf(transactions, tx_id, true)?
            .map(|bytes| decode(&bytes))
            .transpose()?
            .ok_or_else(|| PaymentError::not_found("transaction", tx_id))?;

        if !allowed_from.contains(&tx.status) || !tx.apply_transition(target, payload) {
            return Ok(Transition::Unchanged(tx));
        }
        txn.put_cf(transactions, tx_id, encode(&tx)?)?;
        txn.commit()?;
        Ok(Transition::Applied(tx))
    }

    fn insert_redemption(&self, redemption: &Redemption) -> Result<()> {
        let redemptions = self.handle(CF_REDEMPTIONS)?;
        let claims = self.handle(CF_CLAIMS)?;
        let txn = self.db.transaction();

        if txn
            .get_for_update_cf(redemptions, &redemption.id, true)?
            .is_some()
        {
            return Err(PaymentError::Conflict(format!(
                "redemption '{}' already exists",
                redemption.id
            )));
        }
        for tx_id in &redemption.transaction_ids {
            if let Some(holder) = txn.get_for_update_cf(claims, tx_id, true)?
                && holder != redemption.id.as_bytes()
            {
                return Err(PaymentError::Conflict(format!(
                    "transaction '{tx_id}' is already part of another redemption"
                )));
            }
            txn.put_cf(claims, tx_id, redemption.id.as_bytes())?;
        }
        txn.put_cf(redemptions, &redemption.id, encode(redemption)?)?;
        txn.commit()?;
        Ok(())
    }

    fn transition_redemption(
        &self,
        redemption_id: &str,
        target: RedemptionStatus,
        allowed_from: &[RedemptionStatus],
        update: RedemptionUpdate,
    ) -> Result<Transition<Redemption>> {
        let redemptions = self.handle(CF_REDEMPTIONS)?;
        let claims = self.handle(CF_CLAIMS)?;
        let txn = self.db.transaction();

        let mut redemption: Redemption = txn
            .get_for_update_cf(redemptions, redemption_id, true)?
            .map(|bytes| decode(&bytes))
            .transpose()?
            .ok_or_else(|| PaymentError::not_found("redemption", redemption_id))?;

        let previous = redemption.status;
        let previous_reference = redemption.payout_reference.clone();
        if !allowed_from.contains(&previous) || !redemption.apply_transition(target, update) {
            return Ok(Transition::Unchanged(redemption));
        }
        if let Some(reference) = previous_reference
            && redemption.payout_reference.as_deref() != Some(reference.as_str())
        {
            txn.delete_cf(self.handle(CF_PAYOUT_REFERENCES)?, reference)?;
        }

        if !previous.holds_claims() && target.holds_claims() {
            for tx_id in &redemption.transaction_ids {
                if let Some(holder) = txn.get_for_update_cf(claims, tx_id, true)?
                    && holder != redemption.id.as_bytes()
                {
                    return Err(PaymentError::Conflict(format!(
                        "transaction '{tx_id}' was claimed by another redemption"
                    )));
                }
                txn.put_cf(claims, tx_id, redemption.id.as_bytes())?;
            }
        } else if previous.holds_claims() && !target.holds_claims() {
            for tx_id in &redemption.transaction_ids {
                if txn.get_for_update_cf(claims, tx_id, true)?.as_deref()
                    == Some(redemption.id.as_bytes())
                {
                    txn.delete_cf(claims, tx_id)?;
                }
            }
        }

        txn.put_cf(redemptions, redemption_id, encode(&redemption)?)?;
        txn.commit()?;
        Ok(Transition::Applied(redemption))
    }

    fn attach_payout(&self, redemption_id: &str, reference: &str) -> Result<Redemption> {
        let redemptions = self.handle(CF_REDEMPTIONS)?;
        let payout_references = self.handle(CF_PAYOUT_REFERENCES)?;
        let txn = self.db.transaction();
        let mut redemption: Redemption = txn
            .get_for_update_cf(redemptions, redemption_id, true)?
            .map(|bytes| decode(&bytes))
            .transpose()?
            .ok_or_else(|| PaymentError::not_found("redemption", redemption_id))?;

        let previous = redemption.payout_reference.clone();
        if !redemption.attach_payout_reference(reference) {
            return Err(PaymentError::Conflict(format!(
                "redemption '{redemption_id}' is {:?}, cannot attach a payout",
                redemption.status
            )));
        }
        if let Some(previous) = previous
            && previous != reference
        {
            txn.delete_cf(payout_references, previous)?;
        }
        txn.put_cf(payout_references, reference, redemption_id.as_bytes())?;
        txn.put_cf(redemptions, redemption_id, encode(&redemption)?)?;
        txn.commit()?;
        Ok(redemption)
    }

    fn lookup_index(&self, cf: &str, key: &str) -> Result<Option<String>> {
        let handle = self.handle(cf)?;
        Ok(self
            .db
            .get_cf(handle, key)?
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
    }
}

#[async_trait]
impl LedgerStore for RocksDBStore {
    async fn provision(&self, category: BudgetCategory) -> Result<()> {
        self.insert_new(CF_CATEGORIES, &category.id, &category, "category")
    }

    async fn category(&self, category_id: &str) -> Result<Option<BudgetCategory>> {
        self.read(CF_CATEGORIES, category_id)
    }

    async fn categories(&self) -> Result<Vec<BudgetCategory>> {
        self.scan(CF_CATEGORIES, "")
    }

    async fn reserve(
        &self,
        category_id: &str,
        source: &PostingSource,
        amount: Amount,
    ) -> Result<Reservation> {
        self.hold_funds(category_id, source, amount)
    }

    async fn release(&self, category_id: &str, source: &PostingSource) -> Result<bool> {
        self.release_hold(category_id, source)
    }

    async fn commit(&self, posting: LedgerPosting) -> Result<BudgetCategory> {
        self.commit_posting(&posting)
    }

    async fn postings(&self, category_id: &str) -> Result<Vec<LedgerPosting>> {
        let mut postings: Vec<LedgerPosting> =
            self.scan(CF_POSTINGS, &format!("{category_id}/"))?;
        postings.sort_by_key(|posting| posting.posted_at);
        Ok(postings)
    }
}

#[async_trait]
impl VoucherStore for RocksDBStore {
    async fn insert(&self, voucher: Voucher) -> Result<()> {
        self.insert_new(CF_VOUCHERS, &voucher.id, &voucher, "voucher")
    }

    async fn get(&self, voucher_id: &str) -> Result<Option<Voucher>> {
        self.read(CF_VOUCHERS, voucher_id)
    }

    async fn claim(&self, voucher_id: &str, tx_id: &str) -> Result<Transition<Voucher>> {
        self.update_voucher(voucher_id, |voucher| voucher.claim(tx_id))
    }

    async fn release_claim(&self, voucher_id: &str, tx_id: &str) -> Result<Transition<Voucher>> {
        self.update_voucher(voucher_id, |voucher| voucher.release_claim(tx_id))
    }

    async fn transition(
        &self,
        voucher_id: &str,
        target: VoucherStatus,
        holder: Option<&str>,
    ) -> Result<Transition<Voucher>> {
        self.update_voucher(voucher_id, |voucher| {
            voucher.apply_transition(target, holder)
        })
    }
}

#[async_trait]
impl TransactionStore for RocksDBStore {
    async fn insert(&self, tx: PaymentTransaction) -> Result<()> {
        self.insert_new(CF_TRANSACTIONS, &tx.id, &tx, "transaction")
    }

    async fn get(&self, tx_id: &str) -> Result<Option<PaymentTransaction>> {
        self.read(CF_TRANSACTIONS, tx_id)
    }

    async fn attach_rail_reference(
        &self,
        tx_id: &str,
        reference: &str,
    ) -> Result<PaymentTransaction> {
        self.attach_reference(tx_id, reference)
    }

    async fn find_by_rail_reference(
        &self,
        rail: RailKind,
        reference: &str,
    ) -> Result<Option<PaymentTransaction>> {
        match self.lookup_index(CF_RAIL_REFERENCES, &rail_reference_key(rail, reference))? {
            Some(tx_id) => self.read(CF_TRANSACTIONS, &tx_id),
            None => Ok(None),
        }
    }

    async fn transition(
        &self,
        tx_id: &str,
        target: TransactionStatus,
        allowed_from: &[TransactionStatus],
        payload: Option<Value>,
    ) -> Result<Transition<PaymentTransaction>> {
        self.transition_transaction(tx_id, target, allowed_from, payload)
    }
}

#[async_trait]
impl RedemptionStore for RocksDBStore {
    async fn insert_claiming(&self, redemption: Redemption) -> Result<()> {
        self.insert_redemption(&redemption)
    }

    async fn get(&self, redemption_id: &str) -> Result<Option<Redemption>> {
        self.read(CF_REDEMPTIONS, redemption_id)
    }

    async fn find_by_payout_reference(&self, reference: &str) -> Result<Option<Redemption>> {
        match self.lookup_index(CF_PAYOUT_REFERENCES, reference)? {
            Some(redemption_id) => self.read(CF_REDEMPTIONS, &redemption_id),
            None => Ok(None),
        }
    }

    async fn attach_payout_reference(
        &self,
        redemption_id: &str,
        reference: &str,
    ) -> Result<Redemption> {
        self.attach_payout(redemption_id, reference)
    }

    async fn transition(
        &self,
        redemption_id: &str,
        target: RedemptionStatus,
        allowed_from: &[RedemptionStatus],
        update: RedemptionUpdate,
    ) -> Result<Transition<Redemption>> {
        self.transition_redemption(redemption_id, target, allowed_from, update)
    }
}
