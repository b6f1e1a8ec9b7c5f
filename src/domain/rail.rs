//! The contract every payment rail implements.
//!
//! Adapters own the rail-specific wire format: the artifact handed to the
//! client, the signature scheme on inbound webhooks, and the native status
//! vocabulary. Everything past `parse_event` only sees [`RailEvent`] and the
//! shared [`RailStatus`].

use super::budget::Amount;
use super::redemption::BankDetails;
use super::transaction::{PaymentTransaction, TransactionStatus};
use crate::error::{PaymentError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy, Hash, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RailKind {
    OnChain,
    CryptoCharge,
    Card,
    BankTransfer,
}

impl RailKind {
    pub const ALL: [RailKind; 4] = [
        RailKind::OnChain,
        RailKind::CryptoCharge,
        RailKind::Card,
        RailKind::BankTransfer,
    ];

    /// Path segment used by `/webhooks/{rail}`.
    pub fn slug(self) -> &'static str {
        match self {
            Self::OnChain => "on-chain",
            Self::CryptoCharge => "crypto-charge",
            Self::Card => "card",
            Self::BankTransfer => "bank-transfer",
        }
    }
}

impl fmt::Display for RailKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::OnChain => "ON_CHAIN",
            Self::CryptoCharge => "CRYPTO_CHARGE",
            Self::Card => "CARD",
            Self::BankTransfer => "BANK_TRANSFER",
        };
        f.write_str(name)
    }
}

impl FromStr for RailKind {
    type Err = PaymentError;

    fn from_str(value: &str) -> Result<Self> {
        let normalized = value.trim().to_ascii_lowercase().replace('_', "-");
        RailKind::ALL
            .into_iter()
            .find(|kind| kind.slug() == normalized)
            .ok_or_else(|| PaymentError::ValidationError(format!("unknown rail '{value}'")))
    }
}

/// Status vocabulary shared by all rails.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RailStatus {
    Created,
    Pending,
    Confirmed,
    Failed,
    Cancelled,
}

impl RailStatus {
    /// Transaction state this rail status drives toward, if any.
    pub fn target_status(self) -> Option<TransactionStatus> {
        match self {
            Self::Created => None,
            Self::Pending => Some(TransactionStatus::Processing),
            Self::Confirmed => Some(TransactionStatus::Completed),
            Self::Failed | Self::Cancelled => Some(TransactionStatus::Failed),
        }
    }
}

/// Rail-specific payload the client completes to pay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum RailArtifact {
    /// Unsigned token transfer the participant's wallet signs and submits.
    SignedTransactionTemplate {
        tx_hash: String,
        chain_id: u64,
        contract: String,
        token: String,
        token_units: String,
        nonce: u64,
        calldata: String,
    },
    HostedCheckout {
        charge_code: String,
        hosted_url: String,
        expires_at: DateTime<Utc>,
    },
    ClientSecret {
        payment_intent_id: String,
        client_secret: String,
    },
    BankTransfer {
        payout_id: String,
        reference: String,
        account_name: String,
        bsb: String,
        account_last4: String,
    },
}

impl RailArtifact {
    pub fn rail_reference(&self) -> &str {
        match self {
            Self::SignedTransactionTemplate { tx_hash, .. } => tx_hash,
            Self::HostedCheckout { charge_code, .. } => charge_code,
            Self::ClientSecret {
                payment_intent_id, ..
            } => payment_intent_id,
            Self::BankTransfer { payout_id, .. } => payout_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RailFailure {
    pub code: String,
    pub retryable: bool,
}

/// A verified, normalized confirmation from a rail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RailEvent {
    pub rail: RailKind,
    pub event_id: String,
    pub rail_reference: String,
    pub status: RailStatus,
    pub occurred_at: DateTime<Utc>,
    pub failure: Option<RailFailure>,
    /// Original event body, kept for the transaction audit trail.
    pub payload: Value,
}

/// Inbound webhook headers with case-insensitive lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WebhookHeaders(BTreeMap<String, String>);

impl WebhookHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl AsRef<str>, value: impl Into<String>) {
        self.0
            .insert(name.as_ref().to_ascii_lowercase(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn require(&self, name: &str) -> Result<&str> {
        self.get(name)
            .ok_or_else(|| PaymentError::InvalidSignature(format!("missing header '{name}'")))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K: AsRef<str>, V: Into<String>> FromIterator<(K, V)> for WebhookHeaders {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut headers = Self::new();
        for (name, value) in iter {
            headers.insert(name, value);
        }
        headers
    }
}

/// Uniform contract implemented per payment rail.
#[async_trait]
pub trait RailAdapter: Send + Sync {
    fn kind(&self) -> RailKind;

    /// Builds the artifact the client must complete. May perform network I/O;
    /// never called while a ledger mutation is open.
    async fn prepare(&self, transaction: &PaymentTransaction) -> Result<RailArtifact>;

    /// Poll path for rails whose webhooks are unreliable.
    async fn query_status(&self, rail_reference: &str) -> Result<RailStatus>;

    /// Verifies the signature over the raw, unparsed body and normalizes the
    /// event. Fails with `InvalidSignature` on a bad, missing or stale
    /// signature.
    fn parse_event(&self, raw_body: &[u8], headers: &WebhookHeaders) -> Result<RailEvent>;
}

/// A bank payout requested on behalf of a provider.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PayoutInstruction {
    pub redemption_id: String,
    pub provider_id: String,
    pub amount: Amount,
    pub bank_details: BankDetails,
}

/// Rails able to push funds out to a bank account.
#[async_trait]
pub trait PayoutRail: RailAdapter {
    async fn push_payout(&self, instruction: &PayoutInstruction) -> Result<RailArtifact>;
}

/// Dependency-injected set of rail adapters, one per kind.
#[derive(Default, Clone)]
pub struct RailRegistry {
    adapters: HashMap<RailKind, Arc<dyn RailAdapter>>,
    payout: Option<Arc<dyn PayoutRail>>,
}

impl RailRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: Arc<dyn RailAdapter>) {
        self.adapters.insert(adapter.kind(), adapter);
    }

    /// Registers a payout-capable rail both as a regular adapter and as the
    /// redemption payout rail.
    pub fn register_payout<T: PayoutRail + 'static>(&mut self, rail: Arc<T>) {
        self.adapters.insert(rail.kind(), rail.clone());
        self.payout = Some(rail);
    }

    pub fn get(&self, kind: RailKind) -> Result<Arc<dyn RailAdapter>> {
        self.adapters
            .get(&kind)
            .cloned()
            .ok_or_else(|| PaymentError::RailUnavailable {
                rail: kind,
                message: "no adapter registered".to_string(),
            })
    }

    pub fn payout(&self) -> Result<Arc<dyn PayoutRail>> {
        self.payout
            .clone()
            .ok_or_else(|| PaymentError::RailUnavailable {
                rail: RailKind::BankTransfer,
                message: "no payout rail registered".to_string(),
            })
    }

    pub fn has(&self, kind: RailKind) -> bool {
        self.adapters.contains_key(&kind)
    }
}
