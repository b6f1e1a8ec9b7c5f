use super::signature::{check_freshness, compute_signature, verify_signature};
use super::{StatusBook, failure_for, unknown_event};
use crate::domain::rail::{
    RailAdapter, RailArtifact, RailEvent, RailKind, RailStatus, WebhookHeaders,
};
use crate::domain::transaction::PaymentTransaction;
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;

pub const SIGNATURE_HEADER: &str = "x-cc-webhook-signature";

const CHARGE_TTL_MINUTES: i64 = 60;

#[derive(Debug, Deserialize)]
struct ChargeWebhook {
    event: ChargeEvent,
}

#[derive(Debug, Deserialize)]
struct ChargeEvent {
    id: String,
    #[serde(rename = "type")]
    kind: String,
    created_at: DateTime<Utc>,
    data: ChargeData,
}

#[derive(Debug, Deserialize)]
struct ChargeData {
    code: String,
}

/// Hosted crypto checkout. The participant pays on the hosted page; the
/// processor reports the charge lifecycle by webhook.
pub struct CryptoChargeSandbox {
    secret: String,
    tolerance: Duration,
    checkout_base_url: String,
    book: StatusBook,
}

impl CryptoChargeSandbox {
    pub fn new(secret: &str, tolerance: Duration, checkout_base_url: &str) -> Self {
        Self {
            secret: secret.to_string(),
            tolerance,
            checkout_base_url: checkout_base_url.trim_end_matches('/').to_string(),
            book: StatusBook::new(),
        }
    }

    pub fn book(&self) -> &StatusBook {
        &self.book
    }

    /// The processor signs the raw body only; freshness comes from
    /// `event.created_at`.
    pub fn webhook_headers(&self, body: &[u8]) -> Result<WebhookHeaders> {
        let signature = compute_signature(&self.secret, body)?;
        Ok([(SIGNATURE_HEADER, signature)].into_iter().collect())
    }

    fn native_status(kind: &str) -> Result<(RailStatus, bool)> {
        let name = kind.strip_prefix("charge:").unwrap_or(kind);
        let mapped = match name {
            "created" => (RailStatus::Created, false),
            "pending" | "delayed" => (RailStatus::Pending, false),
            "confirmed" | "resolved" => (RailStatus::Confirmed, false),
            "failed" => (RailStatus::Failed, true),
            "canceled" => (RailStatus::Cancelled, true),
            _ => return Err(unknown_event(RailKind::CryptoCharge, kind)),
        };
        Ok(mapped)
    }
}

#[async_trait]
impl RailAdapter for CryptoChargeSandbox {
    fn kind(&self) -> RailKind {
        RailKind::CryptoCharge
    }

    async fn prepare(&self, _transaction: &PaymentTransaction) -> Result<RailArtifact> {
        self.book.ensure_online(self.kind())?;

        let charge_code: String = uuid::Uuid::new_v4()
            .simple()
            .to_string()
            .chars()
            .take(8)
            .collect::<String>()
            .to_ascii_uppercase();
        self.book.record(&charge_code, RailStatus::Created).await;

        Ok(RailArtifact::HostedCheckout {
            hosted_url: format!("{}/charges/{}", self.checkout_base_url, charge_code),
            charge_code,
            expires_at: Utc::now() + Duration::minutes(CHARGE_TTL_MINUTES),
        })
    }

    async fn query_status(&self, rail_reference: &str) -> Result<RailStatus> {
        self.book.status(self.kind(), rail_reference).await
    }

    fn parse_event(&self, raw_body: &[u8], headers: &WebhookHeaders) -> Result<RailEvent> {
        let signature = headers.require(SIGNATURE_HEADER)?;
        verify_signature(&self.secret, raw_body, signature)?;

        let webhook: ChargeWebhook = serde_json::from_slice(raw_body)?;
        check_freshness(webhook.event.created_at, Utc::now(), self.tolerance)?;

        let (status, retryable) = Self::native_status(&webhook.event.kind)?;
        Ok(RailEvent {
            rail: self.kind(),
            event_id: webhook.event.id,
            rail_reference: webhook.event.data.code,
            status,
            occurred_at: webhook.event.created_at,
            failure: failure_for(status, &webhook.event.kind, retryable),
            payload: serde_json::from_slice(raw_body)?,
        })
    }
}
