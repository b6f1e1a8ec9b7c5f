use super::signature::{
    check_freshness, compute_signature, parse_unix_timestamp, timestamped_payload,
    verify_signature,
};
use super::{StatusBook, failure_for, unknown_event};
use crate::domain::rail::{
    RailAdapter, RailArtifact, RailEvent, RailKind, RailStatus, WebhookHeaders,
};
use crate::domain::transaction::PaymentTransaction;
use crate::error::{PaymentError, Result};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde::Deserialize;

pub const SIGNATURE_HEADER: &str = "x-card-signature";

#[derive(Debug, Deserialize)]
struct CardWebhook {
    id: String,
    #[serde(rename = "type")]
    kind: String,
    data: CardData,
}

#[derive(Debug, Deserialize)]
struct CardData {
    object: PaymentIntent,
}

#[derive(Debug, Deserialize)]
struct PaymentIntent {
    id: String,
    #[serde(default)]
    last_payment_error: Option<LastPaymentError>,
}

#[derive(Debug, Deserialize)]
struct LastPaymentError {
    code: String,
}

/// Splits `t=<unix>,v1=<hex>` into its timestamp and signature.
fn parse_signature_header(value: &str) -> Result<(&str, &str)> {
    let mut timestamp = None;
    let mut signature = None;
    for part in value.split(',') {
        match part.trim().split_once('=') {
            Some(("t", t)) => timestamp = Some(t),
            Some(("v1", v1)) => signature = Some(v1),
            _ => {}
        }
    }
    timestamp.zip(signature).ok_or_else(|| {
        PaymentError::InvalidSignature(format!("malformed {SIGNATURE_HEADER} header"))
    })
}

/// Card processor using payment intents confirmed client-side.
pub struct CardSandbox {
    secret: String,
    tolerance: Duration,
    book: StatusBook,
}

impl CardSandbox {
    pub fn new(secret: &str, tolerance: Duration) -> Self {
        Self {
            secret: secret.to_string(),
            tolerance,
            book: StatusBook::new(),
        }
    }

    pub fn book(&self) -> &StatusBook {
        &self.book
    }

    pub fn webhook_headers(&self, body: &[u8]) -> Result<WebhookHeaders> {
        let timestamp = Utc::now().timestamp().to_string();
        let signature =
            compute_signature(&self.secret, &timestamped_payload(&timestamp, body))?;
        Ok([(SIGNATURE_HEADER, format!("t={timestamp},v1={signature}"))]
            .into_iter()
            .collect())
    }

    fn native_status(kind: &str) -> Result<(RailStatus, bool)> {
        let name = kind.strip_prefix("payment_intent.").unwrap_or(kind);
        let mapped = match name {
            "created" => (RailStatus::Created, false),
            "processing" | "requires_action" => (RailStatus::Pending, false),
            "succeeded" => (RailStatus::Confirmed, false),
            "payment_failed" => (RailStatus::Failed, false),
            "canceled" => (RailStatus::Cancelled, true),
            _ => return Err(unknown_event(RailKind::Card, kind)),
        };
        Ok(mapped)
    }
}

#[async_trait]
impl RailAdapter for CardSandbox {
    fn kind(&self) -> RailKind {
        RailKind::Card
    }

    async fn prepare(&self, _transaction: &PaymentTransaction) -> Result<RailArtifact> {
        self.book.ensure_online(self.kind())?;

        let intent = uuid::Uuid::new_v4().simple().to_string();
        let payment_intent_id = format!("pi_{}", &intent[..24]);
        let client_secret = format!(
            "{}_secret_{}",
            payment_intent_id,
            &uuid::Uuid::new_v4().simple().to_string()[..16]
        );
        self.book.record(&payment_intent_id, RailStatus::Created).await;

        Ok(RailArtifact::ClientSecret {
            payment_intent_id,
            client_secret,
        })
    }

    async fn query_status(&self, rail_reference: &str) -> Result<RailStatus> {
        self.book.status(self.kind(), rail_reference).await
    }

    fn parse_event(&self, raw_body: &[u8], headers: &WebhookHeaders) -> Result<RailEvent> {
        let (timestamp, signature) = parse_signature_header(headers.require(SIGNATURE_HEADER)?)?;
        let signed_at = parse_unix_timestamp(timestamp)?;
        check_freshness(signed_at, Utc::now(), self.tolerance)?;
        verify_signature(
            &self.secret,
            &timestamped_payload(timestamp, raw_body),
            signature,
        )?;

        let webhook: CardWebhook = serde_json::from_slice(raw_body)?;
        let (status, retryable) = Self::native_status(&webhook.kind)?;
        let code = webhook
            .data
            .object
            .last_payment_error
            .as_ref()
            .map(|e| e.code.as_str())
            .unwrap_or(&webhook.kind);
        Ok(RailEvent {
            rail: self.kind(),
            event_id: webhook.id.clone(),
            rail_reference: webhook.data.object.id.clone(),
            status,
            occurred_at: signed_at,
            failure: failure_for(status, code, retryable),
            payload: serde_json::from_slice(raw_body)?,
        })
    }
}
