use super::signature::{
    check_freshness, compute_signature, parse_unix_timestamp, timestamped_payload,
    verify_signature,
};
use super::{StatusBook, failure_for, unknown_event};
use crate::domain::rail::{
    PayoutInstruction, PayoutRail, RailAdapter, RailArtifact, RailEvent, RailKind, RailStatus,
    WebhookHeaders,
};
use crate::domain::transaction::PaymentTransaction;
use crate::error::Result;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde::Deserialize;

pub const SIGNATURE_HEADER: &str = "x-bank-signature";
pub const TIMESTAMP_HEADER: &str = "x-bank-timestamp";

/// Trust account participants pay into for bank-transfer purchases.
const COLLECTION_ACCOUNT_NAME: &str = "PlanPay Client Trust";
const COLLECTION_BSB: &str = "062-000";
const COLLECTION_ACCOUNT_LAST4: &str = "4821";

#[derive(Debug, Deserialize)]
struct BankWebhook {
    id: String,
    #[serde(rename = "type")]
    kind: String,
    data: PayoutData,
}

#[derive(Debug, Deserialize)]
struct PayoutData {
    payout_id: String,
    #[serde(default)]
    failure_code: Option<String>,
}

/// Domestic bank transfers, inbound (participant pays by reference) and
/// outbound (provider payouts).
pub struct BankTransferSandbox {
    secret: String,
    tolerance: Duration,
    book: StatusBook,
}

impl BankTransferSandbox {
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
        Ok([
            (SIGNATURE_HEADER, signature),
            (TIMESTAMP_HEADER, timestamp),
        ]
        .into_iter()
        .collect())
    }

    fn new_payout_id() -> String {
        format!("po_{}", &uuid::Uuid::new_v4().simple().to_string()[..20])
    }

    /// `failed` is a transient bank-side error; `returned` and `rejected`
    /// mean the destination account itself is unusable.
    fn native_status(kind: &str) -> Result<(RailStatus, bool)> {
        let name = kind.strip_prefix("payout.").unwrap_or(kind);
        let mapped = match name {
            "created" => (RailStatus::Created, false),
            "pending" | "in_transit" => (RailStatus::Pending, false),
            "paid" => (RailStatus::Confirmed, false),
            "failed" => (RailStatus::Failed, true),
            "returned" | "rejected" => (RailStatus::Failed, false),
            "cancelled" => (RailStatus::Cancelled, true),
            _ => return Err(unknown_event(RailKind::BankTransfer, kind)),
        };
        Ok(mapped)
    }
}

#[async_trait]
impl RailAdapter for BankTransferSandbox {
    fn kind(&self) -> RailKind {
        RailKind::BankTransfer
    }

    async fn prepare(&self, transaction: &PaymentTransaction) -> Result<RailArtifact> {
        self.book.ensure_online(self.kind())?;

        let payout_id = Self::new_payout_id();
        let reference = format!(
            "PP{}",
            transaction
                .id
                .trim_start_matches("txn_")
                .chars()
                .take(10)
                .collect::<String>()
                .to_ascii_uppercase()
        );
        self.book.record(&payout_id, RailStatus::Created).await;

        Ok(RailArtifact::BankTransfer {
            payout_id,
            reference,
            account_name: COLLECTION_ACCOUNT_NAME.to_string(),
            bsb: COLLECTION_BSB.to_string(),
            account_last4: COLLECTION_ACCOUNT_LAST4.to_string(),
        })
    }

    async fn query_status(&self, rail_reference: &str) -> Result<RailStatus> {
        self.book.status(self.kind(), rail_reference).await
    }

    fn parse_event(&self, raw_body: &[u8], headers: &WebhookHeaders) -> Result<RailEvent> {
        let signature = headers.require(SIGNATURE_HEADER)?;
        let timestamp = headers.require(TIMESTAMP_HEADER)?;
        let signed_at = parse_unix_timestamp(timestamp)?;
        check_freshness(signed_at, Utc::now(), self.tolerance)?;
        verify_signature(
            &self.secret,
            &timestamped_payload(timestamp, raw_body),
            signature,
        )?;

        let webhook: BankWebhook = serde_json::from_slice(raw_body)?;
        let (status, retryable) = Self::native_status(&webhook.kind)?;
        let code = webhook
            .data
            .failure_code
            .as_deref()
            .unwrap_or(&webhook.kind);
        Ok(RailEvent {
            rail: self.kind(),
            event_id: webhook.id.clone(),
            rail_reference: webhook.data.payout_id.clone(),
            status,
            occurred_at: signed_at,
            failure: failure_for(status, code, retryable),
            payload: serde_json::from_slice(raw_body)?,
        })
    }
}

#[async_trait]
impl PayoutRail for BankTransferSandbox {
    async fn push_payout(&self, instruction: &PayoutInstruction) -> Result<RailArtifact> {
        self.book.ensure_online(self.kind())?;

        let payout_id = Self::new_payout_id();
        self.book.record(&payout_id, RailStatus::Pending).await;

        Ok(RailArtifact::BankTransfer {
            payout_id,
            reference: format!(
                "RDM{}",
                instruction
                    .redemption_id
                    .trim_start_matches("rdm_")
                    .chars()
                    .take(10)
                    .collect::<String>()
                    .to_ascii_uppercase()
            ),
            account_name: instruction.bank_details.account_name.clone(),
            bsb: instruction.bank_details.bsb.clone(),
            account_last4: instruction.bank_details.account_last4(),
        })
    }
}
