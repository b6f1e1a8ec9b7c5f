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
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};

pub const SIGNATURE_HEADER: &str = "x-chain-signature";
pub const TIMESTAMP_HEADER: &str = "x-chain-timestamp";

/// Polygon Amoy testnet.
const SANDBOX_CHAIN_ID: u64 = 80002;
const ESCROW_CONTRACT: &str = "0x5f0b1a82749cb4e2278ec87f8bf6b618dc71a8bf";
const STABLECOIN: &str = "AUDC";
const TOKEN_DECIMALS: u32 = 6;
/// `transfer(address,uint256)`
const TRANSFER_SELECTOR: &str = "a9059cbb";

#[derive(Debug, Deserialize)]
struct ChainWebhook {
    id: String,
    tx_hash: String,
    status: String,
    #[serde(default)]
    confirmations: u32,
    #[serde(default)]
    reason: Option<String>,
}

/// Simulated EVM chain with an escrow contract accepting stablecoin transfers.
pub struct OnChainSandbox {
    secret: String,
    tolerance: Duration,
    confirmations_required: u32,
    nonce: AtomicU64,
    book: StatusBook,
}

impl OnChainSandbox {
    pub fn new(secret: &str, tolerance: Duration, confirmations_required: u32) -> Self {
        Self {
            secret: secret.to_string(),
            tolerance,
            confirmations_required,
            nonce: AtomicU64::new(0),
            book: StatusBook::new(),
        }
    }

    pub fn book(&self) -> &StatusBook {
        &self.book
    }

    /// Headers the chain indexer would attach to `body` right now.
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

    fn token_units(amount: Decimal) -> Result<u128> {
        (amount * Decimal::from(10u64.pow(TOKEN_DECIMALS)))
            .trunc()
            .to_u128()
            .ok_or_else(|| PaymentError::InvalidAmount(format!("{amount} overflows token units")))
    }

    fn native_status(&self, webhook: &ChainWebhook) -> Result<(RailStatus, bool)> {
        let mapped = match webhook.status.as_str() {
            "submitted" => (RailStatus::Pending, false),
            "mined" if webhook.confirmations >= self.confirmations_required => {
                (RailStatus::Confirmed, false)
            }
            "mined" => (RailStatus::Pending, false),
            "reverted" => (RailStatus::Failed, false),
            "dropped" => (RailStatus::Cancelled, true),
            other => return Err(unknown_event(RailKind::OnChain, other)),
        };
        Ok(mapped)
    }
}

#[async_trait]
impl RailAdapter for OnChainSandbox {
    fn kind(&self) -> RailKind {
        RailKind::OnChain
    }

    async fn prepare(&self, transaction: &PaymentTransaction) -> Result<RailArtifact> {
        self.book.ensure_online(self.kind())?;

        let nonce = self.nonce.fetch_add(1, Ordering::SeqCst);
        let units = Self::token_units(transaction.amount.value())?;
        let calldata = format!(
            "0x{}{:0>64}{:064x}",
            TRANSFER_SELECTOR,
            ESCROW_CONTRACT.trim_start_matches("0x"),
            units
        );
        let tx_hash = format!(
            "0x{}",
            hex::encode(Sha256::digest(
                format!("{}:{}:{}", transaction.id, nonce, calldata).as_bytes()
            ))
        );

        self.book.record(&tx_hash, RailStatus::Created).await;
        Ok(RailArtifact::SignedTransactionTemplate {
            tx_hash,
            chain_id: SANDBOX_CHAIN_ID,
            contract: ESCROW_CONTRACT.to_string(),
            token: STABLECOIN.to_string(),
            token_units: units.to_string(),
            nonce,
            calldata,
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

        let webhook: ChainWebhook = serde_json::from_slice(raw_body)?;
        let (status, retryable) = self.native_status(&webhook)?;
        let code = webhook.reason.as_deref().unwrap_or(&webhook.status);
        Ok(RailEvent {
            rail: self.kind(),
            event_id: webhook.id.clone(),
            rail_reference: webhook.tx_hash.clone(),
            status,
            occurred_at: signed_at,
            failure: failure_for(status, code, retryable),
            payload: serde_json::from_slice(raw_body)?,
        })
    }
}
