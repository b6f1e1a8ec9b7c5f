#![allow(dead_code)]

use chrono::{Duration, Utc};
use planpay::application::engine::SettlementEngine;
use planpay::application::gateway::{InitiatedPayment, PaymentRequest};
use planpay::config::EngineConfig;
use planpay::domain::budget::{Balance, BudgetCategory};
use planpay::domain::ports::SharedLedgerStore;
use planpay::domain::provider::ProviderRegistration;
use planpay::domain::rail::{RailKind, WebhookHeaders};
use planpay::infrastructure::in_memory::{
    InMemoryCredentialStore, InMemoryLedgerStore, InMemoryProviderDirectory, in_memory_stores,
};
use planpay::infrastructure::rails::SandboxRails;
use rust_decimal::Decimal;
use serde_json::json;
use std::sync::Arc;

pub const PARTICIPANT: &str = "p-1";
pub const PROVIDER: &str = "prov-1";
pub const CATEGORY: &str = "cat-t";
pub const TOTP_SECRET: &[u8] = b"12345678901234567890123456789012";
pub const BACKUP_CODES: [&str; 2] = ["ABCD-1234", "EFGH-5678"];

pub struct Harness {
    pub engine: SettlementEngine,
    pub rails: SandboxRails,
    pub credentials: InMemoryCredentialStore,
}

/// Engine over in-memory stores with one registered provider, one enrolled
/// participant and a transport category holding `allocated`.
pub async fn harness(allocated: Decimal) -> Harness {
    harness_with_ledger(allocated, Arc::new(InMemoryLedgerStore::new())).await
}

/// Same as [`harness`] with the given ledger backend.
pub async fn harness_with_ledger(allocated: Decimal, ledger: SharedLedgerStore) -> Harness {
    let config = EngineConfig::default();

    let providers = InMemoryProviderDirectory::new();
    providers
        .register(ProviderRegistration {
            provider_id: PROVIDER.into(),
            registration_number: "4050012345".into(),
            active: true,
            expires_at: Utc::now() + Duration::days(365),
        })
        .await;
    let credentials = InMemoryCredentialStore::new();
    credentials
        .enroll(PARTICIPANT, Some(TOTP_SECRET.to_vec()), None, &BACKUP_CODES)
        .await;

    let mut stores = in_memory_stores(Arc::new(providers), Arc::new(credentials.clone()));
    stores.ledger = ledger;
    let rails = SandboxRails::new(&config);
    let engine = SettlementEngine::new(stores, rails.registry(), &config);
    engine
        .provision_category(BudgetCategory::new(
            CATEGORY,
            "plan-1",
            PARTICIPANT,
            "transport",
            Balance(allocated),
        ))
        .await
        .unwrap();

    Harness {
        engine,
        rails,
        credentials,
    }
}

pub fn card_payment(amount: Decimal) -> PaymentRequest {
    PaymentRequest {
        participant_id: PARTICIPANT.into(),
        provider_id: PROVIDER.into(),
        category_id: CATEGORY.into(),
        service_code: "transport".into(),
        amount,
        rail_kind: RailKind::Card,
        voucher_id: None,
        step_up_evidence: None,
    }
}

pub async fn initiate(harness: &Harness, amount: Decimal) -> InitiatedPayment {
    harness
        .engine
        .initiate_payment(PARTICIPANT, card_payment(amount))
        .await
        .unwrap()
}

/// A signed card webhook for `intent_id` with the given `payment_intent.*` event.
pub fn card_event(
    rails: &SandboxRails,
    event_id: &str,
    intent_id: &str,
    event: &str,
) -> (Vec<u8>, WebhookHeaders) {
    let raw = serde_json::to_vec(&json!({
        "id": event_id,
        "type": format!("payment_intent.{event}"),
        "data": { "object": { "id": intent_id } }
    }))
    .unwrap();
    let headers = rails.card.webhook_headers(&raw).unwrap();
    (raw, headers)
}

/// A signed bank-transfer webhook for `payout_id` with the given `payout.*` event.
pub fn bank_event(
    rails: &SandboxRails,
    event_id: &str,
    payout_id: &str,
    event: &str,
    failure_code: Option<&str>,
) -> (Vec<u8>, WebhookHeaders) {
    let raw = serde_json::to_vec(&json!({
        "id": event_id,
        "type": format!("payout.{event}"),
        "data": { "payout_id": payout_id, "failure_code": failure_code }
    }))
    .unwrap();
    let headers = rails.bank_transfer.webhook_headers(&raw).unwrap();
    (raw, headers)
}

/// Initiates a card payment and confirms it by webhook; returns its id.
pub async fn completed_payment(harness: &Harness, amount: Decimal) -> String {
    let initiated = initiate(harness, amount).await;
    let intent = initiated.rail_artifact.rail_reference().to_string();
    let (raw, headers) = card_event(
        &harness.rails,
        &format!("evt_{}", initiated.transaction.id),
        &intent,
        "succeeded",
    );
    harness
        .engine
        .ingest_webhook(RailKind::Card, &raw, &headers)
        .await
        .unwrap();
    initiated.transaction.id
}
