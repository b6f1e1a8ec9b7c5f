//! Sandbox rail adapters.
//!
//! Each adapter keeps the rail's side of the world (issued references and
//! their current status) in a local [`StatusBook`], so tests and local runs
//! can drive webhooks and polls deterministically. Signing and event parsing
//! follow the real rails' schemes.

pub mod bank_transfer;
pub mod card;
pub mod crypto_charge;
pub mod on_chain;
pub mod signature;

use crate::config::EngineConfig;
use crate::domain::rail::{RailFailure, RailKind, RailRegistry, RailStatus};
use crate::error::{PaymentError, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;

pub use bank_transfer::BankTransferSandbox;
pub use card::CardSandbox;
pub use crypto_charge::CryptoChargeSandbox;
pub use on_chain::OnChainSandbox;

/// Statuses of every reference a sandbox rail has issued.
#[derive(Debug, Default, Clone)]
pub struct StatusBook {
    statuses: Arc<RwLock<HashMap<String, RailStatus>>>,
    offline: Arc<AtomicBool>,
}

impl StatusBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record(&self, reference: &str, status: RailStatus) {
        let mut statuses = self.statuses.write().await;
        statuses.insert(reference.to_string(), status);
    }

    pub async fn status(&self, kind: RailKind, reference: &str) -> Result<RailStatus> {
        self.ensure_online(kind)?;
        let statuses = self.statuses.read().await;
        statuses
            .get(reference)
            .copied()
            .ok_or_else(|| PaymentError::not_found("rail reference", reference))
    }

    /// Makes every outbound call fail with `RailUnavailable` while set.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn ensure_online(&self, kind: RailKind) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(PaymentError::RailUnavailable {
                rail: kind,
                message: "sandbox rail is offline".to_string(),
            });
        }
        Ok(())
    }
}

pub(crate) fn failure_for(status: RailStatus, code: &str, retryable: bool) -> Option<RailFailure> {
    matches!(status, RailStatus::Failed | RailStatus::Cancelled).then(|| RailFailure {
        code: code.to_string(),
        retryable,
    })
}

pub(crate) fn unknown_event(kind: RailKind, name: &str) -> PaymentError {
    PaymentError::ValidationError(format!("{kind} sent unknown event type '{name}'"))
}

/// The four sandbox rails, kept as concrete handles so callers can drive them.
#[derive(Clone)]
pub struct SandboxRails {
    pub on_chain: Arc<OnChainSandbox>,
    pub crypto_charge: Arc<CryptoChargeSandbox>,
    pub card: Arc<CardSandbox>,
    pub bank_transfer: Arc<BankTransferSandbox>,
}

impl SandboxRails {
    pub fn new(config: &EngineConfig) -> Self {
        let secrets = &config.rail_secrets;
        Self {
            on_chain: Arc::new(OnChainSandbox::new(
                &secrets.on_chain,
                config.webhook_tolerance,
                config.chain_confirmations,
            )),
            crypto_charge: Arc::new(CryptoChargeSandbox::new(
                &secrets.crypto_charge,
                config.webhook_tolerance,
                &config.checkout_base_url,
            )),
            card: Arc::new(CardSandbox::new(&secrets.card, config.webhook_tolerance)),
            bank_transfer: Arc::new(BankTransferSandbox::new(
                &secrets.bank_transfer,
                config.webhook_tolerance,
            )),
        }
    }

    pub fn registry(&self) -> RailRegistry {
        let mut registry = RailRegistry::new();
        registry.register(self.on_chain.clone());
        registry.register(self.crypto_charge.clone());
        registry.register(self.card.clone());
        registry.register_payout(self.bank_transfer.clone());
        registry
    }
}
