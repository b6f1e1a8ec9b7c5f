use chrono::Duration;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::fmt;

/// When a second factor is required and how evidence is checked.
#[derive(Debug, Clone)]
pub struct StepUpPolicy {
    /// Amounts at or above this value need a second factor.
    pub threshold: Decimal,
    pub totp_step_secs: u64,
    /// Accepted clock drift in TOTP steps either side of now.
    pub totp_skew_steps: u64,
    pub biometric_max_age: Duration,
}

impl Default for StepUpPolicy {
    fn default() -> Self {
        Self {
            threshold: dec!(1000),
            totp_step_secs: 30,
            totp_skew_steps: 1,
            biometric_max_age: Duration::seconds(120),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AmountBounds {
    /// Largest single payment accepted by the gateway (inclusive).
    pub max: Decimal,
}

impl Default for AmountBounds {
    fn default() -> Self {
        Self { max: dec!(50000) }
    }
}

/// Shared webhook signing secrets, one per rail.
#[derive(Clone)]
pub struct RailSecrets {
    pub on_chain: String,
    pub crypto_charge: String,
    pub card: String,
    pub bank_transfer: String,
}

impl fmt::Debug for RailSecrets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RailSecrets")
            .field("on_chain", &"<redacted>")
            .field("crypto_charge", &"<redacted>")
            .field("card", &"<redacted>")
            .field("bank_transfer", &"<redacted>")
            .finish()
    }
}

impl Default for RailSecrets {
    fn default() -> Self {
        Self {
            on_chain: "whsec_sandbox_on_chain".to_string(),
            crypto_charge: "whsec_sandbox_crypto_charge".to_string(),
            card: "whsec_sandbox_card".to_string(),
            bank_transfer: "whsec_sandbox_bank_transfer".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub step_up: StepUpPolicy,
    pub amount_bounds: AmountBounds,
    /// Maximum age of a signed webhook before it is rejected as stale.
    pub webhook_tolerance: Duration,
    pub rail_secrets: RailSecrets,
    /// Block confirmations before an on-chain transfer counts as final.
    pub chain_confirmations: u32,
    pub checkout_base_url: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            step_up: StepUpPolicy::default(),
            amount_bounds: AmountBounds::default(),
            webhook_tolerance: Duration::seconds(300),
            rail_secrets: RailSecrets::default(),
            chain_confirmations: 3,
            checkout_base_url: "https://checkout.sandbox.planpay.local".to_string(),
        }
    }
}
