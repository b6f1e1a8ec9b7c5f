use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Second factors accepted above the step-up threshold.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum StepUpMethod {
    Totp,
    BackupCode,
    Biometric,
}

impl StepUpMethod {
    pub const ALL: [StepUpMethod; 3] = [Self::Totp, Self::BackupCode, Self::Biometric];
}

/// Device-signed assertion produced after a local biometric check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BiometricAssertion {
    /// Hex Ed25519 signature over `"{user_id}:{amount}:{signed_at}"`.
    pub signature: String,
    /// Unix seconds at which the device produced the signature.
    pub signed_at: i64,
}

/// Evidence a client submits alongside a payment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepUpEvidence {
    pub totp_code: Option<String>,
    pub backup_code: Option<String>,
    pub biometric: Option<BiometricAssertion>,
}

impl StepUpEvidence {
    pub fn is_empty(&self) -> bool {
        self.totp_code.is_none() && self.backup_code.is_none() && self.biometric.is_none()
    }

    pub fn supplied_methods(&self) -> Vec<StepUpMethod> {
        let mut methods = Vec::new();
        if self.totp_code.is_some() {
            methods.push(StepUpMethod::Totp);
        }
        if self.backup_code.is_some() {
            methods.push(StepUpMethod::BackupCode);
        }
        if self.biometric.is_some() {
            methods.push(StepUpMethod::Biometric);
        }
        methods
    }
}

/// Second-factor material held for one user by the identity system.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepUpEnrollment {
    pub user_id: String,
    pub totp_secret: Option<Vec<u8>>,
    /// Ed25519 public key of the enrolled biometric device.
    pub biometric_key: Option<[u8; 32]>,
    pub has_backup_codes: bool,
}

impl StepUpEnrollment {
    pub fn methods(&self) -> Vec<StepUpMethod> {
        let mut methods = Vec::new();
        if self.totp_secret.is_some() {
            methods.push(StepUpMethod::Totp);
        }
        if self.has_backup_codes {
            methods.push(StepUpMethod::BackupCode);
        }
        if self.biometric_key.is_some() {
            methods.push(StepUpMethod::Biometric);
        }
        methods
    }
}

/// Outcome of the step-up gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepUpDecision {
    /// `satisfied_by` is `None` when the amount is below the threshold.
    Allowed { satisfied_by: Option<StepUpMethod> },
    ChallengeRequired { methods: Vec<StepUpMethod> },
}

/// Ephemeral record of one gate evaluation, kept only for the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityVerificationContext {
    pub user_id: String,
    pub amount: rust_decimal::Decimal,
    pub required_methods: Vec<StepUpMethod>,
    pub evidence_supplied: Vec<StepUpMethod>,
    pub evaluated_at: DateTime<Utc>,
}
