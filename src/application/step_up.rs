use crate::config::StepUpPolicy;
use crate::domain::ports::SharedCredentialStore;
use crate::domain::step_up::{
    BiometricAssertion, SecurityVerificationContext, StepUpDecision, StepUpEnrollment,
    StepUpEvidence, StepUpMethod,
};
use crate::error::Result;
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::{info, warn};

type HmacSha256 = Hmac<Sha256>;

const TOTP_DIGITS: u32 = 6;

/// Hash under which backup codes are stored and looked up.
///
/// Codes are compared case-insensitively with separators removed, so
/// `ABCD-1234` and `abcd1234` are the same code.
pub fn hash_backup_code(code: &str) -> [u8; 32] {
    let normalized: String = code
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect();
    Sha256::digest(normalized.as_bytes()).into()
}

/// RFC 6238 code for `counter` using HMAC-SHA256 and dynamic truncation.
pub fn totp_code(secret: &[u8], counter: u64) -> String {
    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return String::new();
    };
    mac.update(&counter.to_be_bytes());
    let digest = mac.finalize().into_bytes();

    let offset = (digest[digest.len() - 1] & 0x0f) as usize;
    let binary = u32::from_be_bytes([
        digest[offset] & 0x7f,
        digest[offset + 1],
        digest[offset + 2],
        digest[offset + 3],
    ]);
    format!(
        "{:0width$}",
        binary % 10u32.pow(TOTP_DIGITS),
        width = TOTP_DIGITS as usize
    )
}

/// Message a biometric device signs to approve one payment.
pub fn biometric_message(user_id: &str, amount: Decimal, signed_at: i64) -> String {
    format!("{}:{}:{}", user_id, amount.normalize(), signed_at)
}

/// Result of one gate evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepUpEvaluation {
    pub decision: StepUpDecision,
    pub context: SecurityVerificationContext,
}

/// Amount-based second-factor escalation.
#[derive(Clone)]
pub struct StepUpGate {
    credentials: SharedCredentialStore,
    policy: StepUpPolicy,
}

impl StepUpGate {
    pub fn new(credentials: SharedCredentialStore, policy: StepUpPolicy) -> Self {
        Self {
            credentials,
            policy,
        }
    }

    pub fn requires_step_up(&self, amount: Decimal) -> bool {
        amount >= self.policy.threshold
    }

    /// Methods a client should offer the user. Unenrolled users are shown
    /// every method so they can enrol one.
    pub async fn challenge(&self, user_id: &str) -> Result<Vec<StepUpMethod>> {
        let enrollment = self.credentials.enrollment(user_id).await?;
        Ok(Self::challenge_methods(enrollment.as_ref()))
    }

    fn challenge_methods(enrollment: Option<&StepUpEnrollment>) -> Vec<StepUpMethod> {
        match enrollment.map(StepUpEnrollment::methods) {
            Some(methods) if !methods.is_empty() => methods,
            _ => StepUpMethod::ALL.to_vec(),
        }
    }

    pub async fn evaluate(
        &self,
        user_id: &str,
        amount: Decimal,
        evidence: &StepUpEvidence,
    ) -> Result<StepUpEvaluation> {
        self.evaluate_at(user_id, amount, evidence, Utc::now()).await
    }

    /// Evaluates the gate at a fixed instant. The first method that verifies
    /// wins; a backup code is only consumed when no other factor passed.
    pub async fn evaluate_at(
        &self,
        user_id: &str,
        amount: Decimal,
        evidence: &StepUpEvidence,
        now: DateTime<Utc>,
    ) -> Result<StepUpEvaluation> {
        let mut context = SecurityVerificationContext {
            user_id: user_id.to_string(),
            amount,
            required_methods: Vec::new(),
            evidence_supplied: evidence.supplied_methods(),
            evaluated_at: now,
        };

        if !self.requires_step_up(amount) {
            return Ok(StepUpEvaluation {
                decision: StepUpDecision::Allowed { satisfied_by: None },
                context,
            });
        }

        let enrollment = self.credentials.enrollment(user_id).await?;
        let methods = Self::challenge_methods(enrollment.as_ref());
        context.required_methods = methods.clone();

        let satisfied_by = match &enrollment {
            Some(enrollment) if !evidence.is_empty() => {
                self.verify(enrollment, amount, evidence, now).await?
            }
            _ => None,
        };

        let decision = match satisfied_by {
            Some(method) => {
                info!(user_id, %amount, method = ?method, "Step-up satisfied");
                StepUpDecision::Allowed {
                    satisfied_by: Some(method),
                }
            }
            None => {
                warn!(
                    user_id,
                    %amount,
                    supplied = ?context.evidence_supplied,
                    "Step-up challenge issued"
                );
                StepUpDecision::ChallengeRequired { methods }
            }
        };

        Ok(StepUpEvaluation { decision, context })
    }

    async fn verify(
        &self,
        enrollment: &StepUpEnrollment,
        amount: Decimal,
        evidence: &StepUpEvidence,
        now: DateTime<Utc>,
    ) -> Result<Option<StepUpMethod>> {
        if let (Some(secret), Some(code)) = (&enrollment.totp_secret, &evidence.totp_code)
            && self.verify_totp(secret, code, now)
        {
            return Ok(Some(StepUpMethod::Totp));
        }

        if let (Some(key), Some(assertion)) = (&enrollment.biometric_key, &evidence.biometric)
            && self.verify_biometric(key, &enrollment.user_id, amount, assertion, now)
        {
            return Ok(Some(StepUpMethod::Biometric));
        }

        if let Some(code) = &evidence.backup_code
            && self
                .credentials
                .consume_backup_code(&enrollment.user_id, &hash_backup_code(code))
                .await?
        {
            return Ok(Some(StepUpMethod::BackupCode));
        }

        Ok(None)
    }

    fn verify_totp(&self, secret: &[u8], code: &str, now: DateTime<Utc>) -> bool {
        let code = code.trim();
        if code.len() != TOTP_DIGITS as usize || !code.chars().all(|c| c.is_ascii_digit()) {
            return false;
        }
        let Ok(timestamp) = u64::try_from(now.timestamp()) else {
            return false;
        };
        let step = self.policy.totp_step_secs.max(1);
        let current = timestamp / step;
        let skew = self.policy.totp_skew_steps;

        let mut matched = false;
        for counter in current.saturating_sub(skew)..=current.saturating_add(skew) {
            let expected = totp_code(secret, counter);
            matched |= bool::from(expected.as_bytes().ct_eq(code.as_bytes()));
        }
        matched
    }

    fn verify_biometric(
        &self,
        key: &[u8; 32],
        user_id: &str,
        amount: Decimal,
        assertion: &BiometricAssertion,
        now: DateTime<Utc>,
    ) -> bool {
        let age = now.timestamp() - assertion.signed_at;
        if age < 0 || age > self.policy.biometric_max_age.num_seconds() {
            warn!(user_id, age, "Stale biometric assertion");
            return false;
        }
        let Ok(verifying_key) = VerifyingKey::from_bytes(key) else {
            return false;
        };
        let Ok(signature_bytes) = hex::decode(&assertion.signature) else {
            return false;
        };
        let Ok(signature) = Signature::from_slice(&signature_bytes) else {
            return false;
        };
        let message = biometric_message(user_id, amount, assertion.signed_at);
        verifying_key.verify(message.as_bytes(), &signature).is_ok()
    }
}
