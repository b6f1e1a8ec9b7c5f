use crate::error::{PaymentError, Result};
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Hex HMAC-SHA256 of `payload` under `secret`.
pub fn compute_signature(secret: &str, payload: &[u8]) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).map_err(|e| {
        PaymentError::InternalError(Box::new(std::io::Error::other(format!(
            "invalid webhook secret: {e}"
        ))))
    })?;
    mac.update(payload);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Checks a hex signature in constant time.
pub fn verify_signature(secret: &str, payload: &[u8], provided: &str) -> Result<()> {
    let expected = hex::decode(compute_signature(secret, payload)?)
        .map_err(|e| PaymentError::InternalError(Box::new(e)))?;
    let actual = hex::decode(provided.trim())
        .map_err(|_| PaymentError::InvalidSignature("signature is not hex".to_string()))?;
    if expected.len() != actual.len() || !bool::from(expected.ct_eq(actual.as_slice())) {
        return Err(PaymentError::InvalidSignature(
            "signature mismatch".to_string(),
        ));
    }
    Ok(())
}

/// `"{timestamp}.{body}"`, the payload signed by timestamped schemes.
pub fn timestamped_payload(timestamp: &str, body: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(timestamp.len() + 1 + body.len());
    payload.extend_from_slice(timestamp.as_bytes());
    payload.push(b'.');
    payload.extend_from_slice(body);
    payload
}

pub fn parse_unix_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    raw.trim()
        .parse::<i64>()
        .ok()
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
        .ok_or_else(|| PaymentError::InvalidSignature(format!("malformed timestamp '{raw}'")))
}

/// Rejects events signed outside `tolerance` of `now`, in either direction.
pub fn check_freshness(
    signed_at: DateTime<Utc>,
    now: DateTime<Utc>,
    tolerance: Duration,
) -> Result<()> {
    let skew = (now - signed_at).abs();
    if skew > tolerance {
        return Err(PaymentError::InvalidSignature(format!(
            "timestamp {} is outside the {}s tolerance",
            signed_at.timestamp(),
            tolerance.num_seconds()
        )));
    }
    Ok(())
}
