use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Registration record published by the provider registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderRegistration {
    pub provider_id: String,
    pub registration_number: String,
    pub active: bool,
    pub expires_at: DateTime<Utc>,
}

impl ProviderRegistration {
    pub fn is_current(&self, now: DateTime<Utc>) -> bool {
        self.active && self.expires_at > now
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_registration_currency() {
        let now = Utc::now();
        let mut registration = ProviderRegistration {
            provider_id: "prov-1".into(),
            registration_number: "4050012345".into(),
            active: true,
            expires_at: now + Duration::days(30),
        };
        assert!(registration.is_current(now));

        registration.expires_at = now - Duration::seconds(1);
        assert!(!registration.is_current(now));

        registration.expires_at = now + Duration::days(30);
        registration.active = false;
        assert!(!registration.is_current(now));
    }
}
