use super::budget::{Amount, BudgetCategory};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VoucherStatus {
    Active,
    Spent,
    Expired,
}

impl VoucherStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Active)
    }

    /// States from which `target` may be entered. Only ACTIVE has exits.
    pub fn allowed_prior_states(target: Self) -> &'static [Self] {
        match target {
            Self::Active => &[],
            Self::Spent | Self::Expired => &[Self::Active],
        }
    }
}

/// A minted, spendable claim against one budget category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Voucher {
    pub id: String,
    pub category_id: String,
    pub amount: Amount,
    pub status: VoucherStatus,
    /// When set, only this provider may redeem the voucher.
    pub provider_id: Option<String>,
    pub minted_at: DateTime<Utc>,
    pub spent_at: Option<DateTime<Utc>>,
    /// Transaction this voucher backs. Set at initiation and cleared if that
    /// transaction fails; kept once SPENT as the record of who spent it.
    #[serde(default)]
    pub claimed_by: Option<String>,
}

impl Voucher {
    pub fn mint(category_id: impl Into<String>, amount: Amount, provider_id: Option<String>) -> Self {
        Self {
            id: format!("vch_{}", uuid::Uuid::new_v4().simple()),
            category_id: category_id.into(),
            amount,
            status: VoucherStatus::Active,
            provider_id,
            minted_at: Utc::now(),
            spent_at: None,
            claimed_by: None,
        }
    }

    /// Binds an ACTIVE, unclaimed voucher to `tx_id`.
    pub fn claim(&mut self, tx_id: &str) -> bool {
        if self.status != VoucherStatus::Active || self.claimed_by.is_some() {
            return false;
        }
        self.claimed_by = Some(tx_id.to_string());
        true
    }

    /// Frees an ACTIVE voucher still bound to `tx_id`.
    pub fn release_claim(&mut self, tx_id: &str) -> bool {
        if self.status != VoucherStatus::Active || self.claimed_by.as_deref() != Some(tx_id) {
            return false;
        }
        self.claimed_by = None;
        true
    }

    /// Moves the voucher into `target` if the lifecycle permits it.
    ///
    /// Only the transaction holding the claim may spend the voucher, and a
    /// claimed voucher cannot expire underneath its transaction.
    pub fn apply_transition(&mut self, target: VoucherStatus, holder: Option<&str>) -> bool {
        if !VoucherStatus::allowed_prior_states(target).contains(&self.status) {
            return false;
        }
        let permitted = match target {
            VoucherStatus::Spent => holder.is_some() && self.claimed_by.as_deref() == holder,
            VoucherStatus::Expired => self.claimed_by.is_none(),
            VoucherStatus::Active => false,
        };
        if !permitted {
            return false;
        }
        self.status = target;
        if target == VoucherStatus::Spent {
            self.spent_at = Some(Utc::now());
        }
        true
    }
}

/// Answer of an eligibility check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleCheck {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl RuleCheck {
    pub fn allowed() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    pub fn denied(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
        }
    }
}

/// Which service codes a support category may pay for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategoryRule {
    pub category_code: &'static str,
    /// Named service kinds matched exactly, e.g. `personal-care`.
    pub service_kinds: &'static [&'static str],
    /// Support item number prefix, e.g. `02_` for transport items.
    pub item_prefix: &'static str,
}

impl CategoryRule {
    fn admits(&self, service_code: &str) -> bool {
        self.service_kinds.contains(&service_code) || service_code.starts_with(self.item_prefix)
    }
}

const NDIS_RULES: &[CategoryRule] = &[
    CategoryRule {
        category_code: "daily_activities",
        service_kinds: &["personal-care", "domestic-assistance", "meal-preparation"],
        item_prefix: "01_",
    },
    CategoryRule {
        category_code: "transport",
        service_kinds: &["transport", "taxi", "community-transport"],
        item_prefix: "02_",
    },
    CategoryRule {
        category_code: "consumables",
        service_kinds: &["consumables", "continence-aids", "low-cost-assistive-technology"],
        item_prefix: "03_",
    },
    CategoryRule {
        category_code: "social_community",
        service_kinds: &["community-access", "group-activities"],
        item_prefix: "04_",
    },
    CategoryRule {
        category_code: "assistive_technology",
        service_kinds: &["assistive-technology", "equipment-repair"],
        item_prefix: "05_",
    },
    CategoryRule {
        category_code: "home_modifications",
        service_kinds: &["home-modifications"],
        item_prefix: "06_",
    },
    CategoryRule {
        category_code: "support_coordination",
        service_kinds: &["support-coordination"],
        item_prefix: "07_",
    },
    CategoryRule {
        category_code: "capacity_building",
        service_kinds: &["therapy", "skills-development", "plan-management"],
        item_prefix: "15_",
    },
];

/// Static category/service-code eligibility table.
#[derive(Debug, Clone)]
pub struct EligibilityRules {
    rules: &'static [CategoryRule],
}

impl Default for EligibilityRules {
    fn default() -> Self {
        Self { rules: NDIS_RULES }
    }
}

impl EligibilityRules {
    pub fn rule_for(&self, category_code: &str) -> Option<&CategoryRule> {
        self.rules
            .iter()
            .find(|rule| rule.category_code == category_code)
    }

    /// Checks whether `voucher` (drawn on `category`) can pay `service_code`
    /// to `provider_id`. No side effects.
    pub fn check(
        &self,
        voucher: &Voucher,
        category: &BudgetCategory,
        service_code: &str,
        provider_id: &str,
    ) -> RuleCheck {
        if voucher.status != VoucherStatus::Active {
            return RuleCheck::denied(format!("voucher is {:?}", voucher.status));
        }
        if voucher.category_id != category.id {
            return RuleCheck::denied("voucher does not belong to this category");
        }
        if let Some(bound) = &voucher.provider_id
            && bound != provider_id
        {
            return RuleCheck::denied(format!("voucher is bound to provider '{bound}'"));
        }
        self.check_service_code(category, service_code)
    }

    pub fn check_service_code(&self, category: &BudgetCategory, service_code: &str) -> RuleCheck {
        match self.rule_for(&category.category_code) {
            Some(rule) if rule.admits(service_code) => RuleCheck::allowed(),
            Some(_) => RuleCheck::denied(format!(
                "service code '{}' is not eligible for category '{}'",
                service_code, category.category_code
            )),
            None => RuleCheck::denied(format!(
                "no eligibility rule for category '{}'",
                category.category_code
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::budget::Balance;
    use rust_decimal_macros::dec;

    fn transport() -> BudgetCategory {
        BudgetCategory::new("cat-t", "plan-1", "p-1", "transport", Balance(dec!(500)))
    }

    fn voucher_for(category: &BudgetCategory, provider: Option<&str>) -> Voucher {
        Voucher::mint(
            category.id.clone(),
            Amount::new(dec!(50)).unwrap(),
            provider.map(str::to_string),
        )
    }

    #[test]
    fn test_transport_voucher_cannot_pay_personal_care() {
        let rules = EligibilityRules::default();
        let category = transport();
        let voucher = voucher_for(&category, None);

        let check = rules.check(&voucher, &category, "personal-care", "prov-1");
        assert!(!check.allowed);
        assert!(check.reason.unwrap().contains("personal-care"));
    }

    #[test]
    fn test_transport_voucher_pays_transport_item_numbers() {
        let rules = EligibilityRules::default();
        let category = transport();
        let voucher = voucher_for(&category, None);

        assert!(rules.check(&voucher, &category, "transport", "prov-1").allowed);
        assert!(rules.check(&voucher, &category, "02_051_0108_1_1", "prov-1").allowed);
        assert!(!rules.check(&voucher, &category, "01_011_0107_1_1", "prov-1").allowed);
    }

    #[test]
    fn test_provider_bound_voucher() {
        let rules = EligibilityRules::default();
        let category = transport();
        let voucher = voucher_for(&category, Some("prov-1"));

        assert!(rules.check(&voucher, &category, "transport", "prov-1").allowed);
        assert!(!rules.check(&voucher, &category, "transport", "prov-2").allowed);
    }

    #[test]
    fn test_spent_voucher_is_not_eligible() {
        let rules = EligibilityRules::default();
        let category = transport();
        let mut voucher = voucher_for(&category, None);
        voucher.status = VoucherStatus::Spent;

        assert!(!rules.check(&voucher, &category, "transport", "prov-1").allowed);
    }

    #[test]
    fn test_unknown_category_code_is_denied() {
        let rules = EligibilityRules::default();
        let mut category = transport();
        category.category_code = "mystery".to_string();
        let voucher = voucher_for(&category, None);

        assert!(!rules.check(&voucher, &category, "transport", "prov-1").allowed);
    }

    #[test]
    fn test_only_the_claiming_transaction_can_spend() {
        let category = transport();
        let mut voucher = voucher_for(&category, None);

        assert!(!voucher.apply_transition(VoucherStatus::Spent, Some("txn_a")));
        assert!(voucher.claim("txn_a"));
        assert!(!voucher.claim("txn_b"));
        assert!(!voucher.apply_transition(VoucherStatus::Spent, Some("txn_b")));
        assert!(!voucher.apply_transition(VoucherStatus::Expired, None));

        assert!(voucher.apply_transition(VoucherStatus::Spent, Some("txn_a")));
        assert_eq!(voucher.claimed_by.as_deref(), Some("txn_a"));
        assert!(!voucher.release_claim("txn_a"));
    }

    #[test]
    fn test_released_claim_frees_the_voucher() {
        let category = transport();
        let mut voucher = voucher_for(&category, None);
        voucher.claim("txn_a");

        assert!(!voucher.release_claim("txn_b"));
        assert!(voucher.release_claim("txn_a"));
        assert!(voucher.claim("txn_b"));
    }

    #[test]
    fn test_voucher_edges() {
        assert_eq!(
            VoucherStatus::allowed_prior_states(VoucherStatus::Spent),
            &[VoucherStatus::Active]
        );
        assert!(VoucherStatus::allowed_prior_states(VoucherStatus::Active).is_empty());
        assert!(VoucherStatus::Expired.is_terminal());
    }
}
