//! Plan catalog model.

use chrono::{DateTime, Datelike, Months, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

use super::usage::Resource;

/// Billing cycle for plans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum BillingCycle {
    Monthly,
    Yearly,
}

impl BillingCycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingCycle::Monthly => "monthly",
            BillingCycle::Yearly => "yearly",
        }
    }

    pub fn from_string(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "monthly" => Some(BillingCycle::Monthly),
            "yearly" | "annually" => Some(BillingCycle::Yearly),
            _ => None,
        }
    }

    fn months(&self) -> u32 {
        match self {
            BillingCycle::Monthly => 1,
            BillingCycle::Yearly => 12,
        }
    }

    /// Advance `from` by one cycle, landing on `anchor_day` or the last day
    /// of the target month when the month is shorter.
    ///
    /// Anchoring keeps a Jan 31 subscription on Feb 29, then Mar 31, instead
    /// of drifting to the 29th for the rest of its life.
    pub fn advance(&self, from: DateTime<Utc>, anchor_day: u32) -> DateTime<Utc> {
        let stepped = from
            .checked_add_months(Months::new(self.months()))
            .unwrap_or(from);
        let day = anchor_day.clamp(1, 31).min(last_day_of_month(stepped.year(), stepped.month()));
        stepped.with_day(day).unwrap_or(stepped)
    }
}

impl fmt::Display for BillingCycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

fn last_day_of_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .and_then(|first| first.pred_opt())
        .map(|last| last.day())
        .unwrap_or(28)
}

/// A numeric resource cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cap {
    Limited(u64),
    Unlimited,
}

impl Cap {
    /// Units still available after `used`, `None` when unlimited.
    pub fn remaining(&self, used: u64) -> Option<u64> {
        match self {
            Cap::Limited(cap) => Some(cap.saturating_sub(used)),
            Cap::Unlimited => None,
        }
    }

    fn from_raw(value: Option<u64>) -> Self {
        value.map(Cap::Limited).unwrap_or(Cap::Unlimited)
    }

    fn to_raw(self) -> Option<u64> {
        match self {
            Cap::Limited(cap) => Some(cap),
            Cap::Unlimited => None,
        }
    }
}

/// Resource caps of a plan.
///
/// Stored as an open `resource -> integer | null` map; parsed into named
/// fields for the metered resources the engine knows about, with unknown keys
/// kept in `extra`. A key that is present with `null` is unlimited; a key that
/// is absent is unset and may be filled from configured defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "BTreeMap<String, Option<u64>>", into = "BTreeMap<String, Option<u64>>")]
pub struct PlanLimits {
    pub bandwidth: Option<Cap>,
    pub api_calls: Option<Cap>,
    pub media_assets: Option<Cap>,
    pub projects: Option<Cap>,
    pub roles: Option<Cap>,
    pub collaborators: Option<Cap>,
    pub webhooks: Option<Cap>,
    pub models: Option<Cap>,
    pub locales: Option<Cap>,
    pub records: Option<Cap>,
    pub extra: BTreeMap<String, Cap>,
}

impl PlanLimits {
    /// The configured cap for `resource`, `None` when the plan does not mention it.
    pub fn cap(&self, resource: &Resource) -> Option<Cap> {
        match resource {
            Resource::Bandwidth => self.bandwidth,
            Resource::ApiCalls => self.api_calls,
            Resource::MediaAssets => self.media_assets,
            Resource::Projects => self.projects,
            Resource::Roles => self.roles,
            Resource::Collaborators => self.collaborators,
            Resource::Webhooks => self.webhooks,
            Resource::Models => self.models,
            Resource::Locales => self.locales,
            Resource::Records => self.records,
            Resource::Custom(key) => self.extra.get(key).copied(),
        }
    }

    /// The cap enforced for `resource`; unset resources are unlimited.
    pub fn effective_cap(&self, resource: &Resource) -> Cap {
        self.cap(resource).unwrap_or(Cap::Unlimited)
    }

    pub fn set(&mut self, resource: Resource, cap: Cap) {
        let slot = match resource {
            Resource::Bandwidth => &mut self.bandwidth,
            Resource::ApiCalls => &mut self.api_calls,
            Resource::MediaAssets => &mut self.media_assets,
            Resource::Projects => &mut self.projects,
            Resource::Roles => &mut self.roles,
            Resource::Collaborators => &mut self.collaborators,
            Resource::Webhooks => &mut self.webhooks,
            Resource::Models => &mut self.models,
            Resource::Locales => &mut self.locales,
            Resource::Records => &mut self.records,
            Resource::Custom(key) => {
                self.extra.insert(key, cap);
                return;
            }
        };
        *slot = Some(cap);
    }

    pub fn with(mut self, resource: Resource, cap: Cap) -> Self {
        self.set(resource, cap);
        self
    }

    /// Fill every unset resource from `defaults`. Explicit caps win.
    pub fn with_defaults(&self, defaults: &PlanLimits) -> PlanLimits {
        let mut merged = defaults.clone();
        for (resource, cap) in self.entries() {
            merged.set(resource, cap);
        }
        merged
    }

    /// All configured caps.
    pub fn entries(&self) -> Vec<(Resource, Cap)> {
        let named = [
            (Resource::Bandwidth, self.bandwidth),
            (Resource::ApiCalls, self.api_calls),
            (Resource::MediaAssets, self.media_assets),
            (Resource::Projects, self.projects),
            (Resource::Roles, self.roles),
            (Resource::Collaborators, self.collaborators),
            (Resource::Webhooks, self.webhooks),
            (Resource::Models, self.models),
            (Resource::Locales, self.locales),
            (Resource::Records, self.records),
        ];
        named
            .into_iter()
            .filter_map(|(resource, cap)| cap.map(|c| (resource, c)))
            .chain(
                self.extra
                    .iter()
                    .map(|(key, cap)| (Resource::Custom(key.clone()), *cap)),
            )
            .collect()
    }
}

impl From<BTreeMap<String, Option<u64>>> for PlanLimits {
    fn from(raw: BTreeMap<String, Option<u64>>) -> Self {
        let mut limits = PlanLimits::default();
        for (key, value) in raw {
            limits.set(Resource::from(key.as_str()), Cap::from_raw(value));
        }
        limits
    }
}

impl From<PlanLimits> for BTreeMap<String, Option<u64>> {
    fn from(limits: PlanLimits) -> Self {
        limits
            .entries()
            .into_iter()
            .map(|(resource, cap)| (resource.as_str().to_string(), cap.to_raw()))
            .collect()
    }
}

/// Value of a feature flag: either on/off or a named tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FeatureValue {
    Flag(bool),
    Tier(String),
}

/// Feature flags of a plan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlanFeatures(pub BTreeMap<String, FeatureValue>);

impl PlanFeatures {
    pub fn with_flag(mut self, name: &str, enabled: bool) -> Self {
        self.0.insert(name.to_string(), FeatureValue::Flag(enabled));
        self
    }

    pub fn with_tier(mut self, name: &str, tier: &str) -> Self {
        self.0
            .insert(name.to_string(), FeatureValue::Tier(tier.to_string()));
        self
    }

    pub fn is_enabled(&self, name: &str) -> bool {
        match self.0.get(name) {
            Some(FeatureValue::Flag(enabled)) => *enabled,
            Some(FeatureValue::Tier(tier)) => !tier.is_empty(),
            None => false,
        }
    }

    pub fn tier(&self, name: &str) -> Option<&str> {
        match self.0.get(name) {
            Some(FeatureValue::Tier(tier)) => Some(tier.as_str()),
            _ => None,
        }
    }
}

/// Billing plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub plan_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub price: Decimal,
    pub currency: String,
    pub billing_cycle: BillingCycle,
    pub features: PlanFeatures,
    pub limits: PlanLimits,
    pub is_active: bool,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

/// The economically relevant part of a plan, captured when a subscription
/// starts. Later plan edits never touch a captured snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanTerms {
    pub plan_id: Uuid,
    pub plan_name: String,
    pub price: Decimal,
    pub currency: String,
    pub billing_cycle: BillingCycle,
    pub limits: PlanLimits,
    pub features: PlanFeatures,
}

/// Input for creating a plan.
#[derive(Debug, Clone)]
pub struct CreatePlan {
    pub name: String,
    pub description: Option<String>,
    pub price: Decimal,
    pub currency: String,
    pub billing_cycle: BillingCycle,
    pub features: PlanFeatures,
    pub limits: PlanLimits,
}

/// Input for updating a plan.
#[derive(Debug, Clone, Default)]
pub struct UpdatePlan {
    pub name: Option<String>,
    pub description: Option<String>,
    pub price: Option<Decimal>,
    pub features: Option<PlanFeatures>,
    pub limits: Option<PlanLimits>,
}

/// Filter parameters for listing plans.
#[derive(Debug, Clone, Default)]
pub struct ListPlansFilter {
    pub include_inactive: bool,
    pub page_size: i32,
    pub page_token: Option<Uuid>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
    }

    #[test]
    fn monthly_clamps_then_returns_to_anchor() {
        let feb = BillingCycle::Monthly.advance(at(2024, 1, 31), 31);
        assert_eq!(feb, at(2024, 2, 29));
        let mar = BillingCycle::Monthly.advance(feb, 31);
        assert_eq!(mar, at(2024, 3, 31));
    }

    #[test]
    fn monthly_rolls_over_year_end() {
        assert_eq!(
            BillingCycle::Monthly.advance(at(2023, 12, 15), 15),
            at(2024, 1, 15)
        );
    }

    #[test]
    fn yearly_handles_leap_day() {
        assert_eq!(
            BillingCycle::Yearly.advance(at(2024, 2, 29), 29),
            at(2025, 2, 28)
        );
    }

    #[test]
    fn limits_distinguish_null_from_absent() {
        let limits: PlanLimits =
            serde_json::from_str(r#"{"api_calls": 1000, "projects": null, "seats": 5}"#).unwrap();

        assert_eq!(limits.cap(&Resource::ApiCalls), Some(Cap::Limited(1000)));
        assert_eq!(limits.cap(&Resource::Projects), Some(Cap::Unlimited));
        assert_eq!(limits.cap(&Resource::Webhooks), None);
        assert_eq!(
            limits.cap(&Resource::Custom("seats".to_string())),
            Some(Cap::Limited(5))
        );
    }

    #[test]
    fn negative_limits_are_rejected() {
        let parsed = serde_json::from_str::<PlanLimits>(r#"{"api_calls": -1}"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn defaults_fill_only_unset_resources() {
        let plan = PlanLimits::default()
            .with(Resource::ApiCalls, Cap::Limited(10))
            .with(Resource::Projects, Cap::Unlimited);
        let defaults = PlanLimits::default()
            .with(Resource::ApiCalls, Cap::Limited(99))
            .with(Resource::Projects, Cap::Limited(3))
            .with(Resource::Locales, Cap::Limited(2));

        let merged = plan.with_defaults(&defaults);

        assert_eq!(merged.effective_cap(&Resource::ApiCalls), Cap::Limited(10));
        assert_eq!(merged.effective_cap(&Resource::Projects), Cap::Unlimited);
        assert_eq!(merged.effective_cap(&Resource::Locales), Cap::Limited(2));
        assert_eq!(merged.effective_cap(&Resource::Records), Cap::Unlimited);
    }

    #[test]
    fn features_accept_flags_and_tiers() {
        let features: PlanFeatures =
            serde_json::from_str(r#"{"sso": true, "support": "priority", "audit": false}"#)
                .unwrap();

        assert!(features.is_enabled("sso"));
        assert!(features.is_enabled("support"));
        assert!(!features.is_enabled("audit"));
        assert!(!features.is_enabled("missing"));
        assert_eq!(features.tier("support"), Some("priority"));
    }
}
