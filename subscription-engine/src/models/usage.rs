//! Usage tracking model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// A metered resource.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Resource {
    Bandwidth,
    ApiCalls,
    MediaAssets,
    Projects,
    Roles,
    Collaborators,
    Webhooks,
    Models,
    Locales,
    Records,
    Custom(String),
}

impl Resource {
    pub fn as_str(&self) -> &str {
        match self {
            Resource::Bandwidth => "bandwidth",
            Resource::ApiCalls => "api_calls",
            Resource::MediaAssets => "media_assets",
            Resource::Projects => "projects",
            Resource::Roles => "roles",
            Resource::Collaborators => "collaborators",
            Resource::Webhooks => "webhooks",
            Resource::Models => "models",
            Resource::Locales => "locales",
            Resource::Records => "records",
            Resource::Custom(key) => key.as_str(),
        }
    }
}

impl From<&str> for Resource {
    fn from(s: &str) -> Self {
        match s {
            "bandwidth" => Resource::Bandwidth,
            "api_calls" => Resource::ApiCalls,
            "media_assets" => Resource::MediaAssets,
            "projects" => Resource::Projects,
            "roles" => Resource::Roles,
            "collaborators" => Resource::Collaborators,
            "webhooks" => Resource::Webhooks,
            "models" => Resource::Models,
            "locales" => Resource::Locales,
            "records" => Resource::Records,
            other => Resource::Custom(other.to_string()),
        }
    }
}

impl From<String> for Resource {
    fn from(s: String) -> Self {
        Resource::from(s.as_str())
    }
}

impl From<Resource> for String {
    fn from(resource: Resource) -> Self {
        resource.as_str().to_string()
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One usage window of a subscription. Counters only grow while the window
/// is open; a closed window is never written again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsagePeriod {
    pub period_id: Uuid,
    pub subscription_id: Uuid,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub closed_utc: Option<DateTime<Utc>>,
    pub counters: BTreeMap<Resource, u64>,
    pub created_utc: DateTime<Utc>,
}

impl UsagePeriod {
    /// Whether the window still accepts increments at `now`.
    pub fn is_open_at(&self, now: DateTime<Utc>) -> bool {
        self.closed_utc.is_none() && now < self.period_end
    }

    pub fn used(&self, resource: &Resource) -> u64 {
        self.counters.get(resource).copied().unwrap_or(0)
    }

    pub fn snapshot(&self) -> UsageSnapshot {
        UsageSnapshot {
            subscription_id: self.subscription_id,
            period_id: self.period_id,
            period_start: self.period_start,
            period_end: self.period_end,
            counters: self.counters.clone(),
        }
    }
}

/// Current counters and bounds of a subscription's open window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageSnapshot {
    pub subscription_id: Uuid,
    pub period_id: Uuid,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub counters: BTreeMap<Resource, u64>,
}

impl UsageSnapshot {
    pub fn used(&self, resource: &Resource) -> u64 {
        self.counters.get(resource).copied().unwrap_or(0)
    }
}

/// Input for opening a usage window.
#[derive(Debug, Clone, PartialEq)]
pub struct NewPeriod {
    pub period_id: Uuid,
    pub subscription_id: Uuid,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
}

impl NewPeriod {
    pub fn new(
        subscription_id: Uuid,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> Self {
        Self {
            period_id: Uuid::new_v4(),
            subscription_id,
            period_start,
            period_end,
        }
    }
}

/// Window bookkeeping committed together with a subscription change.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum PeriodChange {
    #[default]
    Keep,
    Close {
        period_id: Uuid,
        closed_at: DateTime<Utc>,
    },
    Open(NewPeriod),
    Roll {
        period_id: Uuid,
        closed_at: DateTime<Utc>,
        next: NewPeriod,
    },
}

/// Result of a capped increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reservation {
    Granted { total: u64 },
    Denied { used: u64 },
}
