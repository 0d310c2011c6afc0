//! Entitlement checker.

use std::fmt;
use std::sync::Arc;
use tracing::{instrument, warn};
use uuid::Uuid;

use super::meter::{checked_amount, UsageMeter};
use crate::error::EngineError;
use crate::models::{Cap, Reservation, Resource, Subscription};
use crate::services::{metrics, Clock, EngineStore};

/// Units left under a cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Remaining {
    Limited(u64),
    Unlimited,
}

impl fmt::Display for Remaining {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Remaining::Limited(n) => write!(f, "{}", n),
            Remaining::Unlimited => write!(f, "unlimited"),
        }
    }
}

/// Outcome of a reservation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,
    pub remaining: Remaining,
}

/// Decides whether a subscription may consume more of a resource.
#[derive(Clone)]
pub struct EntitlementChecker {
    store: Arc<dyn EngineStore>,
    clock: Arc<dyn Clock>,
    meter: UsageMeter,
}

impl EntitlementChecker {
    pub fn new(store: Arc<dyn EngineStore>, clock: Arc<dyn Clock>, meter: UsageMeter) -> Self {
        Self {
            store,
            clock,
            meter,
        }
    }

    /// Reserve `amount` units of `resource`, all or nothing.
    ///
    /// Uncapped resources are always allowed and still metered. Capped
    /// resources go through one conditional increment, so concurrent
    /// requests near the cap can never jointly overshoot it.
    #[instrument(skip(self), fields(subscription_id = %subscription_id, resource = %resource))]
    pub async fn check_and_reserve(
        &self,
        subscription_id: Uuid,
        resource: &Resource,
        amount: i64,
    ) -> Result<Decision, EngineError> {
        let amount = checked_amount(resource, amount)?;
        let subscription = self.load(subscription_id).await?;

        let cap = match subscription.terms.limits.effective_cap(resource) {
            Cap::Unlimited => {
                self.meter
                    .increment(subscription_id, resource, amount as i64)
                    .await?;
                return Ok(Decision {
                    allowed: true,
                    remaining: Remaining::Unlimited,
                });
            }
            Cap::Limited(cap) => cap,
        };

        let reservation = self
            .store
            .increment_within(subscription_id, resource, amount, cap, self.clock.now())
            .await?;

        match reservation {
            Reservation::Granted { total } => {
                metrics::record_usage_increment(resource.as_str(), amount);
                Ok(Decision {
                    allowed: true,
                    remaining: Remaining::Limited(cap.saturating_sub(total)),
                })
            }
            Reservation::Denied { used } => {
                metrics::record_quota_denial(resource.as_str());
                warn!(requested = amount, used = used, cap = cap, "Quota exceeded");
                Ok(Decision {
                    allowed: false,
                    remaining: Remaining::Limited(cap.saturating_sub(used)),
                })
            }
        }
    }

    /// Like `check_and_reserve`, but a refusal is `QuotaExceeded`.
    pub async fn reserve(
        &self,
        subscription_id: Uuid,
        resource: &Resource,
        amount: i64,
    ) -> Result<Remaining, EngineError> {
        let decision = self
            .check_and_reserve(subscription_id, resource, amount)
            .await?;

        if decision.allowed {
            return Ok(decision.remaining);
        }

        let remaining = match decision.remaining {
            Remaining::Limited(n) => n,
            Remaining::Unlimited => u64::MAX,
        };
        Err(EngineError::QuotaExceeded {
            resource: resource.clone(),
            requested: amount.max(0) as u64,
            remaining,
        })
    }

    /// Whether the subscription's plan snapshot enables `feature`.
    pub async fn has_feature(
        &self,
        subscription_id: Uuid,
        feature: &str,
    ) -> Result<bool, EngineError> {
        Ok(self
            .load(subscription_id)
            .await?
            .terms
            .features
            .is_enabled(feature))
    }

    /// The tier name of `feature`, if the plan gives it one.
    pub async fn feature_tier(
        &self,
        subscription_id: Uuid,
        feature: &str,
    ) -> Result<Option<String>, EngineError> {
        Ok(self
            .load(subscription_id)
            .await?
            .terms
            .features
            .tier(feature)
            .map(str::to_string))
    }

    async fn load(&self, subscription_id: Uuid) -> Result<Subscription, EngineError> {
        self.store
            .get_subscription(subscription_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("subscription {}", subscription_id)))
    }
}
