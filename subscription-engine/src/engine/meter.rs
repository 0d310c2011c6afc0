//! Usage meter.

use std::sync::Arc;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::error::EngineError;
use crate::models::{Resource, UsagePeriod, UsageSnapshot};
use crate::services::{metrics, Clock, EngineStore};

/// Accumulates per-period counters for a subscription.
///
/// Counters only move forward inside a period. Every increment is a single
/// conditional write at the store, so concurrent callers never lose updates.
#[derive(Clone)]
pub struct UsageMeter {
    store: Arc<dyn EngineStore>,
    clock: Arc<dyn Clock>,
}

impl UsageMeter {
    pub fn new(store: Arc<dyn EngineStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Add `amount` to `resource` in the current period and return the new
    /// total.
    #[instrument(skip(self), fields(subscription_id = %subscription_id, resource = %resource))]
    pub async fn increment(
        &self,
        subscription_id: Uuid,
        resource: &Resource,
        amount: i64,
    ) -> Result<u64, EngineError> {
        let amount = checked_amount(resource, amount)?;

        let total = self
            .store
            .increment(subscription_id, resource, amount, self.clock.now())
            .await?;

        metrics::record_usage_increment(resource.as_str(), amount);
        debug!(amount = amount, total = total, "Usage incremented");

        Ok(total)
    }

    /// Counters and bounds of the current period.
    #[instrument(skip(self), fields(subscription_id = %subscription_id))]
    pub async fn current_usage(&self, subscription_id: Uuid) -> Result<UsageSnapshot, EngineError> {
        let now = self.clock.now();
        self.store
            .open_period(subscription_id)
            .await?
            .filter(|p| p.is_open_at(now))
            .map(|p| p.snapshot())
            .ok_or(EngineError::NoActivePeriod { subscription_id })
    }

    /// Every period of the subscription, oldest first.
    pub async fn history(&self, subscription_id: Uuid) -> Result<Vec<UsagePeriod>, EngineError> {
        self.store.list_periods(subscription_id).await
    }
}

/// Counters never decrease; corrections belong in the next period's cap.
pub(crate) fn checked_amount(resource: &Resource, amount: i64) -> Result<u64, EngineError> {
    u64::try_from(amount).map_err(|_| {
        EngineError::Validation(format!(
            "usage amount for {} must not be negative, got {}",
            resource, amount
        ))
    })
}
