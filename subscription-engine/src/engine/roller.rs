//! Period roller.
//!
//! Closes usage windows whose end has passed and opens the next one. When a
//! window boundary coincides with a payment date the roll goes through the
//! renewal flow, so a new paid window only opens once the payment is PAID.
//! Runs on a schedule via [`spawn`] and lazily from the request path.

use chrono::{DateTime, Datelike, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::lifecycle::SubscriptionLifecycle;
use crate::error::EngineError;
use crate::models::{NewPeriod, PeriodChange, Subscription, SubscriptionStatus, UsagePeriod};
use crate::services::{metrics, Clock, EngineStore};

/// Upper bound on windows opened by one call when a subscription has been
/// idle for several windows.
const MAX_CATCH_UP: usize = 36;

/// Counts from one scheduled pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RollSummary {
    pub processed: usize,
    pub rolled: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct PeriodRoller {
    store: Arc<dyn EngineStore>,
    clock: Arc<dyn Clock>,
    lifecycle: SubscriptionLifecycle,
}

impl PeriodRoller {
    pub fn new(
        store: Arc<dyn EngineStore>,
        clock: Arc<dyn Clock>,
        lifecycle: SubscriptionLifecycle,
    ) -> Self {
        Self {
            store,
            clock,
            lifecycle,
        }
    }

    /// Bring one subscription's windows up to date. Returns whether a new
    /// window was opened by this call.
    ///
    /// Safe to run concurrently for the same subscription: a window is only
    /// closed by a conditional write, so a losing caller sees a conflict and
    /// backs off without touching anything.
    #[instrument(skip(self), fields(subscription_id = %subscription_id))]
    pub async fn roll_if_due(&self, subscription_id: Uuid) -> Result<bool, EngineError> {
        match self.roll(subscription_id).await {
            Err(EngineError::ConcurrencyConflict(what)) => {
                metrics::record_period_roll("conflict");
                debug!(conflict = %what, "Roll already done by another worker");
                Ok(false)
            }
            other => other,
        }
    }

    /// Roll every subscription that has a payment due or an ended window,
    /// up to `limit`. A failure on one subscription does not stop the pass.
    #[instrument(skip(self))]
    pub async fn roll_due(&self, limit: i64) -> Result<RollSummary, EngineError> {
        let now = self.clock.now();
        let candidates = self.store.list_roll_candidates(now, limit).await?;

        let mut summary = RollSummary::default();
        for subscription_id in candidates {
            summary.processed += 1;
            match self.roll_if_due(subscription_id).await {
                Ok(true) => summary.rolled += 1,
                Ok(false) => {}
                Err(e) => {
                    summary.failed += 1;
                    metrics::record_error(e.kind(), "roll_due");
                    warn!(subscription_id = %subscription_id, error = %e, "Failed to roll subscription");
                }
            }
        }

        if summary.processed > 0 {
            info!(
                processed = summary.processed,
                rolled = summary.rolled,
                failed = summary.failed,
                "Roll pass finished"
            );
        }

        Ok(summary)
    }

    async fn roll(&self, subscription_id: Uuid) -> Result<bool, EngineError> {
        let subscription = self.lifecycle.get_subscription(subscription_id).await?;
        let now = self.clock.now();

        let due = subscription.status.is_live()
            && subscription.next_payment_date.is_some_and(|due| due <= now);
        if due {
            if subscription.auto_renew {
                let outcome = self.lifecycle.renew(&subscription).await?;
                metrics::record_period_roll(if outcome.renewed { "renewed" } else { "past_due" });
                return Ok(outcome.renewed && !outcome.replayed);
            }
            let outcome = self.lifecycle.lapse_term(&subscription).await?;
            if !outcome.replayed {
                metrics::record_period_roll("lapsed");
            }
            return Ok(false);
        }

        let access_until = access_until(&subscription);
        match self.store.open_period(subscription_id).await? {
            Some(open) if open.period_end <= now => {
                self.continue_period(&subscription, open, access_until, now)
                    .await
            }
            Some(_) => Ok(false),
            None => match access_until.filter(|until| *until > now) {
                Some(until) => {
                    let end = subscription
                        .terms
                        .billing_cycle
                        .advance(now, now.day())
                        .min(until);
                    let period = NewPeriod::new(subscription_id, now, end);
                    self.store
                        .apply_period_change(subscription_id, &PeriodChange::Open(period))
                        .await?;
                    metrics::record_period_roll("reopened");
                    info!(period_end = %end, "Opened missing usage period");
                    Ok(true)
                }
                None => Ok(false),
            },
        }
    }

    /// Replace an ended window with the ones that follow it, without a
    /// payment, until a window covers `now` or access runs out.
    async fn continue_period(
        &self,
        subscription: &Subscription,
        ended: UsagePeriod,
        access_until: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<bool, EngineError> {
        let subscription_id = subscription.subscription_id;
        let cycle = subscription.terms.billing_cycle;
        let mut current = ended.period_id;
        let mut start = ended.period_end;
        let mut rolled = false;

        for _ in 0..MAX_CATCH_UP {
            let Some(until) = access_until.filter(|until| *until > start) else {
                self.store
                    .apply_period_change(
                        subscription_id,
                        &PeriodChange::Close {
                            period_id: current,
                            closed_at: now,
                        },
                    )
                    .await?;
                metrics::record_period_roll("closed");
                debug!(period_id = %current, "Closed ended usage period");
                return Ok(rolled);
            };

            let end = cycle.advance(start, start.day()).min(until);
            let next = NewPeriod::new(subscription_id, start, end);
            let next_id = next.period_id;
            self.store
                .apply_period_change(
                    subscription_id,
                    &PeriodChange::Roll {
                        period_id: current,
                        closed_at: now,
                        next,
                    },
                )
                .await?;
            metrics::record_period_roll("continued");
            debug!(period_start = %start, period_end = %end, "Continued usage period");
            rolled = true;

            if end > now {
                break;
            }
            current = next_id;
            start = end;
        }

        Ok(rolled)
    }
}

/// Last instant the subscription may meter usage without another payment.
fn access_until(subscription: &Subscription) -> Option<DateTime<Utc>> {
    match subscription.status {
        SubscriptionStatus::Trial | SubscriptionStatus::Active => subscription.next_payment_date,
        SubscriptionStatus::Cancelled => subscription.end_date,
        SubscriptionStatus::Expired => None,
    }
}

/// Run `roll_due` every `tick` until the task is aborted.
pub fn spawn(roller: PeriodRoller, tick: Duration, batch_size: i64) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(tick);
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(err) = roller.roll_due(batch_size).await {
                metrics::record_error(err.kind(), "roll_due");
                warn!(error = %err, "Period roll tick failed");
            }
        }
    })
}
