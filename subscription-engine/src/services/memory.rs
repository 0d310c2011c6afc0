//! In-memory store.
//!
//! All state sits behind one mutex, so each trait call is a single critical
//! section and gives the same atomicity the Postgres store gets from
//! conditional updates. Useful for tests and single-process embedding.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use crate::error::EngineError;
use crate::models::{
    AttemptResolution, BillingEntry, IdempotencyToken, ListPlansFilter, ListSubscriptionsFilter,
    NewBillingEntry, NewPeriod, Owner, PaymentStatus, PeriodChange, Plan, Reservation, Resource,
    ResolveOutcome, Subscription, TransitionAction, TransitionRecord, UpdatePlan, UsagePeriod,
};
use crate::services::store::{
    AtomicCounterStore, LedgerStore, PlanStore, SubscriptionStore, TransitionCommit,
};

#[derive(Default)]
struct State {
    plans: BTreeMap<Uuid, Plan>,
    subscriptions: BTreeMap<Uuid, Subscription>,
    transitions: HashMap<(Uuid, String), TransitionRecord>,
    periods: BTreeMap<Uuid, UsagePeriod>,
    ledger: BTreeMap<Uuid, BillingEntry>,
    attempt_keys: HashMap<(Uuid, String), Uuid>,
}

impl State {
    fn open_period_of(&self, subscription_id: Uuid) -> Option<&UsagePeriod> {
        self.periods
            .values()
            .find(|p| p.subscription_id == subscription_id && p.closed_utc.is_none())
    }

    fn active_period_mut(
        &mut self,
        subscription_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<&mut UsagePeriod, EngineError> {
        self.periods
            .values_mut()
            .find(|p| p.subscription_id == subscription_id && p.is_open_at(now))
            .ok_or(EngineError::NoActivePeriod { subscription_id })
    }

    fn has_live_subscription(&self, owner: &Owner) -> bool {
        self.subscriptions
            .values()
            .any(|s| s.owner == *owner && s.status.is_live())
    }

    /// Validate a period change without touching state.
    fn check_period_change(
        &self,
        subscription_id: Uuid,
        change: &PeriodChange,
    ) -> Result<(), EngineError> {
        let closing = match change {
            PeriodChange::Keep => return Ok(()),
            PeriodChange::Close { period_id, .. } | PeriodChange::Roll { period_id, .. } => {
                Some(*period_id)
            }
            PeriodChange::Open(_) => None,
        };

        if let Some(period_id) = closing {
            match self.periods.get(&period_id) {
                Some(p) if p.subscription_id == subscription_id && p.closed_utc.is_none() => {}
                _ => {
                    return Err(EngineError::ConcurrencyConflict(format!(
                        "usage period {}",
                        period_id
                    )))
                }
            }
        }

        let opening = match change {
            PeriodChange::Open(next) | PeriodChange::Roll { next, .. } => next,
            _ => return Ok(()),
        };

        let clash = self.periods.values().any(|p| {
            p.subscription_id == subscription_id
                && (p.period_id == opening.period_id
                    || (p.closed_utc.is_none() && Some(p.period_id) != closing))
        });
        if clash {
            return Err(EngineError::ConcurrencyConflict(format!(
                "usage periods of subscription {}",
                subscription_id
            )));
        }

        Ok(())
    }

    fn apply_period_change(&mut self, change: &PeriodChange, now: DateTime<Utc>) {
        match change {
            PeriodChange::Keep => {}
            PeriodChange::Close {
                period_id,
                closed_at,
            } => self.close_period(*period_id, *closed_at),
            PeriodChange::Open(next) => self.insert_period(next, now),
            PeriodChange::Roll {
                period_id,
                closed_at,
                next,
            } => {
                self.close_period(*period_id, *closed_at);
                self.insert_period(next, now);
            }
        }
    }

    fn close_period(&mut self, period_id: Uuid, closed_at: DateTime<Utc>) {
        if let Some(period) = self.periods.get_mut(&period_id) {
            period.closed_utc = Some(closed_at);
            period.period_end = period.period_end.min(closed_at).max(period.period_start);
        }
    }

    fn insert_period(&mut self, next: &NewPeriod, now: DateTime<Utc>) {
        self.periods.insert(
            next.period_id,
            UsagePeriod {
                period_id: next.period_id,
                subscription_id: next.subscription_id,
                period_start: next.period_start,
                period_end: next.period_end,
                closed_utc: None,
                counters: BTreeMap::new(),
                created_utc: now,
            },
        );
    }
}

/// Mutex-guarded store implementing every storage trait.
#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<State>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, EngineError> {
        self.state
            .lock()
            .map_err(|_| EngineError::Storage(anyhow::anyhow!("Failed to lock in-memory store")))
    }
}

fn page_size(requested: i32) -> usize {
    requested.clamp(1, 100) as usize
}

#[async_trait]
impl PlanStore for InMemoryStore {
    async fn insert_plan(&self, plan: &Plan) -> Result<Plan, EngineError> {
        let mut state = self.lock()?;
        if state.plans.contains_key(&plan.plan_id) {
            return Err(EngineError::Validation(format!(
                "plan {} already exists",
                plan.plan_id
            )));
        }
        state.plans.insert(plan.plan_id, plan.clone());
        Ok(plan.clone())
    }

    async fn get_plan(&self, plan_id: Uuid) -> Result<Option<Plan>, EngineError> {
        Ok(self.lock()?.plans.get(&plan_id).cloned())
    }

    async fn list_plans(&self, filter: &ListPlansFilter) -> Result<Vec<Plan>, EngineError> {
        let state = self.lock()?;
        Ok(state
            .plans
            .values()
            .filter(|p| filter.include_inactive || p.is_active)
            .filter(|p| filter.page_token.is_none_or(|cursor| p.plan_id > cursor))
            .take(page_size(filter.page_size))
            .cloned()
            .collect())
    }

    async fn update_plan(
        &self,
        plan_id: Uuid,
        input: &UpdatePlan,
        now: DateTime<Utc>,
    ) -> Result<Option<Plan>, EngineError> {
        let mut state = self.lock()?;
        let Some(plan) = state.plans.get_mut(&plan_id) else {
            return Ok(None);
        };

        if let Some(name) = &input.name {
            plan.name = name.clone();
        }
        if let Some(description) = &input.description {
            plan.description = Some(description.clone());
        }
        if let Some(price) = input.price {
            plan.price = price;
        }
        if let Some(features) = &input.features {
            plan.features = features.clone();
        }
        if let Some(limits) = &input.limits {
            plan.limits = limits.clone();
        }
        plan.updated_utc = now;

        Ok(Some(plan.clone()))
    }

    async fn set_plan_active(
        &self,
        plan_id: Uuid,
        is_active: bool,
        now: DateTime<Utc>,
    ) -> Result<Option<Plan>, EngineError> {
        let mut state = self.lock()?;
        Ok(state.plans.get_mut(&plan_id).map(|plan| {
            plan.is_active = is_active;
            plan.updated_utc = now;
            plan.clone()
        }))
    }
}

#[async_trait]
impl SubscriptionStore for InMemoryStore {
    async fn create_subscription(
        &self,
        subscription: &Subscription,
        first_period: &NewPeriod,
        token: &IdempotencyToken,
    ) -> Result<Subscription, EngineError> {
        let mut state = self.lock()?;
        let key = (subscription.subscription_id, token.as_str().to_string());

        if state.transitions.contains_key(&key)
            || state
                .subscriptions
                .contains_key(&subscription.subscription_id)
        {
            return Err(EngineError::DuplicateEvent {
                token: token.to_string(),
            });
        }
        if state.has_live_subscription(&subscription.owner) {
            return Err(EngineError::OwnerAlreadySubscribed(
                subscription.owner.to_string(),
            ));
        }

        let now = subscription.created_utc;
        state
            .subscriptions
            .insert(subscription.subscription_id, subscription.clone());
        state.insert_period(first_period, now);
        state.transitions.insert(
            key,
            TransitionRecord {
                subscription_id: subscription.subscription_id,
                token: token.clone(),
                action: TransitionAction::StartTrial,
                from_status: None,
                snapshot: subscription.clone(),
                recorded_utc: now,
            },
        );

        Ok(subscription.clone())
    }

    async fn get_subscription(
        &self,
        subscription_id: Uuid,
    ) -> Result<Option<Subscription>, EngineError> {
        Ok(self.lock()?.subscriptions.get(&subscription_id).cloned())
    }

    async fn find_live_subscription(
        &self,
        owner: &Owner,
    ) -> Result<Option<Subscription>, EngineError> {
        Ok(self
            .lock()?
            .subscriptions
            .values()
            .find(|s| s.owner == *owner && s.status.is_live())
            .cloned())
    }

    async fn list_subscriptions(
        &self,
        filter: &ListSubscriptionsFilter,
    ) -> Result<Vec<Subscription>, EngineError> {
        let state = self.lock()?;
        Ok(state
            .subscriptions
            .values()
            .filter(|s| filter.owner.is_none_or(|owner| s.owner == owner))
            .filter(|s| filter.status.is_none_or(|status| s.status == status))
            .filter(|s| filter.plan_id.is_none_or(|plan_id| s.plan_id == plan_id))
            .filter(|s| filter.page_token.is_none_or(|cursor| s.subscription_id > cursor))
            .take(page_size(filter.page_size))
            .cloned()
            .collect())
    }

    async fn commit_transition(
        &self,
        commit: &TransitionCommit,
    ) -> Result<Subscription, EngineError> {
        let mut state = self.lock()?;
        let subscription_id = commit.next.subscription_id;
        let key = (subscription_id, commit.token.as_str().to_string());

        if state.transitions.contains_key(&key) {
            return Err(EngineError::DuplicateEvent {
                token: commit.token.to_string(),
            });
        }

        let current = state
            .subscriptions
            .get(&subscription_id)
            .ok_or_else(|| EngineError::NotFound(format!("subscription {}", subscription_id)))?;
        if current.version != commit.expected_version {
            return Err(EngineError::ConcurrencyConflict(format!(
                "subscription {}",
                subscription_id
            )));
        }

        state.check_period_change(subscription_id, &commit.period)?;
        state.apply_period_change(&commit.period, commit.at);

        let mut next = commit.next.clone();
        next.version = commit.expected_version + 1;
        next.updated_utc = commit.at;
        state.subscriptions.insert(subscription_id, next.clone());
        state.transitions.insert(
            key,
            TransitionRecord {
                subscription_id,
                token: commit.token.clone(),
                action: commit.action,
                from_status: Some(commit.from_status),
                snapshot: next.clone(),
                recorded_utc: commit.at,
            },
        );

        Ok(next)
    }

    async fn find_transition(
        &self,
        subscription_id: Uuid,
        token: &IdempotencyToken,
    ) -> Result<Option<TransitionRecord>, EngineError> {
        Ok(self
            .lock()?
            .transitions
            .get(&(subscription_id, token.as_str().to_string()))
            .cloned())
    }

    async fn list_roll_candidates(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Uuid>, EngineError> {
        let state = self.lock()?;
        let limit = usize::try_from(limit.max(0)).unwrap_or(usize::MAX);
        Ok(state
            .subscriptions
            .values()
            .filter(|s| {
                let renewal_due =
                    s.status.is_live() && s.next_payment_date.is_some_and(|due| due <= now);
                let period_ended = state
                    .open_period_of(s.subscription_id)
                    .is_some_and(|p| p.period_end <= now);
                renewal_due || period_ended
            })
            .map(|s| s.subscription_id)
            .take(limit)
            .collect())
    }
}

#[async_trait]
impl AtomicCounterStore for InMemoryStore {
    async fn open_period(&self, subscription_id: Uuid) -> Result<Option<UsagePeriod>, EngineError> {
        Ok(self.lock()?.open_period_of(subscription_id).cloned())
    }

    async fn list_periods(&self, subscription_id: Uuid) -> Result<Vec<UsagePeriod>, EngineError> {
        let state = self.lock()?;
        let mut periods: Vec<UsagePeriod> = state
            .periods
            .values()
            .filter(|p| p.subscription_id == subscription_id)
            .cloned()
            .collect();
        periods.sort_by_key(|p| p.period_start);
        Ok(periods)
    }

    async fn apply_period_change(
        &self,
        subscription_id: Uuid,
        change: &PeriodChange,
    ) -> Result<(), EngineError> {
        let mut state = self.lock()?;
        state.check_period_change(subscription_id, change)?;
        let now = match change {
            PeriodChange::Close { closed_at, .. } | PeriodChange::Roll { closed_at, .. } => {
                *closed_at
            }
            PeriodChange::Open(next) => next.period_start,
            PeriodChange::Keep => return Ok(()),
        };
        state.apply_period_change(change, now);
        Ok(())
    }

    async fn increment(
        &self,
        subscription_id: Uuid,
        resource: &Resource,
        amount: u64,
        now: DateTime<Utc>,
    ) -> Result<u64, EngineError> {
        let mut state = self.lock()?;
        let period = state.active_period_mut(subscription_id, now)?;
        let counter = period.counters.entry(resource.clone()).or_insert(0);
        *counter = counter
            .checked_add(amount)
            .ok_or_else(|| EngineError::Validation(format!("counter {} overflow", resource)))?;
        Ok(*counter)
    }

    async fn increment_within(
        &self,
        subscription_id: Uuid,
        resource: &Resource,
        amount: u64,
        cap: u64,
        now: DateTime<Utc>,
    ) -> Result<Reservation, EngineError> {
        let mut state = self.lock()?;
        let period = state.active_period_mut(subscription_id, now)?;
        let used = period.used(resource);

        match used.checked_add(amount) {
            Some(total) if total <= cap => {
                period.counters.insert(resource.clone(), total);
                Ok(Reservation::Granted { total })
            }
            _ => Ok(Reservation::Denied { used }),
        }
    }
}

#[async_trait]
impl LedgerStore for InMemoryStore {
    async fn record_attempt(
        &self,
        entry: &NewBillingEntry,
        now: DateTime<Utc>,
    ) -> Result<BillingEntry, EngineError> {
        let mut state = self.lock()?;
        let key = (entry.subscription_id, entry.attempt_key.clone());

        if let Some(existing) = state
            .attempt_keys
            .get(&key)
            .and_then(|id| state.ledger.get(id))
        {
            return Ok(existing.clone());
        }

        let row = BillingEntry {
            billing_history_id: Uuid::new_v4(),
            subscription_id: entry.subscription_id,
            attempt_key: entry.attempt_key.clone(),
            plan_name: entry.plan_name.clone(),
            amount: entry.amount,
            currency: entry.currency.clone(),
            status: PaymentStatus::Pending,
            paid_at: None,
            payment_method: entry.payment_method.clone(),
            payment_reference: None,
            invoice_reference: entry.invoice_reference.clone(),
            created_utc: now,
            resolved_utc: None,
        };
        state.attempt_keys.insert(key, row.billing_history_id);
        state.ledger.insert(row.billing_history_id, row.clone());

        Ok(row)
    }

    async fn get_entry(
        &self,
        billing_history_id: Uuid,
    ) -> Result<Option<BillingEntry>, EngineError> {
        Ok(self.lock()?.ledger.get(&billing_history_id).cloned())
    }

    async fn resolve_attempt(
        &self,
        billing_history_id: Uuid,
        resolution: &AttemptResolution,
    ) -> Result<ResolveOutcome, EngineError> {
        let mut state = self.lock()?;
        let row = state.ledger.get_mut(&billing_history_id).ok_or_else(|| {
            EngineError::NotFound(format!("billing history {}", billing_history_id))
        })?;

        if row.status.is_terminal() {
            return Ok(ResolveOutcome {
                entry: row.clone(),
                applied: false,
            });
        }

        row.status = resolution.status;
        row.resolved_utc = Some(resolution.resolved_at);
        if resolution.status == PaymentStatus::Paid {
            row.paid_at = Some(resolution.resolved_at);
        }
        if resolution.payment_reference.is_some() {
            row.payment_reference = resolution.payment_reference.clone();
        }

        Ok(ResolveOutcome {
            entry: row.clone(),
            applied: true,
        })
    }

    async fn list_entries(&self, subscription_id: Uuid) -> Result<Vec<BillingEntry>, EngineError> {
        let state = self.lock()?;
        let mut entries: Vec<BillingEntry> = state
            .ledger
            .values()
            .filter(|e| e.subscription_id == subscription_id)
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.created_utc);
        Ok(entries)
    }
}
