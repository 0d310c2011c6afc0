//! Storage seam.
//!
//! Every guarantee the engine makes across service instances is enforced
//! here, at the data layer: counter increments are single conditional
//! updates and transitions are version-checked commits. Implementations must
//! never read-then-write in separate steps.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::EngineError;
use crate::models::{
    AttemptResolution, BillingEntry, IdempotencyToken, ListPlansFilter, ListSubscriptionsFilter,
    NewBillingEntry, NewPeriod, Owner, PeriodChange, Plan, Reservation, Resource, ResolveOutcome,
    Subscription, SubscriptionStatus, TransitionAction, TransitionRecord, UpdatePlan, UsagePeriod,
};

/// A state change to commit atomically.
#[derive(Debug, Clone)]
pub struct TransitionCommit {
    pub action: TransitionAction,
    pub token: IdempotencyToken,
    pub from_status: SubscriptionStatus,
    /// Version the change was computed from.
    pub expected_version: i64,
    /// New state. The store assigns `version = expected_version + 1`.
    pub next: Subscription,
    pub period: PeriodChange,
    pub at: DateTime<Utc>,
}

#[async_trait]
pub trait PlanStore: Send + Sync {
    async fn insert_plan(&self, plan: &Plan) -> Result<Plan, EngineError>;

    async fn get_plan(&self, plan_id: Uuid) -> Result<Option<Plan>, EngineError>;

    async fn list_plans(&self, filter: &ListPlansFilter) -> Result<Vec<Plan>, EngineError>;

    async fn update_plan(
        &self,
        plan_id: Uuid,
        input: &UpdatePlan,
        now: DateTime<Utc>,
    ) -> Result<Option<Plan>, EngineError>;

    async fn set_plan_active(
        &self,
        plan_id: Uuid,
        is_active: bool,
        now: DateTime<Utc>,
    ) -> Result<Option<Plan>, EngineError>;
}

#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    /// Insert a subscription together with its first period and the token
    /// that created it.
    ///
    /// Fails with `DuplicateEvent` when the token was already used for this
    /// subscription id, and with `OwnerAlreadySubscribed` when the owner
    /// already has a trial or active subscription.
    async fn create_subscription(
        &self,
        subscription: &Subscription,
        first_period: &NewPeriod,
        token: &IdempotencyToken,
    ) -> Result<Subscription, EngineError>;

    async fn get_subscription(
        &self,
        subscription_id: Uuid,
    ) -> Result<Option<Subscription>, EngineError>;

    /// The owner's trial or active subscription, if any.
    async fn find_live_subscription(
        &self,
        owner: &Owner,
    ) -> Result<Option<Subscription>, EngineError>;

    async fn list_subscriptions(
        &self,
        filter: &ListSubscriptionsFilter,
    ) -> Result<Vec<Subscription>, EngineError>;

    /// Record the token, write `next` if the stored version still matches and
    /// apply the period change, all or nothing.
    ///
    /// Fails with `DuplicateEvent` when the token was already recorded and
    /// with `ConcurrencyConflict` when the version moved or a period in the
    /// change is no longer open.
    async fn commit_transition(&self, commit: &TransitionCommit)
        -> Result<Subscription, EngineError>;

    async fn find_transition(
        &self,
        subscription_id: Uuid,
        token: &IdempotencyToken,
    ) -> Result<Option<TransitionRecord>, EngineError>;

    /// Subscriptions with a renewal due or an open period that has ended.
    async fn list_roll_candidates(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Uuid>, EngineError>;
}

#[async_trait]
pub trait AtomicCounterStore: Send + Sync {
    /// The subscription's unclosed period, whether or not it has ended.
    async fn open_period(&self, subscription_id: Uuid) -> Result<Option<UsagePeriod>, EngineError>;

    /// All periods, oldest first.
    async fn list_periods(&self, subscription_id: Uuid) -> Result<Vec<UsagePeriod>, EngineError>;

    /// Apply a period change that is not part of a status transition.
    ///
    /// Fails with `ConcurrencyConflict` when a period to close is already
    /// closed, and leaves nothing changed.
    async fn apply_period_change(
        &self,
        subscription_id: Uuid,
        change: &PeriodChange,
    ) -> Result<(), EngineError>;

    /// Add `amount` to the counter of the open, unexpired period and return
    /// the new total. Fails with `NoActivePeriod` when there is none.
    async fn increment(
        &self,
        subscription_id: Uuid,
        resource: &Resource,
        amount: u64,
        now: DateTime<Utc>,
    ) -> Result<u64, EngineError>;

    /// Add `amount` only if the resulting total stays within `cap`.
    async fn increment_within(
        &self,
        subscription_id: Uuid,
        resource: &Resource,
        amount: u64,
        cap: u64,
        now: DateTime<Utc>,
    ) -> Result<Reservation, EngineError>;
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Append a pending row. A second call with the same
    /// `(subscription_id, attempt_key)` returns the existing row.
    async fn record_attempt(
        &self,
        entry: &NewBillingEntry,
        now: DateTime<Utc>,
    ) -> Result<BillingEntry, EngineError>;

    async fn get_entry(&self, billing_history_id: Uuid)
        -> Result<Option<BillingEntry>, EngineError>;

    /// Move a pending row to a terminal status. A row that is already
    /// terminal is returned unchanged with `applied = false`.
    async fn resolve_attempt(
        &self,
        billing_history_id: Uuid,
        resolution: &AttemptResolution,
    ) -> Result<ResolveOutcome, EngineError>;

    async fn list_entries(&self, subscription_id: Uuid) -> Result<Vec<BillingEntry>, EngineError>;
}

/// Everything the engine persists.
pub trait EngineStore: PlanStore + SubscriptionStore + AtomicCounterStore + LedgerStore {}

impl<T> EngineStore for T where T: PlanStore + SubscriptionStore + AtomicCounterStore + LedgerStore
{}
