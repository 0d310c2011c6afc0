//! Subscription lifecycle and usage-entitlement engine.
//!
//! [`Engine`] wires the components over one store and one clock. Every call
//! takes a [`Deadline`]; the components themselves are also public for
//! callers that compose their own flows.

pub mod catalog;
pub mod deadline;
pub mod entitlement;
pub mod ledger;
pub mod lifecycle;
pub mod meter;
pub mod roller;

pub use catalog::PlanCatalog;
pub use deadline::Deadline;
pub use entitlement::{Decision, EntitlementChecker, Remaining};
pub use ledger::BillingLedger;
pub use lifecycle::{subscription_id_for, RenewalOutcome, SubscriptionLifecycle, TransitionOutcome};
pub use meter::UsageMeter;
pub use roller::{PeriodRoller, RollSummary};

use std::future::Future;
use std::sync::Arc;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::config::BillingPolicy;
use crate::error::EngineError;
use crate::models::{
    Access, BillingEntry, CancelEffective, CreatePlan, IdempotencyToken, ListPlansFilter,
    ListSubscriptionsFilter, NewBillingEntry, PaymentOutcome, PaymentStatus, Plan, Resource,
    ResolveOutcome, StartTrial, Subscription, SubscriptionStatus, TransitionAction, UpdatePlan,
    UsagePeriod, UsageSnapshot,
};
use crate::services::{Clock, EngineStore, PaymentGateway};

/// Result of applying a provider payment event.
#[derive(Debug, Clone, PartialEq)]
pub struct PaymentEventOutcome {
    pub entry: BillingEntry,
    /// False when the row had already been resolved by an earlier delivery.
    pub applied: bool,
    /// Set when the payment activated the subscription.
    pub transition: Option<TransitionOutcome>,
}

#[derive(Clone)]
pub struct Engine {
    clock: Arc<dyn Clock>,
    policy: Arc<BillingPolicy>,
    catalog: PlanCatalog,
    meter: UsageMeter,
    entitlements: EntitlementChecker,
    ledger: BillingLedger,
    lifecycle: SubscriptionLifecycle,
    roller: PeriodRoller,
}

impl Engine {
    pub fn new(
        store: Arc<dyn EngineStore>,
        clock: Arc<dyn Clock>,
        policy: BillingPolicy,
        gateway: Arc<dyn PaymentGateway>,
    ) -> Self {
        let policy = Arc::new(policy);
        let catalog = PlanCatalog::new(store.clone(), clock.clone(), policy.clone());
        let meter = UsageMeter::new(store.clone(), clock.clone());
        let entitlements = EntitlementChecker::new(store.clone(), clock.clone(), meter.clone());
        let ledger = BillingLedger::new(store.clone(), clock.clone());
        let lifecycle = SubscriptionLifecycle::new(
            store.clone(),
            clock.clone(),
            policy.clone(),
            catalog.clone(),
            ledger.clone(),
            gateway,
        );
        let roller = PeriodRoller::new(store, clock.clone(), lifecycle.clone());

        Self {
            clock,
            policy,
            catalog,
            meter,
            entitlements,
            ledger,
            lifecycle,
            roller,
        }
    }

    pub fn policy(&self) -> &BillingPolicy {
        &self.policy
    }

    pub fn catalog(&self) -> &PlanCatalog {
        &self.catalog
    }

    pub fn meter(&self) -> &UsageMeter {
        &self.meter
    }

    pub fn entitlements(&self) -> &EntitlementChecker {
        &self.entitlements
    }

    pub fn ledger(&self) -> &BillingLedger {
        &self.ledger
    }

    pub fn lifecycle(&self) -> &SubscriptionLifecycle {
        &self.lifecycle
    }

    pub fn roller(&self) -> &PeriodRoller {
        &self.roller
    }

    // Plans

    pub async fn create_plan(&self, deadline: Deadline, input: &CreatePlan) -> Result<Plan, EngineError> {
        deadline
            .run("create_plan", self.catalog.create_plan(input))
            .await
    }

    pub async fn get_plan(&self, deadline: Deadline, plan_id: Uuid) -> Result<Plan, EngineError> {
        deadline.run("get_plan", self.catalog.get_plan(plan_id)).await
    }

    pub async fn list_plans(
        &self,
        deadline: Deadline,
        filter: &ListPlansFilter,
    ) -> Result<Vec<Plan>, EngineError> {
        deadline.run("list_plans", self.catalog.list_plans(filter)).await
    }

    pub async fn update_plan(
        &self,
        deadline: Deadline,
        plan_id: Uuid,
        input: &UpdatePlan,
    ) -> Result<Plan, EngineError> {
        deadline
            .run("update_plan", self.catalog.update_plan(plan_id, input))
            .await
    }

    pub async fn deactivate_plan(&self, deadline: Deadline, plan_id: Uuid) -> Result<Plan, EngineError> {
        deadline
            .run("deactivate_plan", self.catalog.deactivate_plan(plan_id))
            .await
    }

    // Usage and entitlements

    /// Meter `amount` units. Rolls the subscription's period once when it
    /// has none open, then retries.
    pub async fn increment(
        &self,
        deadline: Deadline,
        subscription_id: Uuid,
        resource: &Resource,
        amount: i64,
    ) -> Result<u64, EngineError> {
        deadline
            .run(
                "increment",
                self.with_rollover(subscription_id, move || {
                    self.meter.increment(subscription_id, resource, amount)
                }),
            )
            .await
    }

    /// Reserve `amount` units against the plan's cap, all or nothing. Rolls
    /// the subscription's period once when it has none open, then retries.
    pub async fn check_and_reserve(
        &self,
        deadline: Deadline,
        subscription_id: Uuid,
        resource: &Resource,
        amount: i64,
    ) -> Result<Decision, EngineError> {
        deadline
            .run(
                "check_and_reserve",
                self.with_rollover(subscription_id, move || {
                    self.entitlements
                        .check_and_reserve(subscription_id, resource, amount)
                }),
            )
            .await
    }

    pub async fn current_usage(
        &self,
        deadline: Deadline,
        subscription_id: Uuid,
    ) -> Result<UsageSnapshot, EngineError> {
        deadline
            .run("current_usage", self.meter.current_usage(subscription_id))
            .await
    }

    pub async fn usage_history(
        &self,
        deadline: Deadline,
        subscription_id: Uuid,
    ) -> Result<Vec<UsagePeriod>, EngineError> {
        deadline
            .run("usage_history", self.meter.history(subscription_id))
            .await
    }

    pub async fn has_feature(
        &self,
        deadline: Deadline,
        subscription_id: Uuid,
        feature: &str,
    ) -> Result<bool, EngineError> {
        deadline
            .run(
                "has_feature",
                self.entitlements.has_feature(subscription_id, feature),
            )
            .await
    }

    // Subscriptions

    pub async fn start_trial(
        &self,
        deadline: Deadline,
        input: &StartTrial,
    ) -> Result<TransitionOutcome, EngineError> {
        deadline
            .run("start_trial", self.lifecycle.start_trial(input))
            .await
    }

    pub async fn activate_after_payment(
        &self,
        deadline: Deadline,
        subscription_id: Uuid,
        billing_history_id: Uuid,
        token: &IdempotencyToken,
    ) -> Result<TransitionOutcome, EngineError> {
        deadline
            .run(
                "activate_after_payment",
                self.lifecycle
                    .activate_after_payment(subscription_id, billing_history_id, token),
            )
            .await
    }

    pub async fn renewal_due(
        &self,
        deadline: Deadline,
        subscription_id: Uuid,
    ) -> Result<RenewalOutcome, EngineError> {
        deadline
            .run("renewal_due", self.lifecycle.renewal_due(subscription_id))
            .await
    }

    pub async fn mark_past_due(
        &self,
        deadline: Deadline,
        subscription_id: Uuid,
        token: &IdempotencyToken,
    ) -> Result<TransitionOutcome, EngineError> {
        deadline
            .run(
                "mark_past_due",
                self.lifecycle.mark_past_due(subscription_id, token),
            )
            .await
    }

    pub async fn cancel(
        &self,
        deadline: Deadline,
        subscription_id: Uuid,
        effective: CancelEffective,
        token: &IdempotencyToken,
    ) -> Result<TransitionOutcome, EngineError> {
        deadline
            .run(
                "cancel",
                self.lifecycle.cancel(subscription_id, effective, token),
            )
            .await
    }

    pub async fn get_subscription(
        &self,
        deadline: Deadline,
        subscription_id: Uuid,
    ) -> Result<Subscription, EngineError> {
        deadline
            .run(
                "get_subscription",
                self.lifecycle.get_subscription(subscription_id),
            )
            .await
    }

    pub async fn list_subscriptions(
        &self,
        deadline: Deadline,
        filter: &ListSubscriptionsFilter,
    ) -> Result<Vec<Subscription>, EngineError> {
        deadline
            .run(
                "list_subscriptions",
                self.lifecycle.list_subscriptions(filter),
            )
            .await
    }

    /// Whether the subscription grants access now, and until when in grace.
    pub async fn access(&self, deadline: Deadline, subscription_id: Uuid) -> Result<Access, EngineError> {
        let subscription = self.get_subscription(deadline, subscription_id).await?;
        Ok(subscription.access_at(self.clock.now(), self.policy.grace_period()))
    }

    // Billing

    pub async fn record_attempt(
        &self,
        deadline: Deadline,
        entry: &NewBillingEntry,
    ) -> Result<BillingEntry, EngineError> {
        deadline
            .run("record_attempt", self.ledger.record_attempt(entry))
            .await
    }

    pub async fn resolve_attempt(
        &self,
        deadline: Deadline,
        billing_history_id: Uuid,
        status: PaymentStatus,
        reference: Option<String>,
    ) -> Result<ResolveOutcome, EngineError> {
        deadline
            .run(
                "resolve_attempt",
                self.ledger
                    .resolve_attempt(billing_history_id, status, reference),
            )
            .await
    }

    pub async fn billing_history(
        &self,
        deadline: Deadline,
        subscription_id: Uuid,
    ) -> Result<Vec<BillingEntry>, EngineError> {
        deadline
            .run("billing_history", self.ledger.history(subscription_id))
            .await
    }

    /// Apply a payment outcome delivered by the provider: resolve the billing
    /// row, and if it is PAID and the subscription is waiting on a payment,
    /// activate it keyed on the provider's event id.
    #[instrument(skip(self, deadline, event), fields(event_id = %event.event_id, billing_history_id = %event.billing_history_id))]
    pub async fn apply_payment_event(
        &self,
        deadline: Deadline,
        event: &PaymentOutcome,
    ) -> Result<PaymentEventOutcome, EngineError> {
        deadline
            .run("apply_payment_event", async {
                let token = IdempotencyToken::new(event.event_id.clone())?;
                let resolved = self
                    .ledger
                    .resolve_attempt(
                        event.billing_history_id,
                        event.status,
                        event.reference.clone(),
                    )
                    .await?;
                let entry = resolved.entry;

                let mut transition = None;
                if entry.status == PaymentStatus::Paid {
                    // A redelivered event gets the activation it caused the first time.
                    transition = self
                        .lifecycle
                        .replay(entry.subscription_id, &token, TransitionAction::Activate)
                        .await?;
                }
                if entry.status == PaymentStatus::Paid && transition.is_none() {
                    let subscription = self
                        .lifecycle
                        .get_subscription(entry.subscription_id)
                        .await?;
                    if matches!(
                        subscription.status,
                        SubscriptionStatus::Trial | SubscriptionStatus::Expired
                    ) {
                        transition = Some(
                            self.lifecycle
                                .activate_after_payment(
                                    entry.subscription_id,
                                    entry.billing_history_id,
                                    &token,
                                )
                                .await?,
                        );
                    }
                }

                Ok(PaymentEventOutcome {
                    entry,
                    applied: resolved.applied,
                    transition,
                })
            })
            .await
    }

    // Periods

    pub async fn roll_if_due(&self, deadline: Deadline, subscription_id: Uuid) -> Result<bool, EngineError> {
        deadline
            .run("roll_if_due", self.roller.roll_if_due(subscription_id))
            .await
    }

    pub async fn roll_due(&self, deadline: Deadline, limit: i64) -> Result<RollSummary, EngineError> {
        deadline.run("roll_due", self.roller.roll_due(limit)).await
    }

    async fn with_rollover<T, F, Fut>(&self, subscription_id: Uuid, op: F) -> Result<T, EngineError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, EngineError>>,
    {
        match op().await {
            Err(EngineError::NoActivePeriod { .. }) => {
                debug!(subscription_id = %subscription_id, "No open period, rolling before retry");
                self.roller.roll_if_due(subscription_id).await?;
                op().await
            }
            other => other,
        }
    }
}
