//! Postgres store: the same guarantees as the in-memory store, enforced by
//! the database. Skipped unless `TEST_DATABASE_URL` is set.

mod common;

use chrono::{DateTime, Utc};
use common::{pg_store, test_policy, token, utc, ScriptedGateway};
use futures::future::join_all;
use rust_decimal::Decimal;
use std::sync::Arc;
use subscription_engine::engine::{Deadline, Engine};
use subscription_engine::error::EngineError;
use subscription_engine::models::{
    BillingCycle, Cap, CreatePlan, NewBillingEntry, Owner, PaymentStatus, PeriodChange, Plan,
    PlanFeatures, PlanLimits, Resource, StartTrial, Subscription, SubscriptionStatus,
    TransitionAction,
};
use subscription_engine::services::{ManualClock, PgStore, SubscriptionStore, TransitionCommit};
use uuid::Uuid;

struct PgEngine {
    engine: Engine,
    store: Arc<PgStore>,
    clock: Arc<ManualClock>,
    gateway: Arc<ScriptedGateway>,
}

async fn setup(start: DateTime<Utc>) -> Option<PgEngine> {
    let Some(store) = pg_store().await else {
        eprintln!("TEST_DATABASE_URL not set, skipping");
        return None;
    };
    let clock = Arc::new(ManualClock::new(start));
    let gateway = Arc::new(ScriptedGateway::new());
    let engine = Engine::new(store.clone(), clock.clone(), test_policy(), gateway.clone());

    Some(PgEngine {
        engine,
        store,
        clock,
        gateway,
    })
}

impl PgEngine {
    async fn plan(&self, limits: PlanLimits) -> Plan {
        self.engine
            .create_plan(
                Deadline::none(),
                &CreatePlan {
                    name: "Team".to_string(),
                    description: None,
                    price: Decimal::new(4900, 2),
                    currency: "USD".to_string(),
                    billing_cycle: BillingCycle::Monthly,
                    features: PlanFeatures::default().with_flag("sso", true),
                    limits,
                },
            )
            .await
            .unwrap()
    }

    async fn subscribe(&self, owner: Owner, plan: &Plan) -> Subscription {
        self.engine
            .start_trial(
                Deadline::none(),
                &StartTrial {
                    owner,
                    plan_id: plan.plan_id,
                    auto_renew: true,
                    payment_method: Some("pm_card_visa".to_string()),
                    token: token(&format!("signup-{}", Uuid::new_v4())),
                },
            )
            .await
            .unwrap()
            .subscription
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_increments_are_never_lost() {
    let Some(t) = setup(utc(2024, 3, 1)).await else {
        return;
    };
    let plan = t.plan(PlanLimits::default()).await;
    let id = t.subscribe(Owner::User(Uuid::new_v4()), &plan).await.subscription_id;

    let tasks = (0..100).map(|_| {
        let engine = t.engine.clone();
        tokio::spawn(async move {
            engine
                .increment(Deadline::none(), id, &Resource::ApiCalls, 1)
                .await
        })
    });
    for result in join_all(tasks).await {
        result.unwrap().unwrap();
    }

    let usage = t.engine.current_usage(Deadline::none(), id).await.unwrap();
    assert_eq!(usage.used(&Resource::ApiCalls), 100);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn capped_reservations_hold_under_contention() {
    let Some(t) = setup(utc(2024, 3, 1)).await else {
        return;
    };
    let plan = t
        .plan(PlanLimits::default().with(Resource::Projects, Cap::Limited(20)))
        .await;
    let id = t.subscribe(Owner::User(Uuid::new_v4()), &plan).await.subscription_id;

    let tasks = (0..40).map(|_| {
        let engine = t.engine.clone();
        tokio::spawn(async move {
            engine
                .check_and_reserve(Deadline::none(), id, &Resource::Projects, 1)
                .await
        })
    });
    let allowed = join_all(tasks)
        .await
        .into_iter()
        .map(|r| r.unwrap().unwrap())
        .filter(|d| d.allowed)
        .count();

    assert_eq!(allowed, 20);
    let usage = t.engine.current_usage(Deadline::none(), id).await.unwrap();
    assert_eq!(usage.used(&Resource::Projects), 20);
    assert!(t.engine.has_feature(Deadline::none(), id, "sso").await.unwrap());
}

#[tokio::test]
async fn renewal_rolls_the_period_and_records_payment() {
    let Some(t) = setup(utc(2023, 12, 18)).await else {
        return;
    };
    let plan = t.plan(PlanLimits::default()).await;
    let id = t.subscribe(Owner::User(Uuid::new_v4()), &plan).await.subscription_id;

    t.clock.set(utc(2024, 1, 1));
    let summary = t.engine.roll_due(Deadline::none(), 10).await.unwrap();
    assert_eq!(summary.rolled, 1);
    // Already renewed.
    assert!(!t.engine.roll_if_due(Deadline::none(), id).await.unwrap());

    let subscription = t.engine.get_subscription(Deadline::none(), id).await.unwrap();
    assert_eq!(subscription.status, SubscriptionStatus::Active);
    assert_eq!(subscription.next_payment_date, Some(utc(2024, 2, 1)));

    let periods = t.engine.usage_history(Deadline::none(), id).await.unwrap();
    assert_eq!(periods.len(), 2);
    assert_eq!(periods[0].period_end, utc(2024, 1, 1));
    assert!(periods[0].closed_utc.is_some());
    assert_eq!(periods[1].period_start, utc(2024, 1, 1));

    let history = t.engine.billing_history(Deadline::none(), id).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, PaymentStatus::Paid);
    assert_eq!(history[0].amount, Decimal::new(4900, 2));
    assert_eq!(t.gateway.total_charges(), 1);
}

#[tokio::test]
async fn stale_versions_and_reused_tokens_are_rejected() {
    let Some(t) = setup(utc(2024, 3, 1)).await else {
        return;
    };
    let plan = t.plan(PlanLimits::default()).await;
    let subscription = t.subscribe(Owner::User(Uuid::new_v4()), &plan).await;

    let mut next = subscription.clone();
    next.auto_renew = false;
    let commit = TransitionCommit {
        action: TransitionAction::Cancel,
        token: token("turn-off-renewal"),
        from_status: subscription.status,
        expected_version: subscription.version,
        next,
        period: PeriodChange::Keep,
        at: utc(2024, 3, 2),
    };

    let committed = t.store.commit_transition(&commit).await.unwrap();
    assert_eq!(committed.version, subscription.version + 1);

    let err = t.store.commit_transition(&commit).await.unwrap_err();
    assert!(matches!(err, EngineError::DuplicateEvent { .. }));

    let stale = TransitionCommit {
        token: token("another-change"),
        ..commit
    };
    let err = t.store.commit_transition(&stale).await.unwrap_err();
    assert!(matches!(err, EngineError::ConcurrencyConflict(_)));
}

#[tokio::test]
async fn owners_hold_one_live_subscription() {
    let Some(t) = setup(utc(2024, 3, 1)).await else {
        return;
    };
    let plan = t.plan(PlanLimits::default()).await;
    let owner = Owner::Organization(Uuid::new_v4());
    t.subscribe(owner, &plan).await;

    let err = t
        .engine
        .start_trial(
            Deadline::none(),
            &StartTrial {
                owner,
                plan_id: plan.plan_id,
                auto_renew: false,
                payment_method: None,
                token: token("second-signup"),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::OwnerAlreadySubscribed(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn ledger_rows_resolve_exactly_once() {
    let Some(t) = setup(utc(2024, 4, 1)).await else {
        return;
    };
    let plan = t.plan(PlanLimits::default()).await;
    let subscription = t.subscribe(Owner::User(Uuid::new_v4()), &plan).await;
    let attempt = NewBillingEntry::for_terms(
        subscription.subscription_id,
        "cycle:2024-04",
        &subscription.terms,
        subscription.payment_method.clone(),
    );

    let entry = t
        .engine
        .record_attempt(Deadline::none(), &attempt)
        .await
        .unwrap();
    let again = t
        .engine
        .record_attempt(Deadline::none(), &attempt)
        .await
        .unwrap();
    assert_eq!(entry.billing_history_id, again.billing_history_id);

    let id = entry.billing_history_id;
    let tasks = [PaymentStatus::Paid, PaymentStatus::Failed].map(|status| {
        let engine = t.engine.clone();
        tokio::spawn(async move {
            engine
                .resolve_attempt(Deadline::none(), id, status, None)
                .await
        })
    });
    let outcomes: Vec<_> = join_all(tasks)
        .await
        .into_iter()
        .map(|r| r.unwrap().unwrap())
        .collect();

    assert_eq!(outcomes.iter().filter(|o| o.applied).count(), 1);
    assert_eq!(outcomes[0].entry.status, outcomes[1].entry.status);

    let history = t
        .engine
        .billing_history(Deadline::none(), subscription.subscription_id)
        .await
        .unwrap();
    assert_eq!(history.len(), 1);
    assert_ne!(history[0].status, PaymentStatus::Pending);
}
