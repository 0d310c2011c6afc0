//! Period roller: window continuity, renewals and batch passes.

mod common;

use common::{test_policy, utc, TestEngine};
use futures::future::join_all;
use subscription_engine::config::BillingPolicy;
use subscription_engine::engine::Deadline;
use subscription_engine::models::{
    PaymentStatus, PeriodChange, PlanLimits, Resource, SubscriptionStatus, UsagePeriod,
};
use subscription_engine::services::AtomicCounterStore;
use uuid::Uuid;

fn assert_no_overlap(periods: &[UsagePeriod]) {
    let mut sorted = periods.to_vec();
    sorted.sort_by_key(|p| p.period_start);
    for pair in sorted.windows(2) {
        assert!(
            pair[0].period_end <= pair[1].period_start,
            "overlapping periods: {:?} and {:?}",
            (pair[0].period_start, pair[0].period_end),
            (pair[1].period_start, pair[1].period_end)
        );
    }
    assert!(periods.iter().filter(|p| p.closed_utc.is_none()).count() <= 1);
}

async fn periods(t: &TestEngine, id: Uuid) -> Vec<UsagePeriod> {
    t.engine.usage_history(Deadline::none(), id).await.unwrap()
}

fn long_trial() -> BillingPolicy {
    BillingPolicy {
        trial_length_days: 90,
        ..test_policy()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_rolls_renew_once() {
    let t = TestEngine::new(utc(2023, 12, 18));
    let plan = t.plan(PlanLimits::default()).await;
    let id = t.subscribe(&plan, true).await.subscription_id;
    t.set_time(utc(2024, 1, 1));

    let tasks = (0..8).map(|_| {
        let engine = t.engine.clone();
        tokio::spawn(async move { engine.roll_if_due(Deadline::none(), id).await })
    });
    let results: Vec<bool> = join_all(tasks)
        .await
        .into_iter()
        .map(|r| r.unwrap().unwrap())
        .collect();

    assert_eq!(results.iter().filter(|rolled| **rolled).count(), 1);

    let history = t.engine.billing_history(Deadline::none(), id).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, PaymentStatus::Paid);
    assert_eq!(t.gateway.distinct_keys(), 1);

    let all = periods(&t, id).await;
    assert_eq!(all.len(), 2);
    assert_no_overlap(&all);
    assert_eq!(t.reload(id).await.status, SubscriptionStatus::Active);
}

#[tokio::test]
async fn repeated_rolls_are_no_ops() {
    let t = TestEngine::new(utc(2023, 12, 18));
    let plan = t.plan(PlanLimits::default()).await;
    let id = t.subscribe(&plan, true).await.subscription_id;
    t.set_time(utc(2024, 1, 1));

    assert!(t.engine.roll_if_due(Deadline::none(), id).await.unwrap());
    let after_first = t.reload(id).await;
    for _ in 0..3 {
        assert!(!t.engine.roll_if_due(Deadline::none(), id).await.unwrap());
    }

    assert_eq!(t.reload(id).await, after_first);
    assert_eq!(periods(&t, id).await.len(), 2);
    assert_eq!(t.gateway.total_charges(), 1);
}

#[tokio::test]
async fn long_trials_continue_without_payment() {
    // Trial runs 2024-01-01 .. 2024-03-31, longer than the monthly window.
    let t = TestEngine::with_policy(utc(2024, 1, 1), long_trial());
    let plan = t.plan(PlanLimits::default()).await;
    let id = t.subscribe(&plan, true).await.subscription_id;

    t.set_time(utc(2024, 2, 3));
    assert!(t.engine.roll_if_due(Deadline::none(), id).await.unwrap());

    let all = periods(&t, id).await;
    assert_eq!(all.len(), 2);
    assert_eq!(all[0].period_end, utc(2024, 2, 1));
    assert_eq!(all[1].period_start, utc(2024, 2, 1));
    assert_eq!(all[1].period_end, utc(2024, 3, 1));
    assert_no_overlap(&all);

    // Still a trial, nothing charged.
    assert_eq!(t.reload(id).await.status, SubscriptionStatus::Trial);
    assert_eq!(t.gateway.total_charges(), 0);
}

#[tokio::test]
async fn idle_subscriptions_catch_up_to_the_current_window() {
    let t = TestEngine::with_policy(utc(2024, 1, 1), long_trial());
    let plan = t.plan(PlanLimits::default()).await;
    let id = t.subscribe(&plan, true).await.subscription_id;

    // Two windows ended without any traffic.
    t.set_time(utc(2024, 3, 15));
    t.engine
        .increment(Deadline::none(), id, &Resource::ApiCalls, 1)
        .await
        .unwrap();

    let all = periods(&t, id).await;
    assert_eq!(all.len(), 3);
    assert_no_overlap(&all);
    let current = t.engine.current_usage(Deadline::none(), id).await.unwrap();
    assert_eq!(current.period_start, utc(2024, 3, 1));
    // Clipped to the trial end, where the paid term begins.
    assert_eq!(current.period_end, utc(2024, 3, 31));
    assert_eq!(current.used(&Resource::ApiCalls), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_continuations_never_overlap() {
    let t = TestEngine::with_policy(utc(2024, 1, 1), long_trial());
    let plan = t.plan(PlanLimits::default()).await;
    let id = t.subscribe(&plan, true).await.subscription_id;
    t.set_time(utc(2024, 2, 10));

    let tasks = (0..8).map(|_| {
        let engine = t.engine.clone();
        tokio::spawn(async move { engine.roll_if_due(Deadline::none(), id).await })
    });
    let rolled = join_all(tasks)
        .await
        .into_iter()
        .map(|r| r.unwrap().unwrap())
        .filter(|rolled| *rolled)
        .count();

    assert_eq!(rolled, 1);
    let all = periods(&t, id).await;
    assert_eq!(all.len(), 2);
    assert_no_overlap(&all);
}

#[tokio::test]
async fn missing_period_is_reopened_on_first_use() {
    let t = TestEngine::new(utc(2024, 6, 1));
    let plan = t.plan(PlanLimits::default()).await;
    let id = t.subscribe(&plan, true).await.subscription_id;

    let open = t.store.open_period(id).await.unwrap().unwrap();
    t.set_time(utc(2024, 6, 3));
    t.store
        .apply_period_change(
            id,
            &PeriodChange::Close {
                period_id: open.period_id,
                closed_at: utc(2024, 6, 3),
            },
        )
        .await
        .unwrap();

    let total = t
        .engine
        .increment(Deadline::none(), id, &Resource::Records, 2)
        .await
        .unwrap();
    assert_eq!(total, 2);

    let current = t.engine.current_usage(Deadline::none(), id).await.unwrap();
    assert_eq!(current.period_start, utc(2024, 6, 3));
    assert_eq!(current.period_end, utc(2024, 6, 15));
    assert_no_overlap(&periods(&t, id).await);
}

#[tokio::test]
async fn closing_a_closed_period_conflicts() {
    let t = TestEngine::new(utc(2024, 6, 1));
    let plan = t.plan(PlanLimits::default()).await;
    let id = t.subscribe(&plan, true).await.subscription_id;
    let open = t.store.open_period(id).await.unwrap().unwrap();
    let close = PeriodChange::Close {
        period_id: open.period_id,
        closed_at: utc(2024, 6, 2),
    };

    t.store.apply_period_change(id, &close).await.unwrap();
    let err = t.store.apply_period_change(id, &close).await.unwrap_err();

    assert!(matches!(
        err,
        subscription_engine::error::EngineError::ConcurrencyConflict(_)
    ));
}

#[tokio::test]
async fn batch_pass_renews_and_lapses_due_subscriptions() {
    let t = TestEngine::new(utc(2023, 12, 18));
    let plan = t.plan(PlanLimits::default()).await;
    let renewing_a = t.subscribe(&plan, true).await.subscription_id;
    let renewing_b = t.subscribe(&plan, true).await.subscription_id;
    let lapsing = t.subscribe(&plan, false).await.subscription_id;

    // Started later, not due yet.
    t.set_time(utc(2023, 12, 25));
    let not_due = t.subscribe(&plan, true).await.subscription_id;

    t.set_time(utc(2024, 1, 1));
    let summary = t.engine.roll_due(Deadline::none(), 100).await.unwrap();

    assert_eq!(summary.processed, 3);
    assert_eq!(summary.rolled, 2);
    assert_eq!(summary.failed, 0);
    assert_eq!(
        t.reload(renewing_a).await.status,
        SubscriptionStatus::Active
    );
    assert_eq!(
        t.reload(renewing_b).await.status,
        SubscriptionStatus::Active
    );
    assert_eq!(t.reload(lapsing).await.status, SubscriptionStatus::Expired);
    assert_eq!(t.reload(not_due).await.status, SubscriptionStatus::Trial);

    // Nothing left to do.
    let again = t.engine.roll_due(Deadline::none(), 100).await.unwrap();
    assert_eq!(again.processed, 0);
}

#[tokio::test]
async fn batch_pass_respects_the_limit() {
    let t = TestEngine::new(utc(2023, 12, 18));
    let plan = t.plan(PlanLimits::default()).await;
    for _ in 0..3 {
        t.subscribe(&plan, true).await;
    }
    t.set_time(utc(2024, 1, 1));

    let first = t.engine.roll_due(Deadline::none(), 2).await.unwrap();
    let second = t.engine.roll_due(Deadline::none(), 2).await.unwrap();

    assert_eq!(first.processed, 2);
    assert_eq!(second.processed, 1);
    assert_eq!(first.rolled + second.rolled, 3);
}
