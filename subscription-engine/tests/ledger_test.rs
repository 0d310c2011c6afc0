//! Billing ledger: append-only attempts resolved exactly once.

mod common;

use common::{utc, TestEngine};
use futures::future::join_all;
use rust_decimal::Decimal;
use subscription_engine::engine::Deadline;
use subscription_engine::error::EngineError;
use subscription_engine::models::{NewBillingEntry, PaymentStatus, PlanLimits, Subscription};
use uuid::Uuid;

async fn setup() -> (TestEngine, Subscription) {
    let t = TestEngine::new(utc(2024, 4, 1));
    let plan = t.plan(PlanLimits::default()).await;
    let subscription = t.subscribe(&plan, true).await;
    (t, subscription)
}

fn attempt(subscription: &Subscription, key: &str) -> NewBillingEntry {
    NewBillingEntry::for_terms(
        subscription.subscription_id,
        key,
        &subscription.terms,
        subscription.payment_method.clone(),
    )
}

#[tokio::test]
async fn attempts_start_pending_with_the_plan_snapshot() {
    let (t, subscription) = setup().await;

    let entry = t
        .engine
        .record_attempt(Deadline::none(), &attempt(&subscription, "cycle:2024-04"))
        .await
        .unwrap();

    assert_eq!(entry.status, PaymentStatus::Pending);
    assert_eq!(entry.amount, Decimal::new(4900, 2));
    assert_eq!(entry.currency, "USD");
    assert_eq!(entry.plan_name, "Team");
    assert_eq!(entry.paid_at, None);
    assert_eq!(entry.created_utc, utc(2024, 4, 1));
}

#[tokio::test]
async fn each_cycle_appends_a_new_row() {
    let (t, subscription) = setup().await;

    let april = t
        .engine
        .record_attempt(Deadline::none(), &attempt(&subscription, "cycle:2024-04"))
        .await
        .unwrap();
    let april_again = t
        .engine
        .record_attempt(Deadline::none(), &attempt(&subscription, "cycle:2024-04"))
        .await
        .unwrap();
    let may = t
        .engine
        .record_attempt(Deadline::none(), &attempt(&subscription, "cycle:2024-05"))
        .await
        .unwrap();

    assert_eq!(april.billing_history_id, april_again.billing_history_id);
    assert_ne!(april.billing_history_id, may.billing_history_id);
    let history = t
        .engine
        .billing_history(Deadline::none(), subscription.subscription_id)
        .await
        .unwrap();
    assert_eq!(history.len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn resolving_twice_applies_once() {
    let (t, subscription) = setup().await;
    let entry = t
        .engine
        .record_attempt(Deadline::none(), &attempt(&subscription, "cycle:2024-04"))
        .await
        .unwrap();
    let id = entry.billing_history_id;

    let tasks = (0..2).map(|_| {
        let engine = t.engine.clone();
        tokio::spawn(async move {
            engine
                .resolve_attempt(
                    Deadline::none(),
                    id,
                    PaymentStatus::Paid,
                    Some("ch_1".to_string()),
                )
                .await
        })
    });
    let outcomes: Vec<_> = join_all(tasks)
        .await
        .into_iter()
        .map(|r| r.unwrap().unwrap())
        .collect();

    assert_eq!(outcomes.iter().filter(|o| o.applied).count(), 1);
    assert_eq!(outcomes[0].entry, outcomes[1].entry);
    assert_eq!(outcomes[0].entry.status, PaymentStatus::Paid);

    let history = t
        .engine
        .billing_history(Deadline::none(), subscription.subscription_id)
        .await
        .unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, PaymentStatus::Paid);
    assert_eq!(history[0].payment_reference.as_deref(), Some("ch_1"));
}

#[tokio::test]
async fn a_resolved_row_keeps_its_first_outcome() {
    let (t, subscription) = setup().await;
    let entry = t
        .engine
        .record_attempt(Deadline::none(), &attempt(&subscription, "cycle:2024-04"))
        .await
        .unwrap();

    t.engine
        .resolve_attempt(
            Deadline::none(),
            entry.billing_history_id,
            PaymentStatus::Failed,
            None,
        )
        .await
        .unwrap();
    t.set_time(utc(2024, 4, 2));
    let late = t
        .engine
        .resolve_attempt(
            Deadline::none(),
            entry.billing_history_id,
            PaymentStatus::Paid,
            Some("ch_late".to_string()),
        )
        .await
        .unwrap();

    assert!(!late.applied);
    assert_eq!(late.entry.status, PaymentStatus::Failed);
    assert_eq!(late.entry.payment_reference, None);
    assert_eq!(late.entry.resolved_utc, Some(utc(2024, 4, 1)));
}

#[tokio::test]
async fn resolving_to_pending_is_rejected() {
    let (t, subscription) = setup().await;
    let entry = t
        .engine
        .record_attempt(Deadline::none(), &attempt(&subscription, "cycle:2024-04"))
        .await
        .unwrap();

    let err = t
        .engine
        .resolve_attempt(
            Deadline::none(),
            entry.billing_history_id,
            PaymentStatus::Pending,
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));
}

#[tokio::test]
async fn unknown_rows_are_not_found() {
    let (t, _) = setup().await;

    let err = t
        .engine
        .resolve_attempt(Deadline::none(), Uuid::new_v4(), PaymentStatus::Paid, None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)));
}

#[tokio::test]
async fn negative_amounts_are_rejected() {
    let (t, subscription) = setup().await;
    let mut entry = attempt(&subscription, "refund-as-charge");
    entry.amount = Decimal::new(-100, 2);

    let err = t
        .engine
        .record_attempt(Deadline::none(), &entry)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));
}
