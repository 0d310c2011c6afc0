//! Subscription state machine.
//!
//! ```text
//!   start_trial ──► TRIAL ──activate/renew──► ACTIVE ──renew──┐
//!                     │                        │  ▲ ◄─────────┘
//!                     │ mark_past_due / lapse  │  │ activate (within grace)
//!                     ▼                        ▼  │
//!                  EXPIRED ◄────────────── EXPIRED
//!   TRIAL / ACTIVE ──cancel──► CANCELLED (terminal)
//! ```
//!
//! Every transition is committed with an idempotency token and the version
//! it was computed from. A token seen before returns the recorded outcome; a
//! version that moved underneath fails with `ConcurrencyConflict`.

use chrono::{DateTime, Datelike, Utc};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::catalog::PlanCatalog;
use super::ledger::BillingLedger;
use crate::config::BillingPolicy;
use crate::error::EngineError;
use crate::models::{
    BillingEntry, CancelEffective, IdempotencyToken, ListSubscriptionsFilter, NewBillingEntry,
    NewPeriod, Owner, PaymentStatus, PeriodChange, StartTrial, Subscription, SubscriptionStatus,
    TransitionAction,
};
use crate::services::{
    metrics, ChargeRequest, ChargeResult, ChargeStatus, Clock, EngineStore, PaymentGateway,
    TransitionCommit,
};

/// Result of a transition. `replayed` is set when the token had already been
/// applied and the recorded outcome is returned instead.
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionOutcome {
    pub subscription: Subscription,
    pub replayed: bool,
}

/// Result of a renewal attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct RenewalOutcome {
    pub subscription: Subscription,
    pub entry: BillingEntry,
    pub renewed: bool,
    pub replayed: bool,
}

const RENEWAL_TOKEN_KIND: &str = "renewal";

/// Deterministic id so a retried start with the same token finds the
/// subscription it created.
pub fn subscription_id_for(owner: &Owner, token: &IdempotencyToken) -> Uuid {
    Uuid::new_v5(
        &Uuid::NAMESPACE_OID,
        format!("subscription:{}:{}", owner, token).as_bytes(),
    )
}

#[derive(Clone)]
pub struct SubscriptionLifecycle {
    store: Arc<dyn EngineStore>,
    clock: Arc<dyn Clock>,
    policy: Arc<BillingPolicy>,
    catalog: PlanCatalog,
    ledger: BillingLedger,
    gateway: Arc<dyn PaymentGateway>,
}

impl SubscriptionLifecycle {
    pub fn new(
        store: Arc<dyn EngineStore>,
        clock: Arc<dyn Clock>,
        policy: Arc<BillingPolicy>,
        catalog: PlanCatalog,
        ledger: BillingLedger,
        gateway: Arc<dyn PaymentGateway>,
    ) -> Self {
        Self {
            store,
            clock,
            policy,
            catalog,
            ledger,
            gateway,
        }
    }

    pub async fn get_subscription(&self, subscription_id: Uuid) -> Result<Subscription, EngineError> {
        self.store
            .get_subscription(subscription_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("subscription {}", subscription_id)))
    }

    pub async fn list_subscriptions(
        &self,
        filter: &ListSubscriptionsFilter,
    ) -> Result<Vec<Subscription>, EngineError> {
        self.store.list_subscriptions(filter).await
    }

    /// Create a subscription in TRIAL with its first usage period.
    #[instrument(skip(self, input), fields(owner = %input.owner, plan_id = %input.plan_id, token = %input.token))]
    pub async fn start_trial(&self, input: &StartTrial) -> Result<TransitionOutcome, EngineError> {
        let subscription_id = subscription_id_for(&input.owner, &input.token);
        let action = TransitionAction::StartTrial;

        if let Some(replay) = self.replay(subscription_id, &input.token, action).await? {
            return Ok(replay);
        }

        let plan = self.catalog.get_plan(input.plan_id).await?;
        if !plan.is_active {
            return Err(EngineError::Validation(format!(
                "plan {} is not open for new subscriptions",
                plan.plan_id
            )));
        }

        let now = self.clock.now();
        let trial_end = now + self.policy.trial_length();
        let terms = self.catalog.terms_for(&plan);
        let first_period_end = terms.billing_cycle.advance(now, now.day()).min(trial_end);

        let subscription = Subscription {
            subscription_id,
            owner: input.owner,
            plan_id: plan.plan_id,
            terms,
            status: SubscriptionStatus::Trial,
            start_date: now,
            end_date: None,
            trial_end_date: Some(trial_end),
            auto_renew: input.auto_renew,
            billing_anchor_day: trial_end.day(),
            last_payment_date: None,
            next_payment_date: Some(trial_end),
            past_due_since: None,
            payment_method: input.payment_method.clone(),
            version: 1,
            created_utc: now,
            updated_utc: now,
        };
        subscription.validate()?;

        let first_period = NewPeriod::new(subscription_id, now, first_period_end);

        match self
            .store
            .create_subscription(&subscription, &first_period, &input.token)
            .await
        {
            Ok(created) => {
                metrics::record_transition(action.as_str(), "applied");
                info!(
                    subscription_id = %created.subscription_id,
                    trial_end = %trial_end,
                    "Subscription trial started"
                );
                Ok(TransitionOutcome {
                    subscription: created,
                    replayed: false,
                })
            }
            Err(EngineError::DuplicateEvent { token }) => self
                .replay(subscription_id, &input.token, action)
                .await?
                .ok_or(EngineError::DuplicateEvent { token }),
            Err(e) => {
                metrics::record_transition(action.as_str(), "rejected");
                Err(e)
            }
        }
    }

    /// Apply a PAID outcome delivered outside the renewal flow. Valid from
    /// TRIAL, or from EXPIRED while the grace window is still open. The
    /// billing row must belong to the subscription and be PAID.
    #[instrument(skip(self), fields(subscription_id = %subscription_id, billing_history_id = %billing_history_id, token = %token))]
    pub async fn activate_after_payment(
        &self,
        subscription_id: Uuid,
        billing_history_id: Uuid,
        token: &IdempotencyToken,
    ) -> Result<TransitionOutcome, EngineError> {
        let action = TransitionAction::Activate;
        if let Some(replay) = self.replay(subscription_id, token, action).await? {
            return Ok(replay);
        }

        let payment = self.ledger.get(billing_history_id).await?;
        ensure_paid(&payment, subscription_id)?;

        let current = self.get_subscription(subscription_id).await?;
        let now = self.clock.now();
        self.ensure_activatable(&current, now)?;

        self.apply_payment(&current, action, token.clone(), now, now)
            .await
    }

    /// Charge the next cycle of a due subscription and move it to ACTIVE on
    /// success or EXPIRED on failure.
    ///
    /// Safe to retry: the billing row is keyed by the due date, the gateway
    /// charge by the billing row and the transition by a token derived from
    /// the due date. A gateway timeout counts as a failed payment.
    #[instrument(skip(self), fields(subscription_id = %subscription_id))]
    pub async fn renewal_due(&self, subscription_id: Uuid) -> Result<RenewalOutcome, EngineError> {
        let current = self.get_subscription(subscription_id).await?;
        if !current.renewal_due_at(self.clock.now()) {
            if let Some(replay) = self.replay_last_renewal(subscription_id).await? {
                return Ok(replay);
            }
        }
        self.renew(&current).await
    }

    /// Outcome of the latest renewal whose transition was committed. A caller
    /// retrying after that commit sees the subscription no longer due.
    async fn replay_last_renewal(
        &self,
        subscription_id: Uuid,
    ) -> Result<Option<RenewalOutcome>, EngineError> {
        let Some(entry) = self
            .ledger
            .history(subscription_id)
            .await?
            .into_iter()
            .rev()
            .find(|e| {
                e.attempt_key
                    .strip_prefix(RENEWAL_TOKEN_KIND)
                    .is_some_and(|rest| rest.starts_with(':'))
            })
        else {
            return Ok(None);
        };

        let token = IdempotencyToken::new(entry.attempt_key.clone())?;
        let Some(record) = self.store.find_transition(subscription_id, &token).await? else {
            return Ok(None);
        };

        metrics::record_transition(record.action.as_str(), "replayed");
        info!(subscription_id = %subscription_id, token = %token, "Replayed renewal");

        Ok(Some(RenewalOutcome {
            subscription: record.snapshot,
            renewed: entry.status == PaymentStatus::Paid,
            entry,
            replayed: true,
        }))
    }

    /// Renew from an already loaded snapshot. A worker that loaded the same
    /// due snapshot as a concurrent winner derives the same token and gets
    /// the winner's outcome back as a replay.
    pub(crate) async fn renew(&self, current: &Subscription) -> Result<RenewalOutcome, EngineError> {
        let subscription_id = current.subscription_id;
        let now = self.clock.now();

        let action = match current.status {
            SubscriptionStatus::Trial => TransitionAction::Activate,
            SubscriptionStatus::Active => TransitionAction::Renew,
            from => {
                metrics::record_transition(TransitionAction::Renew.as_str(), "rejected");
                return Err(EngineError::InvalidTransition {
                    from,
                    action: TransitionAction::Renew,
                });
            }
        };

        let due = current
            .next_payment_date
            .filter(|due| *due <= now)
            .ok_or_else(|| {
                EngineError::Validation(format!(
                    "renewal of subscription {} is not due",
                    subscription_id
                ))
            })?;
        if !current.auto_renew {
            return Err(EngineError::Validation(format!(
                "subscription {} does not renew automatically",
                subscription_id
            )));
        }

        let token = IdempotencyToken::derived(RENEWAL_TOKEN_KIND, due);
        let attempt = NewBillingEntry::for_terms(
            subscription_id,
            token.as_str(),
            &current.terms,
            current.payment_method.clone(),
        );
        let entry = self.ledger.record_attempt(&attempt).await?;
        let entry = if entry.status.is_terminal() {
            entry
        } else {
            self.charge(current, entry).await?
        };

        let renewed = entry.status == PaymentStatus::Paid;
        let outcome = if renewed {
            self.apply_payment(current, action, token, due, now).await?
        } else {
            self.past_due(current, token, now).await?
        };

        Ok(RenewalOutcome {
            subscription: outcome.subscription,
            entry,
            renewed,
            replayed: outcome.replayed,
        })
    }

    /// Record a failed payment: EXPIRED, grace window starts now, usage
    /// frozen.
    #[instrument(skip(self), fields(subscription_id = %subscription_id, token = %token))]
    pub async fn mark_past_due(
        &self,
        subscription_id: Uuid,
        token: &IdempotencyToken,
    ) -> Result<TransitionOutcome, EngineError> {
        if let Some(replay) = self
            .replay(subscription_id, token, TransitionAction::MarkPastDue)
            .await?
        {
            return Ok(replay);
        }

        let current = self.get_subscription(subscription_id).await?;
        self.past_due(&current, token.clone(), self.clock.now())
            .await
    }

    /// End a subscription whose term ran out without auto-renew. No grace.
    #[instrument(skip(self), fields(subscription_id = %subscription_id))]
    pub async fn lapse(&self, subscription_id: Uuid) -> Result<TransitionOutcome, EngineError> {
        let current = self.get_subscription(subscription_id).await?;
        self.lapse_term(&current).await
    }

    pub(crate) async fn lapse_term(
        &self,
        current: &Subscription,
    ) -> Result<TransitionOutcome, EngineError> {
        let action = TransitionAction::Lapse;
        let subscription_id = current.subscription_id;
        let now = self.clock.now();
        let due = current
            .next_payment_date
            .filter(|due| *due <= now)
            .ok_or_else(|| {
                EngineError::Validation(format!(
                    "term of subscription {} has not ended",
                    subscription_id
                ))
            })?;
        let token = IdempotencyToken::derived("lapse", due);
        if let Some(replay) = self.replay(subscription_id, &token, action).await? {
            return Ok(replay);
        }
        self.ensure_permitted(current, action)?;

        if current.auto_renew {
            return Err(EngineError::Validation(format!(
                "subscription {} renews automatically",
                subscription_id
            )));
        }

        let mut next = current.clone();
        next.status = SubscriptionStatus::Expired;
        next.end_date = Some(due);
        next.next_payment_date = None;
        next.past_due_since = None;

        let period = self.close_open_period(subscription_id, now).await?;
        self.commit(current, action, token, next, period, now).await
    }

    /// Cancel a subscription. Auto-renew stops and no further payment is
    /// scheduled. Access continues to the end of the paid term, or stops now
    /// with `CancelEffective::Immediate`.
    #[instrument(skip(self), fields(subscription_id = %subscription_id, token = %token))]
    pub async fn cancel(
        &self,
        subscription_id: Uuid,
        effective: CancelEffective,
        token: &IdempotencyToken,
    ) -> Result<TransitionOutcome, EngineError> {
        let action = TransitionAction::Cancel;
        if let Some(replay) = self.replay(subscription_id, token, action).await? {
            return Ok(replay);
        }

        let current = self.get_subscription(subscription_id).await?;
        self.ensure_permitted(&current, action)?;

        let now = self.clock.now();
        let open = self.store.open_period(subscription_id).await?;

        let end = match effective {
            CancelEffective::Immediate => now,
            CancelEffective::EndOfPeriod => current
                .next_payment_date
                .or(open.as_ref().map(|p| p.period_end))
                .unwrap_or(now)
                .max(now),
        };

        let mut next = current.clone();
        next.status = SubscriptionStatus::Cancelled;
        next.auto_renew = false;
        next.next_payment_date = None;
        next.past_due_since = None;
        next.end_date = Some(end);

        let period = match (effective, open) {
            (CancelEffective::Immediate, Some(open)) => PeriodChange::Close {
                period_id: open.period_id,
                closed_at: now,
            },
            _ => PeriodChange::Keep,
        };

        self.commit(&current, action, token.clone(), next, period, now)
            .await
    }

    fn ensure_permitted(
        &self,
        current: &Subscription,
        action: TransitionAction,
    ) -> Result<(), EngineError> {
        if current.status.permits(action) {
            return Ok(());
        }
        metrics::record_transition(action.as_str(), "rejected");
        warn!(
            subscription_id = %current.subscription_id,
            status = %current.status,
            action = %action,
            "Transition not allowed"
        );
        Err(EngineError::InvalidTransition {
            from: current.status,
            action,
        })
    }

    fn ensure_activatable(
        &self,
        current: &Subscription,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let action = TransitionAction::Activate;
        self.ensure_permitted(current, action)?;

        if current.status == SubscriptionStatus::Expired {
            let in_grace = current
                .grace_until(self.policy.grace_period())
                .is_some_and(|until| now < until);
            if !in_grace {
                metrics::record_transition(action.as_str(), "rejected");
                return Err(EngineError::InvalidTransition {
                    from: current.status,
                    action,
                });
            }
        }

        Ok(())
    }

    /// Start a paid term at `term_start`. Activation re-anchors the billing
    /// day on the term start; renewal keeps the existing anchor.
    async fn apply_payment(
        &self,
        current: &Subscription,
        action: TransitionAction,
        token: IdempotencyToken,
        term_start: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome, EngineError> {
        let anchor = match action {
            TransitionAction::Renew => current.billing_anchor_day,
            _ => term_start.day(),
        };
        let next_due = current.terms.billing_cycle.advance(term_start, anchor);

        let mut next = current.clone();
        next.status = SubscriptionStatus::Active;
        next.billing_anchor_day = anchor;
        next.last_payment_date = Some(now);
        next.next_payment_date = Some(next_due);
        next.past_due_since = None;
        next.end_date = None;

        let new_period = NewPeriod::new(current.subscription_id, term_start, next_due);
        let period = match self.store.open_period(current.subscription_id).await? {
            Some(open) => PeriodChange::Roll {
                period_id: open.period_id,
                closed_at: now,
                next: new_period,
            },
            None => PeriodChange::Open(new_period),
        };

        self.commit(current, action, token, next, period, now).await
    }

    async fn past_due(
        &self,
        current: &Subscription,
        token: IdempotencyToken,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome, EngineError> {
        let action = TransitionAction::MarkPastDue;
        self.ensure_permitted(current, action)?;

        let mut next = current.clone();
        next.status = SubscriptionStatus::Expired;
        next.past_due_since = Some(now);
        next.next_payment_date = None;

        let period = self
            .close_open_period(current.subscription_id, now)
            .await?;
        self.commit(current, action, token, next, period, now).await
    }

    async fn close_open_period(
        &self,
        subscription_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<PeriodChange, EngineError> {
        Ok(match self.store.open_period(subscription_id).await? {
            Some(open) => PeriodChange::Close {
                period_id: open.period_id,
                closed_at: now,
            },
            None => PeriodChange::Keep,
        })
    }

    /// Charge one billing row and resolve it. Any transport error or timeout
    /// resolves the row as FAILED.
    async fn charge(
        &self,
        subscription: &Subscription,
        entry: BillingEntry,
    ) -> Result<BillingEntry, EngineError> {
        let request = ChargeRequest {
            subscription_id: subscription.subscription_id,
            billing_history_id: entry.billing_history_id,
            amount: entry.amount,
            currency: entry.currency.clone(),
            payment_method: entry.payment_method.clone(),
        };

        let timeout = self.policy.payment_timeout();
        let started = std::time::Instant::now();
        let result = tokio::time::timeout(timeout, self.gateway.charge(&request)).await;
        metrics::record_gateway_charge_duration(started.elapsed().as_secs_f64());

        let (status, reference) = match result {
            Ok(Ok(ChargeResult {
                status: ChargeStatus::Paid,
                reference,
                ..
            })) => (PaymentStatus::Paid, reference),
            Ok(Ok(ChargeResult {
                reference,
                failure_reason,
                ..
            })) => {
                warn!(reason = ?failure_reason, "Renewal charge declined");
                (PaymentStatus::Failed, reference)
            }
            Ok(Err(e)) => {
                metrics::record_error(e.kind(), "charge");
                warn!(error = %e, "Renewal charge failed");
                (PaymentStatus::Failed, None)
            }
            Err(_) => {
                metrics::record_error(EngineError::PaymentGatewayTimeout.kind(), "charge");
                warn!(timeout_secs = timeout.as_secs(), "Renewal charge timed out");
                (PaymentStatus::Failed, None)
            }
        };

        Ok(self
            .ledger
            .resolve_attempt(entry.billing_history_id, status, reference)
            .await?
            .entry)
    }

    async fn commit(
        &self,
        current: &Subscription,
        action: TransitionAction,
        token: IdempotencyToken,
        next: Subscription,
        period: PeriodChange,
        at: DateTime<Utc>,
    ) -> Result<TransitionOutcome, EngineError> {
        next.validate()?;

        let commit = TransitionCommit {
            action,
            token,
            from_status: current.status,
            expected_version: current.version,
            next,
            period,
            at,
        };

        match self.store.commit_transition(&commit).await {
            Ok(subscription) => {
                metrics::record_transition(action.as_str(), "applied");
                info!(
                    subscription_id = %subscription.subscription_id,
                    from = %current.status,
                    to = %subscription.status,
                    action = %action,
                    next_payment_date = ?subscription.next_payment_date,
                    "Subscription transition applied"
                );
                Ok(TransitionOutcome {
                    subscription,
                    replayed: false,
                })
            }
            Err(EngineError::DuplicateEvent { token }) => self
                .replay(current.subscription_id, &commit.token, action)
                .await?
                .ok_or(EngineError::DuplicateEvent { token }),
            Err(e) => {
                if matches!(e, EngineError::ConcurrencyConflict(_)) {
                    metrics::record_transition(action.as_str(), "conflict");
                }
                Err(e)
            }
        }
    }

    pub(crate) async fn replay(
        &self,
        subscription_id: Uuid,
        token: &IdempotencyToken,
        action: TransitionAction,
    ) -> Result<Option<TransitionOutcome>, EngineError> {
        let Some(record) = self.store.find_transition(subscription_id, token).await? else {
            return Ok(None);
        };

        metrics::record_transition(action.as_str(), "replayed");
        if record.action != action {
            warn!(
                subscription_id = %subscription_id,
                token = %token,
                recorded = %record.action,
                requested = %action,
                "Token already used for a different transition"
            );
        } else {
            info!(subscription_id = %subscription_id, token = %token, "Replayed transition");
        }

        Ok(Some(TransitionOutcome {
            subscription: record.snapshot,
            replayed: true,
        }))
    }
}

fn ensure_paid(payment: &BillingEntry, subscription_id: Uuid) -> Result<(), EngineError> {
    if payment.subscription_id != subscription_id {
        return Err(EngineError::Validation(format!(
            "billing history {} does not belong to subscription {}",
            payment.billing_history_id, subscription_id
        )));
    }
    if payment.status != PaymentStatus::Paid {
        return Err(EngineError::Validation(format!(
            "billing history {} is {}, not paid",
            payment.billing_history_id,
            payment.status.as_str()
        )));
    }
    Ok(())
}
