//! Subscription model.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::owner::Owner;
use super::plan::PlanTerms;
use crate::error::EngineError;

/// Subscription status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Trial,
    Active,
    Expired,
    Cancelled,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Trial => "trial",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Expired => "expired",
            SubscriptionStatus::Cancelled => "cancelled",
        }
    }

    /// Whether `action` may start from this status.
    ///
    /// | From      | Allowed actions                          |
    /// |-----------|------------------------------------------|
    /// | Trial     | activate, renew, mark_past_due, lapse, cancel |
    /// | Active    | renew, mark_past_due, lapse, cancel      |
    /// | Expired   | activate (inside the grace window)       |
    /// | Cancelled | none                                     |
    pub fn permits(&self, action: TransitionAction) -> bool {
        use SubscriptionStatus::*;
        use TransitionAction as A;

        match self {
            Trial => matches!(
                action,
                A::Activate | A::Renew | A::MarkPastDue | A::Lapse | A::Cancel
            ),
            Active => matches!(action, A::Renew | A::MarkPastDue | A::Lapse | A::Cancel),
            Expired => matches!(action, A::Activate),
            Cancelled => false,
        }
    }

    /// Live subscriptions still follow the billing schedule.
    pub fn is_live(&self) -> bool {
        matches!(self, SubscriptionStatus::Trial | SubscriptionStatus::Active)
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// State machine actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TransitionAction {
    StartTrial,
    Activate,
    Renew,
    MarkPastDue,
    Lapse,
    Cancel,
}

impl TransitionAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransitionAction::StartTrial => "start_trial",
            TransitionAction::Activate => "activate",
            TransitionAction::Renew => "renew",
            TransitionAction::MarkPastDue => "mark_past_due",
            TransitionAction::Lapse => "lapse",
            TransitionAction::Cancel => "cancel",
        }
    }
}

impl fmt::Display for TransitionAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// When a cancellation takes effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelEffective {
    Immediate,
    EndOfPeriod,
}

impl CancelEffective {
    pub fn from_string(s: &str) -> Option<Self> {
        match s {
            "immediate" => Some(CancelEffective::Immediate),
            "end_of_period" => Some(CancelEffective::EndOfPeriod),
            _ => None,
        }
    }
}

/// Access a collaborator should grant at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Full,
    Grace { until: DateTime<Utc> },
    Ended,
}

/// Caller- or provider-supplied key that makes a transition safe to retry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyToken(String);

impl IdempotencyToken {
    const MAX_LEN: usize = 200;

    pub fn new(value: impl Into<String>) -> Result<Self, EngineError> {
        let value = value.into();
        if value.trim().is_empty() {
            return Err(EngineError::Validation(
                "idempotency token must not be empty".to_string(),
            ));
        }
        if value.len() > Self::MAX_LEN {
            return Err(EngineError::Validation(format!(
                "idempotency token exceeds {} characters",
                Self::MAX_LEN
            )));
        }
        Ok(Self(value))
    }

    /// Token for engine-initiated transitions, e.g. `renewal:<due date>`.
    pub fn derived(kind: &str, at: DateTime<Utc>) -> Self {
        Self(format!("{}:{}", kind, at.to_rfc3339()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdempotencyToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub subscription_id: Uuid,
    pub owner: Owner,
    pub plan_id: Uuid,
    pub terms: PlanTerms,
    pub status: SubscriptionStatus,
    pub start_date: DateTime<Utc>,
    pub end_date: Option<DateTime<Utc>>,
    pub trial_end_date: Option<DateTime<Utc>>,
    pub auto_renew: bool,
    pub billing_anchor_day: u32,
    pub last_payment_date: Option<DateTime<Utc>>,
    pub next_payment_date: Option<DateTime<Utc>>,
    pub past_due_since: Option<DateTime<Utc>>,
    pub payment_method: Option<String>,
    pub version: i64,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl Subscription {
    /// Check that status and dates agree with each other.
    pub fn validate(&self) -> Result<(), EngineError> {
        let fail = |msg: &str| {
            Err(EngineError::Validation(format!(
                "subscription {}: {}",
                self.subscription_id, msg
            )))
        };

        match self.status {
            SubscriptionStatus::Trial => {
                if self.next_payment_date.is_none() || self.trial_end_date.is_none() {
                    return fail("trial requires a trial end and next payment date");
                }
            }
            SubscriptionStatus::Active => {
                if self.next_payment_date.is_none() {
                    return fail("active subscription requires a next payment date");
                }
            }
            SubscriptionStatus::Cancelled => {
                if self.next_payment_date.is_some() {
                    return fail("cancelled subscription must not schedule a payment");
                }
                if self.end_date.is_none() {
                    return fail("cancelled subscription requires an end date");
                }
                if self.auto_renew {
                    return fail("cancelled subscription must not auto-renew");
                }
            }
            SubscriptionStatus::Expired => {}
        }

        if let Some(end) = self.end_date {
            if end < self.start_date {
                return fail("end date precedes start date");
            }
        }

        Ok(())
    }

    /// Whether a renewal charge is due at `now`.
    pub fn renewal_due_at(&self, now: DateTime<Utc>) -> bool {
        self.status.is_live()
            && self.auto_renew
            && self.next_payment_date.is_some_and(|due| now >= due)
    }

    /// End of the grace window after a failed renewal.
    pub fn grace_until(&self, grace: Duration) -> Option<DateTime<Utc>> {
        match self.status {
            SubscriptionStatus::Expired => self.past_due_since.map(|since| since + grace),
            _ => None,
        }
    }

    pub fn access_at(&self, now: DateTime<Utc>, grace: Duration) -> Access {
        match self.status {
            SubscriptionStatus::Trial | SubscriptionStatus::Active => Access::Full,
            SubscriptionStatus::Cancelled => match self.end_date {
                Some(end) if now < end => Access::Full,
                _ => Access::Ended,
            },
            SubscriptionStatus::Expired => match self.grace_until(grace) {
                Some(until) if now < until => Access::Grace { until },
                _ => Access::Ended,
            },
        }
    }
}

/// Input for starting a trial.
#[derive(Debug, Clone)]
pub struct StartTrial {
    pub owner: Owner,
    pub plan_id: Uuid,
    pub auto_renew: bool,
    pub payment_method: Option<String>,
    pub token: IdempotencyToken,
}

/// A committed transition, kept so that a replayed token returns the
/// original result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub subscription_id: Uuid,
    pub token: IdempotencyToken,
    pub action: TransitionAction,
    pub from_status: Option<SubscriptionStatus>,
    pub snapshot: Subscription,
    pub recorded_utc: DateTime<Utc>,
}

/// Filter parameters for listing subscriptions.
#[derive(Debug, Clone, Default)]
pub struct ListSubscriptionsFilter {
    pub owner: Option<Owner>,
    pub status: Option<SubscriptionStatus>,
    pub plan_id: Option<Uuid>,
    pub page_size: i32,
    pub page_token: Option<Uuid>,
}
