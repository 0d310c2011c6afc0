//! Billing history model.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::plan::PlanTerms;

/// Payment status of a billing history row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Paid,
    Failed,
    Refunded,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Paid => "paid",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Refunded => "refunded",
        }
    }

    pub fn from_string(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Some(PaymentStatus::Pending),
            "paid" | "succeeded" => Some(PaymentStatus::Paid),
            "failed" => Some(PaymentStatus::Failed),
            "refunded" => Some(PaymentStatus::Refunded),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, PaymentStatus::Pending)
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One payment attempt. The plan name and amount are copied at charge time
/// so later plan edits leave history untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillingEntry {
    pub billing_history_id: Uuid,
    pub subscription_id: Uuid,
    pub attempt_key: String,
    pub plan_name: String,
    pub amount: Decimal,
    pub currency: String,
    pub status: PaymentStatus,
    pub paid_at: Option<DateTime<Utc>>,
    pub payment_method: Option<String>,
    pub payment_reference: Option<String>,
    pub invoice_reference: Option<String>,
    pub created_utc: DateTime<Utc>,
    pub resolved_utc: Option<DateTime<Utc>>,
}

/// Input for recording a pending attempt.
#[derive(Debug, Clone)]
pub struct NewBillingEntry {
    pub subscription_id: Uuid,
    /// Identifies the billing cycle being charged; one row per key.
    pub attempt_key: String,
    pub plan_name: String,
    pub amount: Decimal,
    pub currency: String,
    pub payment_method: Option<String>,
    pub invoice_reference: Option<String>,
}

impl NewBillingEntry {
    pub fn for_terms(
        subscription_id: Uuid,
        attempt_key: impl Into<String>,
        terms: &PlanTerms,
        payment_method: Option<String>,
    ) -> Self {
        Self {
            subscription_id,
            attempt_key: attempt_key.into(),
            plan_name: terms.plan_name.clone(),
            amount: terms.price,
            currency: terms.currency.clone(),
            payment_method,
            invoice_reference: None,
        }
    }
}

/// Terminal outcome applied to a pending row.
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptResolution {
    pub status: PaymentStatus,
    pub payment_reference: Option<String>,
    pub resolved_at: DateTime<Utc>,
}

/// Result of resolving an attempt. `applied` is false when the row was
/// already terminal and the existing outcome was returned.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolveOutcome {
    pub entry: BillingEntry,
    pub applied: bool,
}

/// A payment outcome delivered by the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentOutcome {
    /// Provider event id, used as the idempotency token.
    pub event_id: String,
    pub billing_history_id: Uuid,
    pub status: PaymentStatus,
    pub reference: Option<String>,
}
