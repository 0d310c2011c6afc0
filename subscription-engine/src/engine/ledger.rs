//! Billing ledger writer.

use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::error::EngineError;
use crate::models::{
    AttemptResolution, BillingEntry, NewBillingEntry, PaymentStatus, ResolveOutcome,
};
use crate::services::{metrics, Clock, EngineStore};

/// Appends payment attempts and resolves each one exactly once.
#[derive(Clone)]
pub struct BillingLedger {
    store: Arc<dyn EngineStore>,
    clock: Arc<dyn Clock>,
}

impl BillingLedger {
    pub fn new(store: Arc<dyn EngineStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Append a pending attempt for one billing cycle.
    ///
    /// Each `attempt_key` identifies a cycle; recording the same cycle again
    /// returns the row already written instead of adding a second one.
    #[instrument(skip(self, entry), fields(subscription_id = %entry.subscription_id, attempt_key = %entry.attempt_key))]
    pub async fn record_attempt(&self, entry: &NewBillingEntry) -> Result<BillingEntry, EngineError> {
        if entry.amount.is_sign_negative() {
            return Err(EngineError::Validation(format!(
                "billing amount must not be negative, got {}",
                entry.amount
            )));
        }

        let row = self.store.record_attempt(entry, self.clock.now()).await?;

        info!(
            billing_history_id = %row.billing_history_id,
            amount = %row.amount,
            currency = %row.currency,
            status = %row.status,
            "Billing attempt recorded"
        );

        Ok(row)
    }

    /// Move a pending attempt to a terminal status.
    ///
    /// A repeated resolution leaves the row alone and returns the status it
    /// already has, so duplicate webhook deliveries are harmless.
    #[instrument(skip(self, reference), fields(billing_history_id = %billing_history_id, status = %status))]
    pub async fn resolve_attempt(
        &self,
        billing_history_id: Uuid,
        status: PaymentStatus,
        reference: Option<String>,
    ) -> Result<ResolveOutcome, EngineError> {
        if !status.is_terminal() {
            return Err(EngineError::Validation(
                "an attempt can only be resolved to paid, failed or refunded".to_string(),
            ));
        }

        let resolution = AttemptResolution {
            status,
            payment_reference: reference,
            resolved_at: self.clock.now(),
        };
        let outcome = self
            .store
            .resolve_attempt(billing_history_id, &resolution)
            .await?;

        if outcome.applied {
            metrics::record_billing_attempt(outcome.entry.status.as_str());
            info!(status = %outcome.entry.status, "Billing attempt resolved");
        } else if outcome.entry.status != status {
            warn!(
                existing = %outcome.entry.status,
                requested = %status,
                "Billing attempt already resolved with a different status"
            );
        }

        Ok(outcome)
    }

    pub async fn get(&self, billing_history_id: Uuid) -> Result<BillingEntry, EngineError> {
        self.store
            .get_entry(billing_history_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("billing history {}", billing_history_id)))
    }

    /// All attempts of a subscription, oldest first.
    pub async fn history(&self, subscription_id: Uuid) -> Result<Vec<BillingEntry>, EngineError> {
        self.store.list_entries(subscription_id).await
    }
}
