//! Plan catalog.

use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::config::BillingPolicy;
use crate::error::EngineError;
use crate::models::{CreatePlan, ListPlansFilter, Plan, PlanTerms, UpdatePlan};
use crate::services::{Clock, EngineStore};

/// Reads and administers plan definitions.
///
/// Plan edits only affect subscriptions started afterwards: a subscription
/// carries the `PlanTerms` it was started with.
#[derive(Clone)]
pub struct PlanCatalog {
    store: Arc<dyn EngineStore>,
    clock: Arc<dyn Clock>,
    policy: Arc<BillingPolicy>,
}

impl PlanCatalog {
    pub fn new(
        store: Arc<dyn EngineStore>,
        clock: Arc<dyn Clock>,
        policy: Arc<BillingPolicy>,
    ) -> Self {
        Self {
            store,
            clock,
            policy,
        }
    }

    #[instrument(skip(self, input), fields(name = %input.name))]
    pub async fn create_plan(&self, input: &CreatePlan) -> Result<Plan, EngineError> {
        let name = input.name.trim();
        if name.is_empty() {
            return Err(EngineError::Validation("plan name must not be empty".to_string()));
        }
        validate_price(input.price)?;

        let currency = if input.currency.trim().is_empty() {
            self.policy.default_currency.clone()
        } else {
            input.currency.trim().to_ascii_uppercase()
        };
        validate_currency(&currency)?;

        let now = self.clock.now();
        let plan = Plan {
            plan_id: Uuid::new_v4(),
            name: name.to_string(),
            description: input.description.clone(),
            price: input.price,
            currency,
            billing_cycle: input.billing_cycle,
            features: input.features.clone(),
            limits: input.limits.clone(),
            is_active: true,
            created_utc: now,
            updated_utc: now,
        };

        let plan = self.store.insert_plan(&plan).await?;
        info!(plan_id = %plan.plan_id, name = %plan.name, cycle = %plan.billing_cycle, "Plan created");

        Ok(plan)
    }

    pub async fn get_plan(&self, plan_id: Uuid) -> Result<Plan, EngineError> {
        self.store
            .get_plan(plan_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("plan {}", plan_id)))
    }

    pub async fn list_plans(&self, filter: &ListPlansFilter) -> Result<Vec<Plan>, EngineError> {
        self.store.list_plans(filter).await
    }

    #[instrument(skip(self, input), fields(plan_id = %plan_id))]
    pub async fn update_plan(&self, plan_id: Uuid, input: &UpdatePlan) -> Result<Plan, EngineError> {
        if let Some(price) = input.price {
            validate_price(price)?;
        }
        if input.name.as_deref().is_some_and(|n| n.trim().is_empty()) {
            return Err(EngineError::Validation("plan name must not be empty".to_string()));
        }

        let plan = self
            .store
            .update_plan(plan_id, input, self.clock.now())
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("plan {}", plan_id)))?;

        info!(plan_id = %plan.plan_id, "Plan updated");
        Ok(plan)
    }

    /// Stop offering a plan. Existing subscriptions keep their terms.
    #[instrument(skip(self), fields(plan_id = %plan_id))]
    pub async fn deactivate_plan(&self, plan_id: Uuid) -> Result<Plan, EngineError> {
        let plan = self
            .store
            .set_plan_active(plan_id, false, self.clock.now())
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("plan {}", plan_id)))?;

        info!(plan_id = %plan.plan_id, "Plan deactivated");
        Ok(plan)
    }

    /// Snapshot of a plan for a new subscription, with configured default
    /// limits filled in for resources the plan leaves unset.
    pub fn terms_for(&self, plan: &Plan) -> PlanTerms {
        PlanTerms {
            plan_id: plan.plan_id,
            plan_name: plan.name.clone(),
            price: plan.price,
            currency: plan.currency.clone(),
            billing_cycle: plan.billing_cycle,
            limits: plan.limits.with_defaults(&self.policy.default_limits),
            features: plan.features.clone(),
        }
    }
}

fn validate_price(price: Decimal) -> Result<(), EngineError> {
    if price.is_sign_negative() {
        return Err(EngineError::Validation(format!(
            "plan price must not be negative, got {}",
            price
        )));
    }
    Ok(())
}

fn validate_currency(currency: &str) -> Result<(), EngineError> {
    if currency.len() != 3 || !currency.chars().all(|c| c.is_ascii_uppercase()) {
        return Err(EngineError::Validation(format!(
            "currency must be a three-letter code, got '{}'",
            currency
        )));
    }
    Ok(())
}
