//! Engine error taxonomy.

use service_core::error::AppError;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{Resource, SubscriptionStatus, TransitionAction};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Quota exceeded for {resource}: requested {requested}, remaining {remaining}")]
    QuotaExceeded {
        resource: Resource,
        requested: u64,
        remaining: u64,
    },

    #[error("No active usage period for subscription {subscription_id}")]
    NoActivePeriod { subscription_id: Uuid },

    #[error("Cannot {action} a subscription in status {from}")]
    InvalidTransition {
        from: SubscriptionStatus,
        action: TransitionAction,
    },

    #[error("Event {token} was already processed")]
    DuplicateEvent { token: String },

    #[error("Payment gateway timed out")]
    PaymentGatewayTimeout,

    #[error("Payment gateway failure: {0}")]
    PaymentGatewayFailure(String),

    #[error("Concurrent modification of {0}")]
    ConcurrencyConflict(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Owner {0} already has a live subscription")]
    OwnerAlreadySubscribed(String),

    #[error("Deadline exceeded during {operation}")]
    DeadlineExceeded { operation: &'static str },

    #[error("Storage error: {0}")]
    Storage(anyhow::Error),

    #[error("Configuration error: {0}")]
    Config(anyhow::Error),
}

impl EngineError {
    /// Whether the caller may retry the same call unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::NoActivePeriod { .. }
                | EngineError::PaymentGatewayTimeout
                | EngineError::ConcurrencyConflict(_)
                | EngineError::DeadlineExceeded { .. }
                | EngineError::Storage(_)
        )
    }

    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::QuotaExceeded { .. } => "quota_exceeded",
            EngineError::NoActivePeriod { .. } => "no_active_period",
            EngineError::InvalidTransition { .. } => "invalid_transition",
            EngineError::DuplicateEvent { .. } => "duplicate_event",
            EngineError::PaymentGatewayTimeout => "gateway_timeout",
            EngineError::PaymentGatewayFailure(_) => "gateway_failure",
            EngineError::ConcurrencyConflict(_) => "concurrency_conflict",
            EngineError::NotFound(_) => "not_found",
            EngineError::Validation(_) => "validation",
            EngineError::OwnerAlreadySubscribed(_) => "owner_already_subscribed",
            EngineError::DeadlineExceeded { .. } => "deadline_exceeded",
            EngineError::Storage(_) => "storage",
            EngineError::Config(_) => "config",
        }
    }
}

impl From<EngineError> for AppError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::QuotaExceeded { .. } => AppError::TooManyRequests(err.to_string(), None),
            EngineError::NoActivePeriod { .. } => AppError::Conflict(anyhow::anyhow!("{}", err)),
            EngineError::InvalidTransition { .. } | EngineError::Validation(_) => {
                AppError::BadRequest(anyhow::anyhow!("{}", err))
            }
            EngineError::DuplicateEvent { .. }
            | EngineError::ConcurrencyConflict(_)
            | EngineError::OwnerAlreadySubscribed(_) => {
                AppError::Conflict(anyhow::anyhow!("{}", err))
            }
            EngineError::NotFound(_) => AppError::NotFound(anyhow::anyhow!("{}", err)),
            EngineError::PaymentGatewayTimeout | EngineError::DeadlineExceeded { .. } => {
                AppError::ServiceUnavailable
            }
            EngineError::PaymentGatewayFailure(msg) => AppError::BadGateway(msg),
            EngineError::Storage(e) => AppError::DatabaseError(e),
            EngineError::Config(e) => AppError::ConfigError(e),
        }
    }
}

impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        EngineError::Storage(anyhow::Error::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(EngineError::PaymentGatewayTimeout.is_retryable());
        assert!(EngineError::ConcurrencyConflict("subscription".into()).is_retryable());
        assert!(EngineError::NoActivePeriod {
            subscription_id: Uuid::nil()
        }
        .is_retryable());
        assert!(!EngineError::QuotaExceeded {
            resource: Resource::ApiCalls,
            requested: 1,
            remaining: 0
        }
        .is_retryable());
        assert!(!EngineError::InvalidTransition {
            from: SubscriptionStatus::Cancelled,
            action: TransitionAction::Renew
        }
        .is_retryable());
    }

    #[test]
    fn quota_maps_to_too_many_requests() {
        let app: AppError = EngineError::QuotaExceeded {
            resource: Resource::Projects,
            requested: 2,
            remaining: 1,
        }
        .into();
        assert!(matches!(app, AppError::TooManyRequests(_, None)));
    }
}
