//! Payment gateway client.
//!
//! The engine only needs one call from a payment provider: charge an amount
//! against a stored payment method, keyed so that a retried charge for the
//! same billing attempt is never collected twice.

use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use service_core::observability::TracedClientExt;
use uuid::Uuid;

use crate::error::EngineError;

/// Charge request sent to the provider.
#[derive(Debug, Clone, Serialize)]
pub struct ChargeRequest {
    pub subscription_id: Uuid,
    pub billing_history_id: Uuid,
    pub amount: Decimal,
    pub currency: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_method: Option<String>,
}

impl ChargeRequest {
    /// Key the provider deduplicates on. One billing attempt, one charge.
    pub fn idempotency_key(&self) -> String {
        self.billing_history_id.to_string()
    }
}

/// Terminal charge status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChargeStatus {
    Paid,
    Failed,
}

/// Charge response from the provider.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ChargeResult {
    pub status: ChargeStatus,
    pub reference: Option<String>,
    #[serde(default)]
    pub failure_reason: Option<String>,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Charge `request.amount`. A declined card is `Ok` with
    /// `ChargeStatus::Failed`; transport problems are errors.
    async fn charge(&self, request: &ChargeRequest) -> Result<ChargeResult, EngineError>;
}

/// Provider error response.
#[derive(Debug, Deserialize)]
struct GatewayErrorBody {
    code: Option<String>,
    message: Option<String>,
}

/// JSON-over-HTTP gateway client.
#[derive(Clone)]
pub struct HttpPaymentGateway {
    client: Client,
    base_url: String,
}

impl HttpPaymentGateway {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl PaymentGateway for HttpPaymentGateway {
    async fn charge(&self, request: &ChargeRequest) -> Result<ChargeResult, EngineError> {
        let url = format!("{}/charges", self.base_url);

        let response = self
            .client
            .traced_post(&url)
            .header("Idempotency-Key", &request.idempotency_key())
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    EngineError::PaymentGatewayTimeout
                } else {
                    EngineError::PaymentGatewayFailure(format!("Request failed: {}", e))
                }
            })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| EngineError::PaymentGatewayFailure(format!("Unreadable response: {}", e)))?;

        tracing::debug!(status = %status, billing_history_id = %request.billing_history_id, "Gateway charge response");

        if status.is_success() {
            let result: ChargeResult = serde_json::from_str(&body).map_err(|e| {
                EngineError::PaymentGatewayFailure(format!("Malformed charge response: {}", e))
            })?;
            tracing::info!(
                billing_history_id = %request.billing_history_id,
                status = ?result.status,
                reference = ?result.reference,
                "Gateway charge completed"
            );
            Ok(result)
        } else if status == reqwest::StatusCode::PAYMENT_REQUIRED {
            // Declined: a definite outcome, not a transport error
            let error: Option<GatewayErrorBody> = serde_json::from_str(&body).ok();
            Ok(ChargeResult {
                status: ChargeStatus::Failed,
                reference: None,
                failure_reason: error.and_then(|e| e.message),
            })
        } else {
            let error: GatewayErrorBody =
                serde_json::from_str(&body).unwrap_or_else(|_| GatewayErrorBody {
                    code: None,
                    message: Some(body.clone()),
                });
            tracing::error!(
                status = %status,
                code = ?error.code,
                message = ?error.message,
                "Gateway charge failed"
            );
            Err(EngineError::PaymentGatewayFailure(format!(
                "{}: {}",
                error.code.unwrap_or_else(|| status.to_string()),
                error.message.unwrap_or_default()
            )))
        }
    }
}
