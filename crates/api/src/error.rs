//! API error types and handling

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use rebill_billing::BillingError;

/// Application error type
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    // Authentication errors
    #[error("Invalid or expired token")]
    InvalidToken,
    #[error("Authentication required")]
    Unauthorized,
    #[error("Insufficient permissions")]
    Forbidden,

    // Validation errors
    #[error("Invalid request: {0}")]
    BadRequest(String),

    // Resource errors
    #[error("Resource not found")]
    NotFound,
    #[error("Conflict: {0}")]
    Conflict(String),

    // Billing errors
    #[error("Payment failed: {0}")]
    PaymentFailed(String),
    #[error("Refund rejected: {0}")]
    RefundRejected(String),

    // Internal errors
    #[error("Database error: {0}")]
    Database(String),
    #[error("Internal server error")]
    Internal,
    #[error("Service unavailable")]
    ServiceUnavailable,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            ApiError::InvalidToken => (StatusCode::UNAUTHORIZED, "INVALID_TOKEN", self.to_string()),
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", self.to_string()),
            ApiError::Forbidden => (StatusCode::FORBIDDEN, "FORBIDDEN", self.to_string()),

            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),

            ApiError::NotFound => (StatusCode::NOT_FOUND, "NOT_FOUND", self.to_string()),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg.clone()),

            ApiError::PaymentFailed(msg) => {
                (StatusCode::PAYMENT_REQUIRED, "PAYMENT_FAILED", msg.clone())
            }
            ApiError::RefundRejected(msg) => {
                (StatusCode::BAD_REQUEST, "REFUND_REJECTED", msg.clone())
            }

            ApiError::Database(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "DATABASE_ERROR",
                "Database error".to_string(),
            ),
            ApiError::Internal => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                self.to_string(),
            ),
            ApiError::ServiceUnavailable => (
                StatusCode::SERVICE_UNAVAILABLE,
                "SERVICE_UNAVAILABLE",
                self.to_string(),
            ),
        };

        let body = Json(json!({
            "error": {
                "code": code,
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}

impl From<BillingError> for ApiError {
    fn from(err: BillingError) -> Self {
        match err {
            BillingError::SubscriptionNotFound(_)
            | BillingError::TransactionNotFound(_)
            | BillingError::RefundNotFound(_) => ApiError::NotFound,
            BillingError::NotOwner => ApiError::Forbidden,
            BillingError::InvalidInput(msg) => ApiError::BadRequest(msg),
            BillingError::OverRefund { .. } => ApiError::RefundRejected(err.to_string()),
            BillingError::RefundRetriesExhausted(_) => ApiError::RefundRejected(err.to_string()),
            BillingError::ChargeFailed(code) => ApiError::PaymentFailed(code.to_string()),
            BillingError::Gateway(msg) => ApiError::PaymentFailed(msg),
            BillingError::GatewayTimeout => ApiError::ServiceUnavailable,
            BillingError::WebhookSignatureInvalid => ApiError::Unauthorized,
            BillingError::MalformedPayload(msg) => ApiError::BadRequest(msg),
            BillingError::Consistency(msg) | BillingError::ConcurrentModification(msg) => {
                ApiError::Conflict(msg)
            }
            BillingError::Database(msg) => ApiError::Database(msg),
            BillingError::Config(_) | BillingError::Internal(_) => ApiError::Internal,
        }
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        ApiError::Database(err.to_string())
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
