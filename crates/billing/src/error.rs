//! Billing error types

use thiserror::Error;

/// Billing-specific errors
///
/// Split along the retry policy the caller must apply: validation errors are
/// rejected synchronously and never retried, transient errors go back through
/// the relevant backoff schedule, permanent payment errors disable auto-renew,
/// and consistency violations are logged for manual reconciliation without
/// crashing the batch that hit them.
#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Subscription not found: {0}")]
    SubscriptionNotFound(String),

    #[error("Transaction not found: {0}")]
    TransactionNotFound(String),

    #[error("Refund not found: {0}")]
    RefundNotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not the owner of this transaction")]
    NotOwner,

    #[error("Refund amount ({requested_cents} cents) would exceed refundable amount ({available_cents} cents)")]
    OverRefund {
        requested_cents: i64,
        available_cents: i64,
    },

    #[error("Refund retry limit reached ({0} attempts)")]
    RefundRetriesExhausted(i32),

    #[error("Charge failed: {0}")]
    ChargeFailed(crate::gateway::FailureCode),

    #[error("Gateway error: {0}")]
    Gateway(String),

    #[error("Gateway call timed out")]
    GatewayTimeout,

    #[error("Webhook signature verification failed")]
    WebhookSignatureInvalid,

    #[error("Malformed webhook payload: {0}")]
    MalformedPayload(String),

    #[error("Consistency violation: {0}")]
    Consistency(String),

    #[error("Concurrent modification detected: {0}")]
    ConcurrentModification(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BillingError {
    /// Whether this error should be retried with backoff.
    ///
    /// Validation, ownership, and permanent-payment failures are excluded;
    /// consistency violations are surfaced for manual handling, not retried.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BillingError::GatewayTimeout
                | BillingError::Gateway(_)
                | BillingError::Database(_)
                | BillingError::ConcurrentModification(_)
        )
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::Database(err.to_string())
    }
}

impl From<reqwest::Error> for BillingError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            BillingError::GatewayTimeout
        } else {
            BillingError::Gateway(err.to_string())
        }
    }
}

pub type BillingResult<T> = Result<T, BillingError>;
