//! Payment gateway adapter
//!
//! A single interface over the two payment rails (card processor and
//! mobile-money operator). Each rail translates its own decline codes into the
//! shared [`FailureCode`] taxonomy so that every caller (scheduler, webhook
//! engine, refund workflow) applies the same
//! retry/permanent-failure policy regardless of which rail produced the
//! outcome.
//!
//! Expected failures (declined card, insufficient wallet balance) are values,
//! not errors: they come back as [`Outcome::Failed`]. `Err` is reserved for
//! transport problems talking to the rail.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use rebill_shared::GatewayKind;

use crate::error::{BillingError, BillingResult};

/// Bounded timeout for any single gateway call. A call that exceeds this is
/// treated as a transient failure eligible for retry.
const GATEWAY_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared failure taxonomy across both rails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum FailureCode {
    Declined,
    InsufficientFunds,
    ExpiredInstrument,
    InvalidRecipient,
    TransientError,
}

impl FailureCode {
    /// Permanent failures disable auto-renew immediately; the rest are
    /// retried on the scheduler's backoff ladder.
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::ExpiredInstrument | Self::InvalidRecipient)
    }

    /// Human-readable reason recorded on the subscription
    pub fn as_reason(&self) -> &'static str {
        match self {
            Self::Declined => "declined",
            Self::InsufficientFunds => "insufficient_funds",
            Self::ExpiredInstrument => "expired_instrument",
            Self::InvalidRecipient => "invalid_recipient",
            Self::TransientError => "transient_error",
        }
    }
}

impl std::fmt::Display for FailureCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_reason())
    }
}

/// Result of a charge or refund attempt, as a closed variant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum Outcome {
    /// The rail accepted the operation and assigned a reference
    Succeeded { reference: String },
    /// The rail needs the subscriber to act (e.g. wallet PIN prompt);
    /// resolution arrives later via webhook
    RequiresAction,
    /// The rail rejected the operation
    Failed { code: FailureCode },
}

/// A charge to attempt against a rail
#[derive(Debug, Clone, Serialize)]
pub struct ChargeRequest {
    pub idempotency_key: String,
    pub amount_cents: i64,
    pub currency: String,
    /// Rail-specific instrument reference (card token or wallet MSISDN ref)
    pub payment_instrument: String,
}

/// A refund to attempt against a rail
#[derive(Debug, Clone, Serialize)]
pub struct RefundRequest {
    pub idempotency_key: String,
    /// Gateway reference of the original charge being refunded
    pub original_reference: String,
    pub amount_cents: i64,
}

/// Uniform interface over the payment rails
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn charge(&self, request: &ChargeRequest) -> BillingResult<Outcome>;
    async fn refund(&self, request: &RefundRequest) -> BillingResult<Outcome>;
}

/// Connection settings for both rails
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub card_base_url: String,
    pub card_api_key: String,
    pub momo_base_url: String,
    pub momo_api_key: String,
}

impl GatewayConfig {
    /// Create config from environment variables
    pub fn from_env() -> BillingResult<Self> {
        Ok(Self {
            card_base_url: std::env::var("CARD_GATEWAY_URL")
                .map_err(|_| BillingError::Config("CARD_GATEWAY_URL not set".to_string()))?,
            card_api_key: std::env::var("CARD_GATEWAY_API_KEY")
                .map_err(|_| BillingError::Config("CARD_GATEWAY_API_KEY not set".to_string()))?,
            momo_base_url: std::env::var("MOMO_GATEWAY_URL")
                .map_err(|_| BillingError::Config("MOMO_GATEWAY_URL not set".to_string()))?,
            momo_api_key: std::env::var("MOMO_GATEWAY_API_KEY")
                .map_err(|_| BillingError::Config("MOMO_GATEWAY_API_KEY not set".to_string()))?,
        })
    }
}

/// Wire shape returned by both rail APIs
#[derive(Debug, Deserialize)]
struct RailResponse {
    status: String,
    reference: Option<String>,
    error_code: Option<String>,
}

/// Card-network rail
pub struct CardGateway {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl CardGateway {
    pub fn new(client: reqwest::Client, base_url: String, api_key: String) -> Self {
        Self {
            client,
            base_url,
            api_key,
        }
    }

    /// Map the card processor's decline codes onto the shared taxonomy
    fn map_error_code(code: &str) -> FailureCode {
        match code {
            "card_declined" | "do_not_honor" | "fraud_suspected" => FailureCode::Declined,
            "insufficient_funds" => FailureCode::InsufficientFunds,
            "expired_card" | "invalid_card" => FailureCode::ExpiredInstrument,
            "invalid_account" | "no_such_account" => FailureCode::InvalidRecipient,
            _ => FailureCode::TransientError,
        }
    }

    async fn post(&self, path: &str, body: &impl Serialize) -> BillingResult<Outcome> {
        let response = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .bearer_auth(&self.api_key)
            .timeout(GATEWAY_TIMEOUT)
            .json(body)
            .send()
            .await?;

        if response.status().is_server_error() {
            return Err(BillingError::Gateway(format!(
                "card rail returned {}",
                response.status()
            )));
        }

        let parsed: RailResponse = response.json().await?;
        Ok(interpret_rail_response(parsed, Self::map_error_code))
    }
}

#[async_trait]
impl PaymentGateway for CardGateway {
    async fn charge(&self, request: &ChargeRequest) -> BillingResult<Outcome> {
        self.post("/v1/charges", request).await
    }

    async fn refund(&self, request: &RefundRequest) -> BillingResult<Outcome> {
        self.post("/v1/refunds", request).await
    }
}

/// Mobile-money rail
pub struct MobileMoneyGateway {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl MobileMoneyGateway {
    pub fn new(client: reqwest::Client, base_url: String, api_key: String) -> Self {
        Self {
            client,
            base_url,
            api_key,
        }
    }

    /// Map the mobile-money operator's result codes onto the shared taxonomy
    fn map_error_code(code: &str) -> FailureCode {
        match code {
            "PAYER_REJECTED" | "PAYMENT_REFUSED" => FailureCode::Declined,
            "NOT_ENOUGH_FUNDS" | "PAYER_LIMIT_REACHED" => FailureCode::InsufficientFunds,
            "ACCOUNT_CLOSED" | "WALLET_SUSPENDED" => FailureCode::ExpiredInstrument,
            "INVALID_MSISDN" | "PAYEE_NOT_FOUND" => FailureCode::InvalidRecipient,
            _ => FailureCode::TransientError,
        }
    }

    async fn post(&self, path: &str, body: &impl Serialize) -> BillingResult<Outcome> {
        let response = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .header("X-Api-Key", &self.api_key)
            .timeout(GATEWAY_TIMEOUT)
            .json(body)
            .send()
            .await?;

        if response.status().is_server_error() {
            return Err(BillingError::Gateway(format!(
                "mobile-money rail returned {}",
                response.status()
            )));
        }

        let parsed: RailResponse = response.json().await?;
        Ok(interpret_rail_response(parsed, Self::map_error_code))
    }
}

#[async_trait]
impl PaymentGateway for MobileMoneyGateway {
    async fn charge(&self, request: &ChargeRequest) -> BillingResult<Outcome> {
        self.post("/collections", request).await
    }

    async fn refund(&self, request: &RefundRequest) -> BillingResult<Outcome> {
        self.post("/disbursements", request).await
    }
}

/// Interpret a rail response, using the rail's own error-code mapping
fn interpret_rail_response(
    parsed: RailResponse,
    map_code: fn(&str) -> FailureCode,
) -> Outcome {
    match parsed.status.as_str() {
        "succeeded" | "accepted" => match parsed.reference {
            Some(reference) => Outcome::Succeeded { reference },
            // A success without a reference is unusable downstream; treat as
            // transient so the attempt is retried and reconciled by webhook.
            None => Outcome::Failed {
                code: FailureCode::TransientError,
            },
        },
        "requires_action" | "pending_approval" => Outcome::RequiresAction,
        _ => Outcome::Failed {
            code: parsed
                .error_code
                .as_deref()
                .map(map_code)
                .unwrap_or(FailureCode::TransientError),
        },
    }
}

/// Routes an operation to the rail the subscription is billed through
pub struct GatewayRouter {
    card: CardGateway,
    momo: MobileMoneyGateway,
}

impl GatewayRouter {
    pub fn new(config: GatewayConfig) -> Self {
        let client = reqwest::Client::new();
        Self {
            card: CardGateway::new(
                client.clone(),
                config.card_base_url,
                config.card_api_key,
            ),
            momo: MobileMoneyGateway::new(client, config.momo_base_url, config.momo_api_key),
        }
    }

    pub fn rail(&self, kind: GatewayKind) -> &dyn PaymentGateway {
        match kind {
            GatewayKind::Card => &self.card,
            GatewayKind::MobileMoney => &self.momo,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permanent_codes() {
        assert!(FailureCode::ExpiredInstrument.is_permanent());
        assert!(FailureCode::InvalidRecipient.is_permanent());
        assert!(!FailureCode::Declined.is_permanent());
        assert!(!FailureCode::InsufficientFunds.is_permanent());
        assert!(!FailureCode::TransientError.is_permanent());
    }

    #[test]
    fn test_card_code_mapping() {
        assert_eq!(
            CardGateway::map_error_code("card_declined"),
            FailureCode::Declined
        );
        assert_eq!(
            CardGateway::map_error_code("expired_card"),
            FailureCode::ExpiredInstrument
        );
        assert_eq!(
            CardGateway::map_error_code("something_new"),
            FailureCode::TransientError
        );
    }

    #[test]
    fn test_momo_code_mapping() {
        assert_eq!(
            MobileMoneyGateway::map_error_code("NOT_ENOUGH_FUNDS"),
            FailureCode::InsufficientFunds
        );
        assert_eq!(
            MobileMoneyGateway::map_error_code("INVALID_MSISDN"),
            FailureCode::InvalidRecipient
        );
    }

    #[test]
    fn test_success_without_reference_is_not_success() {
        let outcome = interpret_rail_response(
            RailResponse {
                status: "succeeded".to_string(),
                reference: None,
                error_code: None,
            },
            CardGateway::map_error_code,
        );
        assert_eq!(
            outcome,
            Outcome::Failed {
                code: FailureCode::TransientError
            }
        );
    }

    #[tokio::test]
    async fn test_charge_maps_decline_from_wire() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/charges")
            .with_status(200)
            .with_body(r#"{"status":"failed","reference":null,"error_code":"insufficient_funds"}"#)
            .create_async()
            .await;

        let gw = CardGateway::new(
            reqwest::Client::new(),
            server.url(),
            "test-key".to_string(),
        );
        let outcome = gw
            .charge(&ChargeRequest {
                idempotency_key: "RENEW-test-0001".to_string(),
                amount_cents: 999,
                currency: "USD".to_string(),
                payment_instrument: "tok_123".to_string(),
            })
            .await
            .unwrap();

        assert_eq!(
            outcome,
            Outcome::Failed {
                code: FailureCode::InsufficientFunds
            }
        );
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_charge_success_carries_reference() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/collections")
            .with_status(200)
            .with_body(r#"{"status":"accepted","reference":"momo-789"}"#)
            .create_async()
            .await;

        let gw = MobileMoneyGateway::new(
            reqwest::Client::new(),
            server.url(),
            "test-key".to_string(),
        );
        let outcome = gw
            .charge(&ChargeRequest {
                idempotency_key: "RENEW-test-0002".to_string(),
                amount_cents: 499,
                currency: "USD".to_string(),
                payment_instrument: "msisdn_256700000001".to_string(),
            })
            .await
            .unwrap();

        assert_eq!(
            outcome,
            Outcome::Succeeded {
                reference: "momo-789".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_server_error_is_transport_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/refunds")
            .with_status(503)
            .create_async()
            .await;

        let gw = CardGateway::new(
            reqwest::Client::new(),
            server.url(),
            "test-key".to_string(),
        );
        let result = gw
            .refund(&RefundRequest {
                idempotency_key: "REFUND-test-0001".to_string(),
                original_reference: "ch_123".to_string(),
                amount_cents: 100,
            })
            .await;

        assert!(matches!(result, Err(BillingError::Gateway(_))));
    }
}
