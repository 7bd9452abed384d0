//! Webhook ingress
//!
//! Signed POSTs from the payment rails. The signature is verified before any
//! state is touched; once the event is durably recorded the endpoint always
//! acknowledges with 200, including for duplicates and for events whose
//! processing will later fail, so the sending gateway does not keep
//! retrying. Our own retry sweep owns everything after the ack.

use axum::{
    extract::{Path, State},
    http::HeaderMap,
    Json,
};
use serde_json::json;

use rebill_billing::WebhookService;
use rebill_shared::GatewayKind;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// POST /webhooks/:gateway
pub async fn receive(
    State(state): State<AppState>,
    Path(gateway): Path<String>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<Json<serde_json::Value>> {
    let gateway: GatewayKind = gateway
        .parse()
        .map_err(|_| ApiError::NotFound)?;

    let signature = headers
        .get("webhook-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            tracing::warn!(gateway = %gateway, "Webhook missing signature header");
            ApiError::BadRequest("Missing webhook signature".to_string())
        })?;

    WebhookService::verify_signature(&body, signature, state.config.webhook_secret(gateway))?;

    let payload: serde_json::Value = serde_json::from_str(&body)
        .map_err(|e| ApiError::BadRequest(format!("Invalid JSON payload: {e}")))?;

    let event_id = payload
        .get("event_id")
        .or_else(|| payload.get("id"))
        .and_then(|v| v.as_str())
        .ok_or_else(|| ApiError::BadRequest("Payload missing event id".to_string()))?
        .to_string();

    let is_new = state.webhooks.ingest(gateway, &event_id, payload).await?;

    Ok(Json(json!({ "received": true, "duplicate": !is_new })))
}
