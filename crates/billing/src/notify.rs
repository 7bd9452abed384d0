//! Notification dispatcher client
//!
//! Thin fire-and-forget client for the external notification service. Billing
//! outcomes are pushed here so the subscriber hears about them; a failure to
//! notify is logged and swallowed; it must never roll back billing state.

use serde_json::json;
use std::time::Duration;
use time::OffsetDateTime;
use tracing::warn;
use uuid::Uuid;

/// Short timeout; the dispatcher is best-effort and must not stall a batch
const NOTIFY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct NotificationDispatcher {
    client: reqwest::Client,
    base_url: Option<String>,
}

impl NotificationDispatcher {
    /// `base_url = None` disables dispatch entirely (tests, local dev)
    pub fn new(client: reqwest::Client, base_url: Option<String>) -> Self {
        Self { client, base_url }
    }

    pub async fn renewal_succeeded(&self, subscriber_id: Uuid, new_period_end: OffsetDateTime) {
        self.send(
            "renewal_succeeded",
            json!({
                "subscriber_id": subscriber_id,
                "new_period_end": new_period_end.to_string(),
            }),
        )
        .await;
    }

    /// Renewal failure with the attempt number and, when another attempt is
    /// scheduled, the date it will run.
    pub async fn renewal_failed(
        &self,
        subscriber_id: Uuid,
        attempt: i32,
        next_retry_at: Option<OffsetDateTime>,
    ) {
        self.send(
            "renewal_failed",
            json!({
                "subscriber_id": subscriber_id,
                "attempt": attempt,
                "next_retry_at": next_retry_at.map(|t| t.to_string()),
            }),
        )
        .await;
    }

    /// Final failure or permanent decline: the subscriber must update their
    /// payment method before billing can resume.
    pub async fn action_required(&self, subscriber_id: Uuid, reason: &str) {
        self.send(
            "action_required",
            json!({
                "subscriber_id": subscriber_id,
                "reason": reason,
            }),
        )
        .await;
    }

    pub async fn expiry_warning(&self, subscriber_id: Uuid, period_end: OffsetDateTime) {
        self.send(
            "expiry_warning",
            json!({
                "subscriber_id": subscriber_id,
                "period_end": period_end.to_string(),
            }),
        )
        .await;
    }

    pub async fn refund_completed(&self, subscriber_id: Uuid, amount_cents: i64) {
        self.send(
            "refund_completed",
            json!({
                "subscriber_id": subscriber_id,
                "amount_cents": amount_cents,
            }),
        )
        .await;
    }

    async fn send(&self, kind: &str, payload: serde_json::Value) {
        let Some(base_url) = &self.base_url else {
            return;
        };

        let result = self
            .client
            .post(format!("{base_url}/notifications"))
            .timeout(NOTIFY_TIMEOUT)
            .json(&json!({ "kind": kind, "payload": payload }))
            .send()
            .await;

        match result {
            Ok(response) if !response.status().is_success() => {
                warn!(kind = kind, status = %response.status(), "Notification dispatch rejected");
            }
            Err(e) => {
                warn!(kind = kind, error = %e, "Notification dispatch failed");
            }
            Ok(_) => {}
        }
    }
}
