//! Webhook reconciliation engine
//!
//! Gateways deliver payment confirmations asynchronously with at-least-once
//! semantics. Ingress records each event durably (deduplicated on the
//! gateway's event id) and acknowledges immediately; a periodic sweep then
//! applies recorded events to the transaction ledger with retry, backoff, and
//! a dead-letter escape hatch for events that can never apply.
//!
//! Per-event state machine:
//! `pending -> processing -> completed`, or back to `pending` with
//! `retry_count + 1` and a backoff-scheduled `next_retry_at`, or
//! `dead_letter` once the retry budget is spent (or immediately for
//! permanent failures such as a malformed payload).

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use sqlx::PgPool;
use time::{Duration, OffsetDateTime};
use tracing::{error, info, warn};
use uuid::Uuid;

use rebill_shared::{GatewayKind, TransactionKind};

use crate::error::{BillingError, BillingResult};
use crate::gateway::FailureCode;
use crate::ledger::{Disposition, FinalizeResult, LedgerService};
use crate::notify::NotificationDispatcher;

type HmacSha256 = Hmac<Sha256>;

/// Events processed per sweep tick
const BATCH_SIZE: i64 = 50;

/// Retries before an event is dead-lettered (initial attempt not counted)
const MAX_RETRIES: i32 = 5;

/// Backoff ladder in minutes, indexed by the retry count before increment
const BACKOFF_MINUTES: [i64; 5] = [1, 5, 30, 120, 720];

/// Signed ingress headers older than this are rejected
const SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// A `processing` claim older than this belongs to a dead worker and is
/// returned to the queue at the top of the next sweep
const STALE_CLAIM_MINUTES: i64 = 15;

/// Lifecycle status of a recorded webhook event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum WebhookStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    DeadLetter,
}

/// A recorded gateway notification
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct WebhookEvent {
    pub id: Uuid,
    pub gateway: GatewayKind,
    /// Gateway-assigned id, the deduplication key
    pub event_id: String,
    pub status: WebhookStatus,
    pub retry_count: i32,
    pub next_retry_at: Option<OffsetDateTime>,
    /// When the current `processing` claim was taken; stale claims are
    /// reclaimed by the sweep
    pub claimed_at: Option<OffsetDateTime>,
    pub last_error: Option<String>,
    pub payload: serde_json::Value,
    pub created_at: OffsetDateTime,
    pub processed_at: Option<OffsetDateTime>,
}

/// The parts of a gateway notification the engine acts on. Parsed at the
/// boundary; anything that does not fit this shape is permanently rejected.
#[derive(Debug, Deserialize)]
struct PaymentEventPayload {
    /// Correlation identifier: the gateway reference or the idempotency key
    /// the charge was submitted under
    reference: String,
    status: String,
    error_code: Option<String>,
    /// Rail-assigned reference for the settled operation. Present when the
    /// correlation id is the idempotency key (requires-action flows), which
    /// must not be stored as the transaction's gateway reference.
    gateway_reference: Option<String>,
}

const EVENT_COLUMNS: &str = r#"
    id, gateway, event_id, status, retry_count, next_retry_at, claimed_at,
    last_error, payload, created_at, processed_at
"#;

/// Ingests and reconciles webhook events
#[derive(Clone)]
pub struct WebhookService {
    pool: PgPool,
    ledger: LedgerService,
    notifier: NotificationDispatcher,
}

impl WebhookService {
    pub fn new(pool: PgPool, ledger: LedgerService, notifier: NotificationDispatcher) -> Self {
        Self {
            pool,
            ledger,
            notifier,
        }
    }

    /// Verify a `t={timestamp},v1={hex hmac}` signature header over
    /// `"{timestamp}.{payload}"`, within the tolerance window.
    pub fn verify_signature(payload: &str, header: &str, secret: &str) -> BillingResult<()> {
        let mut timestamp: Option<i64> = None;
        let mut v1_signature: Option<String> = None;

        for part in header.split(',') {
            let kv: Vec<&str> = part.splitn(2, '=').collect();
            if kv.len() == 2 {
                match kv[0].trim() {
                    "t" => timestamp = kv[1].parse().ok(),
                    "v1" => v1_signature = Some(kv[1].to_string()),
                    _ => {}
                }
            }
        }

        let timestamp = timestamp.ok_or(BillingError::WebhookSignatureInvalid)?;
        let v1_signature = v1_signature.ok_or(BillingError::WebhookSignatureInvalid)?;

        let now = OffsetDateTime::now_utc().unix_timestamp();
        if (now - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
            warn!(timestamp = timestamp, "Webhook timestamp outside tolerance");
            return Err(BillingError::WebhookSignatureInvalid);
        }

        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|_| BillingError::WebhookSignatureInvalid)?;
        mac.update(format!("{timestamp}.{payload}").as_bytes());

        let provided = hex::decode(&v1_signature)
            .map_err(|_| BillingError::WebhookSignatureInvalid)?;
        mac.verify_slice(&provided)
            .map_err(|_| BillingError::WebhookSignatureInvalid)
    }

    /// Durably record an inbound event. Returns `false` when the event id was
    /// already recorded (re-delivery). The caller acknowledges either way so
    /// the gateway stops retrying; our own sweep takes over from here.
    pub async fn ingest(
        &self,
        gateway: GatewayKind,
        event_id: &str,
        payload: serde_json::Value,
    ) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO webhook_events (gateway, event_id, status, payload)
            VALUES ($1, $2, 'pending', $3)
            ON CONFLICT (gateway, event_id) DO NOTHING
            "#,
        )
        .bind(gateway)
        .bind(event_id)
        .bind(&payload)
        .execute(&self.pool)
        .await?;

        let is_new = result.rows_affected() > 0;
        if is_new {
            info!(gateway = %gateway, event_id = %event_id, "Webhook event recorded");
        } else {
            info!(gateway = %gateway, event_id = %event_id, "Duplicate webhook event ignored");
        }
        Ok(is_new)
    }

    /// One sweep tick: claim a batch of due events and apply each in
    /// isolation. One event's failure never blocks the rest of the batch.
    pub async fn process_due_batch(&self) -> BillingResult<u32> {
        let now = OffsetDateTime::now_utc();

        // A worker that crashed between claim and settle leaves its events in
        // `processing`; once the claim is stale, hand them back to the queue.
        let reclaimed = sqlx::query(
            r#"
            UPDATE webhook_events SET status = 'pending', claimed_at = NULL
            WHERE status = 'processing' AND claimed_at < $1
            "#,
        )
        .bind(now - Duration::minutes(STALE_CLAIM_MINUTES))
        .execute(&self.pool)
        .await?;
        if reclaimed.rows_affected() > 0 {
            warn!(
                count = reclaimed.rows_affected(),
                "Reclaimed webhook events from stale processing claims"
            );
        }

        // Single-statement claim: only one sweep can move a given event to
        // `processing`, and SKIP LOCKED keeps overlapping sweeps from
        // contending on the same rows.
        let claimed: Vec<WebhookEvent> = sqlx::query_as(&format!(
            r#"
            UPDATE webhook_events SET status = 'processing', claimed_at = NOW()
            WHERE id IN (
                SELECT id FROM webhook_events
                WHERE status = 'pending'
                  AND (next_retry_at IS NULL OR next_retry_at <= $1)
                ORDER BY created_at ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {EVENT_COLUMNS}
            "#
        ))
        .bind(now)
        .bind(BATCH_SIZE)
        .fetch_all(&self.pool)
        .await?;

        if claimed.is_empty() {
            return Ok(0);
        }

        info!(count = claimed.len(), "Processing webhook events");
        let mut completed = 0u32;
        for event in claimed {
            let event_id = event.id;
            match self.apply_event(&event).await {
                Ok(()) => {
                    self.mark_completed(event_id).await;
                    completed += 1;
                }
                Err(e) if e.is_transient() => self.schedule_retry(&event, &e).await,
                Err(e) => self.dead_letter(event_id, &e).await,
            }
        }
        Ok(completed)
    }

    /// The reconciliation itself: parse, correlate, finalize.
    ///
    /// Finalize is idempotent on its own, so a re-delivered event that slips
    /// past the event-id dedup still cannot double-apply.
    async fn apply_event(&self, event: &WebhookEvent) -> BillingResult<()> {
        let payload: PaymentEventPayload = serde_json::from_value(event.payload.clone())
            .map_err(|e| BillingError::MalformedPayload(e.to_string()))?;

        let disposition = match payload.status.as_str() {
            // The correlation id can be our idempotency key; the stored
            // gateway reference must be the rail's own when the event
            // carries one, or downstream refunds would send the wrong id.
            "succeeded" | "completed" => Disposition::Succeeded {
                reference: payload
                    .gateway_reference
                    .clone()
                    .unwrap_or_else(|| payload.reference.clone()),
            },
            "failed" | "rejected" => Disposition::Failed {
                code: payload
                    .error_code
                    .as_deref()
                    .map(map_event_error_code)
                    .unwrap_or(FailureCode::TransientError),
            },
            other => {
                return Err(BillingError::MalformedPayload(format!(
                    "unknown event status: {other}"
                )))
            }
        };

        let transaction = self
            .ledger
            .get_by_gateway_reference(event.gateway, &payload.reference)
            .await?;

        let result = self
            .ledger
            .finalize(&transaction.idempotency_key, disposition)
            .await?;

        if let FinalizeResult::Applied(tx) = &result {
            match tx.kind {
                // Applied success on a charge means the subscription was just
                // extended here; tell the subscriber.
                TransactionKind::Charge => {
                    if tx.status == rebill_shared::TransactionStatus::Succeeded {
                        if let Ok(Some((subscriber_id, period_end))) =
                            self.subscription_summary(tx.subscription_id).await
                        {
                            self.notifier
                                .renewal_succeeded(subscriber_id, period_end)
                                .await;
                        }
                    }
                }
                // A refund settled asynchronously: mirror the outcome onto
                // the refund row the workflow left behind. A `failed` row can
                // still flip to completed here, since a transport failure may
                // have marked the row failed while the rail paid out.
                TransactionKind::Refund => {
                    self.mirror_refund_outcome(tx).await;
                }
            }
        }

        Ok(())
    }

    async fn mirror_refund_outcome(&self, tx: &crate::ledger::Transaction) {
        let Some(refund_id) = crate::refunds::refund_id_from_ledger_key(&tx.idempotency_key)
        else {
            warn!(idempotency_key = %tx.idempotency_key, "Refund ledger key did not parse");
            return;
        };

        let (status, reference) = match tx.status {
            rebill_shared::TransactionStatus::Succeeded => {
                ("completed", tx.gateway_reference.clone())
            }
            _ => ("failed", None),
        };

        let result = sqlx::query(
            r#"
            UPDATE refunds SET
                status = $2,
                gateway_reference = COALESCE($3, gateway_reference),
                updated_at = NOW()
            WHERE id = $1 AND status IN ('pending', 'processing', 'failed')
            "#,
        )
        .bind(refund_id)
        .bind(status)
        .bind(reference)
        .execute(&self.pool)
        .await;

        if let Err(e) = result {
            error!(refund_id = %refund_id, error = %e, "Failed to mirror refund outcome");
        }
    }

    async fn subscription_summary(
        &self,
        subscription_id: Uuid,
    ) -> BillingResult<Option<(Uuid, OffsetDateTime)>> {
        let row: Option<(Uuid, OffsetDateTime)> = sqlx::query_as(
            "SELECT subscriber_id, billing_period_end FROM subscriptions WHERE id = $1",
        )
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn mark_completed(&self, id: Uuid) {
        let result = sqlx::query(
            "UPDATE webhook_events SET status = 'completed', processed_at = NOW() WHERE id = $1 AND status = 'processing'",
        )
        .bind(id)
        .execute(&self.pool)
        .await;

        if let Err(e) = result {
            error!(webhook_id = %id, error = %e, "Failed to mark webhook completed");
        }
    }

    /// Put a transiently-failed event back in the queue with backoff, or
    /// dead-letter it once the budget is spent. Only a claimed (`processing`)
    /// event can be requeued.
    pub async fn schedule_retry(&self, event: &WebhookEvent, cause: &BillingError) {
        if event.retry_count >= MAX_RETRIES {
            self.dead_letter(event.id, cause).await;
            return;
        }

        let delay = backoff_delay(event.retry_count);
        let next_retry_at = OffsetDateTime::now_utc() + delay;
        let result = sqlx::query(
            r#"
            UPDATE webhook_events SET
                status = 'pending',
                retry_count = retry_count + 1,
                next_retry_at = $2,
                claimed_at = NULL,
                last_error = $3
            WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(event.id)
        .bind(next_retry_at)
        .bind(cause.to_string())
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => warn!(
                webhook_id = %event.id,
                retry_count = event.retry_count + 1,
                next_retry_at = %next_retry_at,
                error = %cause,
                "Webhook processing failed, will retry"
            ),
            Err(e) => error!(webhook_id = %event.id, error = %e, "Failed to schedule webhook retry"),
        }
    }

    async fn dead_letter(&self, id: Uuid, cause: &BillingError) {
        let result = sqlx::query(
            r#"
            UPDATE webhook_events SET
                status = 'dead_letter',
                last_error = $2,
                processed_at = NOW()
            WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(id)
        .bind(cause.to_string())
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => error!(webhook_id = %id, error = %cause, "Webhook event dead-lettered"),
            Err(e) => error!(webhook_id = %id, error = %e, "Failed to dead-letter webhook"),
        }
    }

    /// Dead-letter queue, newest first
    pub async fn list_dead_letter(&self, limit: i64) -> BillingResult<Vec<WebhookEvent>> {
        let events: Vec<WebhookEvent> = sqlx::query_as(&format!(
            r#"
            SELECT {EVENT_COLUMNS} FROM webhook_events
            WHERE status = 'dead_letter'
            ORDER BY created_at DESC
            LIMIT $1
            "#
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(events)
    }

    /// Admin-triggered reprocessing of a dead-lettered event. Runs the same
    /// application logic but outside the retry accounting: success completes
    /// the event, failure returns it to the dead-letter queue.
    pub async fn reprocess_dead_letter(&self, id: Uuid) -> BillingResult<()> {
        let claimed: Option<WebhookEvent> = sqlx::query_as(&format!(
            r#"
            UPDATE webhook_events SET status = 'processing', claimed_at = NOW()
            WHERE id = $1 AND status = 'dead_letter'
            RETURNING {EVENT_COLUMNS}
            "#
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        let event = claimed.ok_or_else(|| {
            BillingError::InvalidInput(format!("webhook event {id} is not in the dead-letter queue"))
        })?;

        match self.apply_event(&event).await {
            Ok(()) => {
                self.mark_completed(id).await;
                info!(webhook_id = %id, "Dead-lettered webhook reprocessed successfully");
                Ok(())
            }
            Err(e) => {
                self.dead_letter(id, &e).await;
                Err(e)
            }
        }
    }

    /// Drop completed events older than the retention window
    pub async fn cleanup_old_events(&self, retention_days: i64) -> BillingResult<u64> {
        let cutoff = OffsetDateTime::now_utc() - Duration::days(retention_days);
        let result = sqlx::query(
            "DELETE FROM webhook_events WHERE status = 'completed' AND processed_at < $1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            info!(
                deleted = result.rows_affected(),
                retention_days = retention_days,
                "Cleaned up old webhook events"
            );
        }
        Ok(result.rows_affected())
    }
}

/// Backoff before retry N+1, indexed by the current retry count
pub fn backoff_delay(retry_count: i32) -> Duration {
    let idx = (retry_count.max(0) as usize).min(BACKOFF_MINUTES.len() - 1);
    Duration::minutes(BACKOFF_MINUTES[idx])
}

/// Event-level error codes use the card rail's vocabulary; both rails are
/// normalized upstream of event emission.
fn map_event_error_code(code: &str) -> FailureCode {
    match code {
        "declined" => FailureCode::Declined,
        "insufficient_funds" => FailureCode::InsufficientFunds,
        "expired_instrument" => FailureCode::ExpiredInstrument,
        "invalid_recipient" => FailureCode::InvalidRecipient,
        _ => FailureCode::TransientError,
    }
}
