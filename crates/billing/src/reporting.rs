//! Aggregate billing statistics
//!
//! Read-only counts over a time window for admin observability: renewals by
//! outcome, webhook events by status, refunds by status.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::{Duration, OffsetDateTime};

use crate::error::BillingResult;

/// Aggregate counts for a window ending now
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingStats {
    pub window_start: OffsetDateTime,
    pub window_end: OffsetDateTime,
    pub charges_succeeded: i64,
    pub charges_failed: i64,
    pub charges_pending: i64,
    pub webhooks_completed: i64,
    pub webhooks_pending: i64,
    pub webhooks_dead_letter: i64,
    pub refunds_completed: i64,
    pub refunds_failed: i64,
    pub refunded_cents: i64,
}

#[derive(Clone)]
pub struct ReportingService {
    pool: PgPool,
}

impl ReportingService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn stats(&self, window: Duration) -> BillingResult<BillingStats> {
        let window_end = OffsetDateTime::now_utc();
        let window_start = window_end - window;

        let (charges_succeeded, charges_failed, charges_pending): (i64, i64, i64) =
            sqlx::query_as(
                r#"
                SELECT
                    COUNT(*) FILTER (WHERE status = 'succeeded'),
                    COUNT(*) FILTER (WHERE status = 'failed'),
                    COUNT(*) FILTER (WHERE status = 'pending')
                FROM transactions
                WHERE kind = 'charge' AND created_at >= $1
                "#,
            )
            .bind(window_start)
            .fetch_one(&self.pool)
            .await?;

        let (webhooks_completed, webhooks_pending, webhooks_dead_letter): (i64, i64, i64) =
            sqlx::query_as(
                r#"
                SELECT
                    COUNT(*) FILTER (WHERE status = 'completed'),
                    COUNT(*) FILTER (WHERE status IN ('pending', 'processing')),
                    COUNT(*) FILTER (WHERE status = 'dead_letter')
                FROM webhook_events
                WHERE created_at >= $1
                "#,
            )
            .bind(window_start)
            .fetch_one(&self.pool)
            .await?;

        let (refunds_completed, refunds_failed, refunded_cents): (i64, i64, Option<i64>) =
            sqlx::query_as(
                r#"
                SELECT
                    COUNT(*) FILTER (WHERE status = 'completed'),
                    COUNT(*) FILTER (WHERE status = 'failed'),
                    SUM(amount_cents) FILTER (WHERE status = 'completed')
                FROM refunds
                WHERE created_at >= $1
                "#,
            )
            .bind(window_start)
            .fetch_one(&self.pool)
            .await?;

        Ok(BillingStats {
            window_start,
            window_end,
            charges_succeeded,
            charges_failed,
            charges_pending,
            webhooks_completed,
            webhooks_pending,
            webhooks_dead_letter,
            refunds_completed,
            refunds_failed,
            refunded_cents: refunded_cents.unwrap_or(0),
        })
    }
}
