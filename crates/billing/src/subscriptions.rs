//! Subscription state store
//!
//! One row per subscriber holding lifecycle state, billing-period boundaries,
//! failure counters, and scheduling metadata. The subscription row is the unit
//! of optimistic concurrency: every mutation is a conditional UPDATE against
//! the status and counters the caller read, and zero rows affected means
//! someone else got there first.
//!
//! Rows are never hard-deleted; an ended subscription transitions to the
//! `expired` status and stays queryable.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::{Duration, OffsetDateTime};
use tracing::{info, warn};
use uuid::Uuid;

use rebill_shared::{GatewayKind, Plan, SubscriptionStatus};

use crate::error::{BillingError, BillingResult};

/// A subscriber's billing record
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Subscription {
    pub id: Uuid,
    pub subscriber_id: Uuid,
    pub plan: Plan,
    pub status: SubscriptionStatus,
    pub billing_period_start: OffsetDateTime,
    pub billing_period_end: OffsetDateTime,
    pub auto_renew: bool,
    pub failure_count: i32,
    pub last_attempt_at: Option<OffsetDateTime>,
    pub last_failure_reason: Option<String>,
    pub pending_plan: Option<Plan>,
    pub pending_plan_effective_at: Option<OffsetDateTime>,
    pub monthly_usage: i32,
    /// Period end the last expiry warning was sent for; a new period resets
    /// the question of "has this subscriber been warned"
    pub warned_for_period_end: Option<OffsetDateTime>,
    pub payment_instrument: String,
    pub gateway: GatewayKind,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

const SUBSCRIPTION_COLUMNS: &str = r#"
    id, subscriber_id, plan, status,
    billing_period_start, billing_period_end,
    auto_renew, failure_count, last_attempt_at, last_failure_reason,
    pending_plan, pending_plan_effective_at,
    monthly_usage, warned_for_period_end,
    payment_instrument, gateway, created_at, updated_at
"#;

/// Store for subscription records
#[derive(Clone)]
pub struct SubscriptionStore {
    pool: PgPool,
}

impl SubscriptionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, id: Uuid) -> BillingResult<Subscription> {
        let sub: Option<Subscription> = sqlx::query_as(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        sub.ok_or_else(|| BillingError::SubscriptionNotFound(id.to_string()))
    }

    pub async fn get_by_subscriber(&self, subscriber_id: Uuid) -> BillingResult<Subscription> {
        let sub: Option<Subscription> = sqlx::query_as(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE subscriber_id = $1"
        ))
        .bind(subscriber_id)
        .fetch_optional(&self.pool)
        .await?;

        sub.ok_or_else(|| BillingError::SubscriptionNotFound(subscriber_id.to_string()))
    }

    /// Page of subscriptions due for a renewal attempt: auto-renew on and the
    /// period ending within the lookahead window but still in the future
    /// (already-lapsed rows belong to the expiry sweep, not the renewal run).
    ///
    /// Keyset pagination on `id` so a long run never loads an unbounded
    /// result set.
    pub async fn due_for_renewal(
        &self,
        now: OffsetDateTime,
        lookahead: Duration,
        after: Option<Uuid>,
        limit: i64,
    ) -> BillingResult<Vec<Subscription>> {
        let subs: Vec<Subscription> = sqlx::query_as(&format!(
            r#"
            SELECT {SUBSCRIPTION_COLUMNS}
            FROM subscriptions
            WHERE auto_renew = TRUE
              AND billing_period_end > $1
              AND billing_period_end <= $2
              AND id > $3
            ORDER BY id ASC
            LIMIT $4
            "#
        ))
        .bind(now)
        .bind(now + lookahead)
        .bind(after.unwrap_or(Uuid::nil()))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(subs)
    }

    /// Claim a renewal attempt by advancing `last_attempt_at`, conditioned on
    /// the value this run read. Exactly one of two overlapping runs wins the
    /// claim; the loser skips the record instead of double-charging.
    pub async fn claim_attempt(
        &self,
        id: Uuid,
        expected_last_attempt_at: Option<OffsetDateTime>,
        now: OffsetDateTime,
    ) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE subscriptions SET
                last_attempt_at = $3,
                updated_at = NOW()
            WHERE id = $1 AND last_attempt_at IS NOT DISTINCT FROM $2
            "#,
        )
        .bind(id)
        .bind(expected_last_attempt_at)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Record a failed renewal attempt, conditioned on the failure count the
    /// caller observed. Returns the updated row, or `ConcurrentModification`
    /// if another run already moved the record.
    pub async fn record_renewal_failure(
        &self,
        id: Uuid,
        expected_failure_count: i32,
        reason: &str,
        disable_auto_renew: bool,
        now: OffsetDateTime,
    ) -> BillingResult<Subscription> {
        let updated: Option<Subscription> = sqlx::query_as(&format!(
            r#"
            UPDATE subscriptions SET
                failure_count = failure_count + 1,
                last_failure_reason = $3,
                last_attempt_at = $4,
                auto_renew = CASE WHEN $5 THEN FALSE ELSE auto_renew END,
                status = CASE WHEN $5 THEN 'expiring_soon' ELSE status END,
                updated_at = NOW()
            WHERE id = $1 AND failure_count = $2
            RETURNING {SUBSCRIPTION_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(expected_failure_count)
        .bind(reason)
        .bind(now)
        .bind(disable_auto_renew)
        .fetch_optional(&self.pool)
        .await?;

        updated.ok_or_else(|| {
            BillingError::ConcurrentModification(format!(
                "subscription {id} moved past failure_count={expected_failure_count}"
            ))
        })
    }

    /// Flip auto-renew off for a record whose retry budget is exhausted and
    /// mark it expiring. Conditional, so overlapping runs settle on one write.
    pub async fn disable_auto_renew_exhausted(&self, id: Uuid) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE subscriptions SET
                auto_renew = FALSE,
                status = 'expiring_soon',
                updated_at = NOW()
            WHERE id = $1 AND auto_renew = TRUE AND failure_count >= 3
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Subscriber-initiated cancellation: stops future renewal attempts only.
    /// An in-flight charge attempt is unaffected, and the subscriber keeps
    /// access until the period end (the expiry sweep removes it).
    pub async fn cancel(&self, subscriber_id: Uuid) -> BillingResult<Subscription> {
        let updated: Option<Subscription> = sqlx::query_as(&format!(
            r#"
            UPDATE subscriptions SET
                auto_renew = FALSE,
                status = 'cancelled',
                updated_at = NOW()
            WHERE subscriber_id = $1 AND status NOT IN ('cancelled', 'expired')
            RETURNING {SUBSCRIPTION_COLUMNS}
            "#
        ))
        .bind(subscriber_id)
        .fetch_optional(&self.pool)
        .await?;

        updated.ok_or_else(|| BillingError::SubscriptionNotFound(subscriber_id.to_string()))
    }

    /// Schedule a downgrade to take effect at a future date (normally the
    /// period boundary). Applied later by [`apply_due_downgrades`].
    ///
    /// [`apply_due_downgrades`]: SubscriptionStore::apply_due_downgrades
    pub async fn schedule_downgrade(
        &self,
        subscriber_id: Uuid,
        new_plan: Plan,
        effective_at: OffsetDateTime,
    ) -> BillingResult<Subscription> {
        let updated: Option<Subscription> = sqlx::query_as(&format!(
            r#"
            UPDATE subscriptions SET
                pending_plan = $2,
                pending_plan_effective_at = $3,
                updated_at = NOW()
            WHERE subscriber_id = $1 AND status NOT IN ('expired')
            RETURNING {SUBSCRIPTION_COLUMNS}
            "#
        ))
        .bind(subscriber_id)
        .bind(new_plan)
        .bind(effective_at)
        .fetch_optional(&self.pool)
        .await?;

        updated.ok_or_else(|| BillingError::SubscriptionNotFound(subscriber_id.to_string()))
    }

    /// Apply every downgrade whose effective date has passed: swap the plan,
    /// clear the pending pair, and cap the usage counter at the new plan's
    /// quota so "remaining" can never go negative. Returns how many applied.
    pub async fn apply_due_downgrades(&self, now: OffsetDateTime) -> BillingResult<u32> {
        let due: Vec<(Uuid, Plan, OffsetDateTime)> = sqlx::query_as(
            r#"
            SELECT id, pending_plan, pending_plan_effective_at
            FROM subscriptions
            WHERE pending_plan IS NOT NULL AND pending_plan_effective_at <= $1
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        let mut applied = 0u32;
        for (id, new_plan, effective_at) in due {
            // Conditional on the same pending pair we read; a concurrent
            // reschedule or application makes this a no-op.
            let result = sqlx::query(
                r#"
                UPDATE subscriptions SET
                    plan = $2,
                    pending_plan = NULL,
                    pending_plan_effective_at = NULL,
                    monthly_usage = LEAST(monthly_usage, $3),
                    updated_at = NOW()
                WHERE id = $1 AND pending_plan = $2 AND pending_plan_effective_at = $4
                "#,
            )
            .bind(id)
            .bind(new_plan)
            .bind(new_plan.monthly_quota())
            .bind(effective_at)
            .execute(&self.pool)
            .await?;

            if result.rows_affected() > 0 {
                applied += 1;
                info!(subscription_id = %id, plan = %new_plan, "Applied scheduled downgrade");
            } else {
                warn!(subscription_id = %id, "Pending downgrade changed under us, skipping");
            }
        }

        Ok(applied)
    }

    /// Non-renewing subscriptions expiring within the window that have not
    /// been warned for this period end yet.
    pub async fn warning_candidates(
        &self,
        now: OffsetDateTime,
        window: Duration,
        limit: i64,
    ) -> BillingResult<Vec<Subscription>> {
        let subs: Vec<Subscription> = sqlx::query_as(&format!(
            r#"
            SELECT {SUBSCRIPTION_COLUMNS}
            FROM subscriptions
            WHERE auto_renew = FALSE
              AND status IN ('trial', 'active', 'expiring_soon', 'cancelled')
              AND billing_period_end > $1
              AND billing_period_end <= $2
              AND (warned_for_period_end IS NULL OR warned_for_period_end <> billing_period_end)
            ORDER BY billing_period_end ASC
            LIMIT $3
            "#
        ))
        .bind(now)
        .bind(now + window)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(subs)
    }

    /// Mark a subscription warned for its current period end. Conditional on
    /// the period end the caller saw, so a renewal landing in between (which
    /// moves the end) invalidates the warning instead of suppressing the next
    /// one.
    pub async fn mark_warned(
        &self,
        id: Uuid,
        period_end: OffsetDateTime,
    ) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE subscriptions SET
                warned_for_period_end = $2,
                status = CASE WHEN status IN ('trial', 'active') THEN 'expiring_soon' ELSE status END,
                updated_at = NOW()
            WHERE id = $1 AND billing_period_end = $2
            "#,
        )
        .bind(id)
        .bind(period_end)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Soft-expire every subscription whose period has lapsed without
    /// renewal. Cancelled subscribers lose access here, at the period end,
    /// not at cancellation time.
    pub async fn expire_lapsed(&self, now: OffsetDateTime) -> BillingResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE subscriptions SET
                status = 'expired',
                updated_at = NOW()
            WHERE billing_period_end <= $1
              AND status IN ('trial', 'active', 'expiring_soon', 'cancelled')
            "#,
        )
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}
