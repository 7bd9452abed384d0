//! Refund calculator and workflow
//!
//! The calculator is a pure proration function. The workflow enforces the one
//! invariant that matters financially: across all non-failed refunds for a
//! charge, the refunded total never exceeds the original amount. It is checked
//! under the parent transaction's row lock so concurrent requests cannot both
//! slip past the sum.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::{error, info};
use uuid::Uuid;

use rebill_shared::{Plan, TransactionKind, TransactionStatus};

use crate::error::{BillingError, BillingResult};
use crate::gateway::{GatewayRouter, Outcome, RefundRequest};
use crate::ledger::{Disposition, LedgerService, Transaction};
use crate::notify::NotificationDispatcher;
use crate::period::{days_in_period, days_remaining};
use crate::subscriptions::Subscription;

/// Admin retries allowed per refund after the initial attempt
const MAX_REFUND_RETRIES: i32 = 3;

/// Prorated credit for moving from a dearer plan to a cheaper one with part
/// of the period unused. Floored at zero: an upgrade never produces a
/// negative "refund".
pub fn prorated_credit_cents(
    current_plan_price_cents: i64,
    new_plan_price_cents: i64,
    days_remaining_in_period: i64,
    days_in_period: i64,
) -> i64 {
    if days_in_period <= 0 || days_remaining_in_period <= 0 {
        return 0;
    }
    let diff = current_plan_price_cents - new_plan_price_cents;
    (diff * days_remaining_in_period / days_in_period).max(0)
}

/// Credit a subscriber would receive for downgrading now, prorated over the
/// current billing period.
pub fn downgrade_credit_cents(
    subscription: &Subscription,
    new_plan: Plan,
    now: OffsetDateTime,
) -> i64 {
    prorated_credit_cents(
        subscription.plan.monthly_price_cents(),
        new_plan.monthly_price_cents(),
        days_remaining(now, subscription.billing_period_end),
        days_in_period(
            subscription.billing_period_start,
            subscription.billing_period_end,
        ),
    )
}

/// Refund lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum RefundStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

/// One refund request against a settled charge
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Refund {
    pub id: Uuid,
    /// Idempotency key of the charge being refunded
    pub transaction_key: String,
    pub amount_cents: i64,
    pub reason: String,
    pub status: RefundStatus,
    pub retry_count: i32,
    pub gateway_reference: Option<String>,
    pub requested_by: Uuid,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

const REFUND_COLUMNS: &str = r#"
    id, transaction_key, amount_cents, reason, status, retry_count,
    gateway_reference, requested_by, created_at, updated_at
"#;

/// Ledger idempotency key for one refund attempt. The attempt number is part
/// of the key, so each admin retry is exactly one new gateway attempt while a
/// repeated call for the same attempt stays idempotent.
pub fn refund_ledger_key(refund_id: Uuid, attempt: i32) -> String {
    format!("REFUND-{refund_id}-{attempt}")
}

/// Recover the refund id from a refund ledger key (used by webhook
/// reconciliation to mirror asynchronous outcomes onto the refund row).
pub fn refund_id_from_ledger_key(key: &str) -> Option<Uuid> {
    let rest = key.strip_prefix("REFUND-")?;
    let (id, _attempt) = rest.rsplit_once('-')?;
    Uuid::parse_str(id).ok()
}

/// The refund workflow
#[derive(Clone)]
pub struct RefundService {
    pool: PgPool,
    ledger: LedgerService,
    gateways: Arc<GatewayRouter>,
    notifier: NotificationDispatcher,
}

impl RefundService {
    pub fn new(
        pool: PgPool,
        ledger: LedgerService,
        gateways: Arc<GatewayRouter>,
        notifier: NotificationDispatcher,
    ) -> Self {
        Self {
            pool,
            ledger,
            gateways,
            notifier,
        }
    }

    /// Request a refund against a settled charge.
    ///
    /// Ownership is checked first; then the over-refund guard runs with the
    /// parent transaction row locked, so the sum of non-failed refunds plus
    /// this request is re-read atomically with the insert that commits it.
    pub async fn request_refund(
        &self,
        requester_id: Uuid,
        is_admin: bool,
        transaction_key: &str,
        amount_cents: i64,
        reason: &str,
    ) -> BillingResult<Refund> {
        if amount_cents <= 0 {
            return Err(BillingError::InvalidInput(
                "refund amount must be positive".to_string(),
            ));
        }

        let charge = self.ledger.get(transaction_key).await?;
        if charge.kind != TransactionKind::Charge
            || charge.status != TransactionStatus::Succeeded
        {
            return Err(BillingError::InvalidInput(
                "only settled charges can be refunded".to_string(),
            ));
        }

        if !is_admin {
            let owner: Option<(Uuid,)> = sqlx::query_as(
                "SELECT subscriber_id FROM subscriptions WHERE id = $1",
            )
            .bind(charge.subscription_id)
            .fetch_optional(&self.pool)
            .await?;
            match owner {
                Some((subscriber_id,)) if subscriber_id == requester_id => {}
                _ => return Err(BillingError::NotOwner),
            }
        }

        let refund = self
            .create_guarded(&charge, requester_id, amount_cents, reason)
            .await?;

        info!(
            refund_id = %refund.id,
            transaction_key = %transaction_key,
            amount_cents = amount_cents,
            "Refund recorded, executing against gateway"
        );

        self.execute(refund, &charge, 0).await
    }

    /// Insert the refund row under the parent charge's row lock, enforcing
    /// `sum(non-failed refunds) + amount <= original charge`.
    async fn create_guarded(
        &self,
        charge: &Transaction,
        requested_by: Uuid,
        amount_cents: i64,
        reason: &str,
    ) -> BillingResult<Refund> {
        let mut db_tx = self.pool.begin().await?;

        // Lock the parent so concurrent refund requests serialize here
        sqlx::query("SELECT 1 FROM transactions WHERE idempotency_key = $1 FOR UPDATE")
            .bind(&charge.idempotency_key)
            .execute(&mut *db_tx)
            .await?;

        let (already_refunded,): (Option<i64>,) = sqlx::query_as(
            r#"
            SELECT SUM(amount_cents) FROM refunds
            WHERE transaction_key = $1 AND status <> 'failed'
            "#,
        )
        .bind(&charge.idempotency_key)
        .fetch_one(&mut *db_tx)
        .await?;
        let already_refunded = already_refunded.unwrap_or(0);

        if already_refunded + amount_cents > charge.amount_cents {
            db_tx.rollback().await?;
            return Err(BillingError::OverRefund {
                requested_cents: amount_cents,
                available_cents: charge.amount_cents - already_refunded,
            });
        }

        let refund: Refund = sqlx::query_as(&format!(
            r#"
            INSERT INTO refunds (transaction_key, amount_cents, reason, status, requested_by)
            VALUES ($1, $2, $3, 'pending', $4)
            RETURNING {REFUND_COLUMNS}
            "#
        ))
        .bind(&charge.idempotency_key)
        .bind(amount_cents)
        .bind(reason)
        .bind(requested_by)
        .fetch_one(&mut *db_tx)
        .await?;

        db_tx.commit().await?;
        Ok(refund)
    }

    /// Drive one refund attempt through the ledger and the gateway.
    async fn execute(
        &self,
        refund: Refund,
        charge: &Transaction,
        attempt: i32,
    ) -> BillingResult<Refund> {
        let original_reference = charge.gateway_reference.clone().ok_or_else(|| {
            BillingError::Consistency(format!(
                "settled charge {} has no gateway reference",
                charge.idempotency_key
            ))
        })?;

        self.set_status(refund.id, RefundStatus::Processing).await?;

        let ledger_key = refund_ledger_key(refund.id, attempt);
        let begun = self
            .ledger
            .begin(
                &ledger_key,
                TransactionKind::Refund,
                charge.subscription_id,
                refund.amount_cents,
                &charge.currency,
                charge.gateway,
            )
            .await?;

        if !begun.is_new && begun.transaction.status.is_terminal() {
            // This attempt already ran; mirror its stored outcome.
            let status = match begun.transaction.status {
                TransactionStatus::Succeeded => RefundStatus::Completed,
                _ => RefundStatus::Failed,
            };
            self.set_status(refund.id, status).await?;
            return self.get(refund.id).await;
        }

        let request = RefundRequest {
            idempotency_key: ledger_key.clone(),
            original_reference,
            amount_cents: refund.amount_cents,
        };

        let outcome = match self.gateways.rail(charge.gateway).refund(&request).await {
            Ok(outcome) => outcome,
            Err(e) => {
                // Transport failure: the ledger entry stays pending for the
                // webhook; the refund row is failed so an admin can retry.
                error!(refund_id = %refund.id, error = %e, "Refund gateway call failed");
                self.set_status(refund.id, RefundStatus::Failed).await?;
                return self.get(refund.id).await;
            }
        };

        match outcome {
            Outcome::Succeeded { reference } => {
                self.ledger
                    .finalize(
                        &ledger_key,
                        Disposition::Succeeded {
                            reference: reference.clone(),
                        },
                    )
                    .await?;
                self.complete(refund.id, &reference).await?;
                if let Ok(Some((subscriber_id,))) = self.subscriber_of(charge).await {
                    self.notifier
                        .refund_completed(subscriber_id, refund.amount_cents)
                        .await;
                }
            }
            Outcome::RequiresAction => {
                // Settles via webhook; the refund row stays processing.
                info!(refund_id = %refund.id, "Refund pending gateway confirmation");
            }
            Outcome::Failed { code } => {
                self.ledger
                    .finalize(&ledger_key, Disposition::Failed { code })
                    .await?;
                self.set_status(refund.id, RefundStatus::Failed).await?;
            }
        }

        self.get(refund.id).await
    }

    /// Admin retry of a failed refund: exactly one new attempt per call,
    /// bounded by the retry budget.
    ///
    /// The previous attempt's ledger entry is consulted first. A transport
    /// failure can mark the refund row failed while the rail actually paid
    /// out; a new attempt would then pay a second time. A still-pending entry
    /// blocks the retry until the webhook settles it, and an entry that
    /// settled as succeeded reconciles the row instead of touching the rail.
    pub async fn retry_refund(&self, refund_id: Uuid) -> BillingResult<Refund> {
        let current = self.get(refund_id).await?;
        if current.status == RefundStatus::Failed {
            let last_key = refund_ledger_key(refund_id, current.retry_count);
            match self.ledger.get(&last_key).await {
                Ok(prev) if prev.status == TransactionStatus::Pending => {
                    return Err(BillingError::ConcurrentModification(format!(
                        "refund attempt {last_key} is still awaiting gateway confirmation"
                    )));
                }
                Ok(prev) if prev.status == TransactionStatus::Succeeded => {
                    let reference = prev.gateway_reference.clone().unwrap_or_default();
                    info!(
                        refund_id = %refund_id,
                        ledger_key = %last_key,
                        "Previous refund attempt settled as succeeded, reconciling row"
                    );
                    self.complete(refund_id, &reference).await?;
                    return self.get(refund_id).await;
                }
                Ok(_) => {}
                // The attempt failed before the ledger entry was opened
                Err(BillingError::TransactionNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }

        let claimed: Option<Refund> = sqlx::query_as(&format!(
            r#"
            UPDATE refunds SET
                retry_count = retry_count + 1,
                updated_at = NOW()
            WHERE id = $1 AND status = 'failed' AND retry_count < $2
            RETURNING {REFUND_COLUMNS}
            "#
        ))
        .bind(refund_id)
        .bind(MAX_REFUND_RETRIES)
        .fetch_optional(&self.pool)
        .await?;

        let Some(refund) = claimed else {
            let existing = self.get(refund_id).await?;
            return match existing.status {
                RefundStatus::Failed => Err(BillingError::RefundRetriesExhausted(
                    existing.retry_count,
                )),
                _ => Err(BillingError::InvalidInput(format!(
                    "refund is {:?}, only failed refunds can be retried",
                    existing.status
                ))),
            };
        };

        let charge = self.ledger.get(&refund.transaction_key).await?;
        self.execute(refund.clone(), &charge, refund.retry_count).await
    }

    pub async fn get(&self, id: Uuid) -> BillingResult<Refund> {
        let refund: Option<Refund> = sqlx::query_as(&format!(
            "SELECT {REFUND_COLUMNS} FROM refunds WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        refund.ok_or_else(|| BillingError::RefundNotFound(id.to_string()))
    }

    async fn subscriber_of(&self, charge: &Transaction) -> BillingResult<Option<(Uuid,)>> {
        Ok(sqlx::query_as("SELECT subscriber_id FROM subscriptions WHERE id = $1")
            .bind(charge.subscription_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn set_status(&self, id: Uuid, status: RefundStatus) -> BillingResult<()> {
        sqlx::query("UPDATE refunds SET status = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(status)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn complete(&self, id: Uuid, gateway_reference: &str) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE refunds SET
                status = 'completed',
                gateway_reference = $2,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(gateway_reference)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
