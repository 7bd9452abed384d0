//! Idempotent transaction ledger
//!
//! Append-only record of every charge and refund attempt, keyed by a
//! caller-supplied idempotency key. The ledger guarantees at most one
//! financial side effect per key: `begin` tells the caller whether the key is
//! new (only then may the gateway be invoked), and `finalize` performs the
//! single `pending -> succeeded|failed` transition.
//!
//! A transaction can be finalized from two directions, the synchronous
//! gateway response and the asynchronous webhook, and whichever arrives
//! first wins. The loser's call lands on a row that is no longer `pending`:
//! the same outcome is a detected no-op, a different outcome is a consistency
//! violation that is logged for manual reconciliation and never overwrites
//! the stored result.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use tracing::{error, info};
use uuid::Uuid;

use rebill_shared::{GatewayKind, TransactionKind, TransactionStatus};

use crate::error::{BillingError, BillingResult};
use crate::gateway::{FailureCode, Outcome};
use crate::period::add_calendar_months;

/// A ledger entry for one attempted charge or refund
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Transaction {
    pub idempotency_key: String,
    pub kind: TransactionKind,
    pub subscription_id: Uuid,
    pub amount_cents: i64,
    pub currency: String,
    pub gateway: GatewayKind,
    pub status: TransactionStatus,
    pub gateway_reference: Option<String>,
    pub failure_code: Option<FailureCode>,
    pub created_at: OffsetDateTime,
    pub finalized_at: Option<OffsetDateTime>,
}

/// Result of `begin`: the stored transaction plus whether this caller created
/// it. Callers must branch on `is_new` before invoking the gateway.
#[derive(Debug, Clone)]
pub struct BeginOutcome {
    pub is_new: bool,
    pub transaction: Transaction,
}

/// Terminal disposition applied by `finalize`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Succeeded { reference: String },
    Failed { code: FailureCode },
}

impl Disposition {
    fn status(&self) -> TransactionStatus {
        match self {
            Self::Succeeded { .. } => TransactionStatus::Succeeded,
            Self::Failed { .. } => TransactionStatus::Failed,
        }
    }

    /// Translate a gateway outcome into a disposition, if it is terminal.
    /// `RequiresAction` stays pending until the webhook resolves it.
    pub fn from_outcome(outcome: &Outcome) -> Option<Self> {
        match outcome {
            Outcome::Succeeded { reference } => Some(Self::Succeeded {
                reference: reference.clone(),
            }),
            Outcome::Failed { code } => Some(Self::Failed { code: *code }),
            Outcome::RequiresAction => None,
        }
    }
}

/// What `finalize` did with the disposition
#[derive(Debug, Clone)]
pub enum FinalizeResult {
    /// This call performed the terminal transition
    Applied(Transaction),
    /// The transaction was already terminal with the same outcome; no-op
    AlreadyFinal(Transaction),
}

impl FinalizeResult {
    pub fn transaction(&self) -> &Transaction {
        match self {
            Self::Applied(t) | Self::AlreadyFinal(t) => t,
        }
    }
}

const TRANSACTION_COLUMNS: &str = r#"
    idempotency_key, kind, subscription_id, amount_cents, currency, gateway,
    status, gateway_reference, failure_code, created_at, finalized_at
"#;

/// The ledger service
#[derive(Clone)]
pub struct LedgerService {
    pool: PgPool,
}

impl LedgerService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a ledger entry for an attempt. If the key already exists the
    /// stored record is returned with `is_new = false` and nothing is
    /// written; the caller must not touch the gateway in that case.
    pub async fn begin(
        &self,
        idempotency_key: &str,
        kind: TransactionKind,
        subscription_id: Uuid,
        amount_cents: i64,
        currency: &str,
        gateway: GatewayKind,
    ) -> BillingResult<BeginOutcome> {
        let inserted: Option<Transaction> = sqlx::query_as(&format!(
            r#"
            INSERT INTO transactions
                (idempotency_key, kind, subscription_id, amount_cents, currency, gateway, status)
            VALUES ($1, $2, $3, $4, $5, $6, 'pending')
            ON CONFLICT (idempotency_key) DO NOTHING
            RETURNING {TRANSACTION_COLUMNS}
            "#
        ))
        .bind(idempotency_key)
        .bind(kind)
        .bind(subscription_id)
        .bind(amount_cents)
        .bind(currency)
        .bind(gateway)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(transaction) = inserted {
            return Ok(BeginOutcome {
                is_new: true,
                transaction,
            });
        }

        let existing = self.get(idempotency_key).await?;
        info!(
            idempotency_key = %idempotency_key,
            status = ?existing.status,
            "Idempotency key already recorded, returning stored outcome"
        );
        Ok(BeginOutcome {
            is_new: false,
            transaction: existing,
        })
    }

    pub async fn get(&self, idempotency_key: &str) -> BillingResult<Transaction> {
        let tx: Option<Transaction> = sqlx::query_as(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE idempotency_key = $1"
        ))
        .bind(idempotency_key)
        .fetch_optional(&self.pool)
        .await?;

        tx.ok_or_else(|| BillingError::TransactionNotFound(idempotency_key.to_string()))
    }

    /// Find a transaction by the reference the gateway assigned to it.
    /// Used by webhook reconciliation to correlate confirmation events.
    pub async fn get_by_gateway_reference(
        &self,
        gateway: GatewayKind,
        reference: &str,
    ) -> BillingResult<Transaction> {
        let tx: Option<Transaction> = sqlx::query_as(&format!(
            r#"
            SELECT {TRANSACTION_COLUMNS} FROM transactions
            WHERE gateway = $1 AND (gateway_reference = $2 OR idempotency_key = $2)
            "#
        ))
        .bind(gateway)
        .bind(reference)
        .fetch_optional(&self.pool)
        .await?;

        tx.ok_or_else(|| BillingError::TransactionNotFound(reference.to_string()))
    }

    /// Apply the terminal disposition exactly once.
    ///
    /// The status check and write are a single conditional UPDATE, so two
    /// finalize calls racing on the same key settle atomically: the first
    /// wins, the second observes a terminal row. A successful charge also
    /// extends the owning subscription's billing period inside the same
    /// database transaction, so the ledger and the subscription can never
    /// disagree about whether a renewal happened.
    pub async fn finalize(
        &self,
        idempotency_key: &str,
        disposition: Disposition,
    ) -> BillingResult<FinalizeResult> {
        let mut db_tx = self.pool.begin().await?;

        let (status, reference, failure_code) = match &disposition {
            Disposition::Succeeded { reference } => (
                TransactionStatus::Succeeded,
                Some(reference.clone()),
                None,
            ),
            Disposition::Failed { code } => (TransactionStatus::Failed, None, Some(*code)),
        };

        let updated: Option<Transaction> = sqlx::query_as(&format!(
            r#"
            UPDATE transactions SET
                status = $2,
                gateway_reference = COALESCE($3, gateway_reference),
                failure_code = $4,
                finalized_at = NOW()
            WHERE idempotency_key = $1 AND status = 'pending'
            RETURNING {TRANSACTION_COLUMNS}
            "#
        ))
        .bind(idempotency_key)
        .bind(status)
        .bind(&reference)
        .bind(failure_code)
        .fetch_optional(&mut *db_tx)
        .await?;

        let Some(transaction) = updated else {
            // Already terminal. Same outcome is a no-op; a conflicting
            // outcome is a consistency violation we refuse to apply.
            db_tx.rollback().await?;
            let existing = self.get(idempotency_key).await?;
            if existing.status == disposition.status() {
                return Ok(FinalizeResult::AlreadyFinal(existing));
            }
            error!(
                idempotency_key = %idempotency_key,
                stored_status = ?existing.status,
                attempted_status = ?disposition.status(),
                "Conflicting finalize on terminal transaction; keeping stored outcome"
            );
            return Err(BillingError::Consistency(format!(
                "transaction {idempotency_key} is already {:?}, refusing {:?}",
                existing.status,
                disposition.status()
            )));
        };

        if transaction.kind == TransactionKind::Charge
            && transaction.status == TransactionStatus::Succeeded
        {
            self.extend_subscription(&mut db_tx, transaction.subscription_id)
                .await?;
        }

        db_tx.commit().await?;

        info!(
            idempotency_key = %idempotency_key,
            kind = ?transaction.kind,
            status = ?transaction.status,
            "Finalized transaction"
        );
        Ok(FinalizeResult::Applied(transaction))
    }

    /// Roll the billing period forward one calendar month from the previous
    /// period end (not from "now"), reset the failure and usage counters, and
    /// reactivate the record. Runs inside the finalize transaction with the
    /// subscription row locked.
    async fn extend_subscription(
        &self,
        db_tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        subscription_id: Uuid,
    ) -> BillingResult<()> {
        let row: Option<(OffsetDateTime,)> = sqlx::query_as(
            "SELECT billing_period_end FROM subscriptions WHERE id = $1 FOR UPDATE",
        )
        .bind(subscription_id)
        .fetch_optional(&mut **db_tx)
        .await?;

        let (period_end,) = row.ok_or_else(|| {
            BillingError::SubscriptionNotFound(subscription_id.to_string())
        })?;

        let new_end = add_calendar_months(period_end, 1)?;

        sqlx::query(
            r#"
            UPDATE subscriptions SET
                billing_period_start = billing_period_end,
                billing_period_end = $2,
                status = 'active',
                failure_count = 0,
                last_failure_reason = NULL,
                monthly_usage = 0,
                warned_for_period_end = NULL,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(subscription_id)
        .bind(new_end)
        .execute(&mut **db_tx)
        .await?;

        info!(
            subscription_id = %subscription_id,
            new_period_end = %new_end,
            "Extended billing period after successful charge"
        );
        Ok(())
    }
}
