//! Renewal scheduler
//!
//! The daily batch that discovers subscriptions due for renewal and drives
//! each one through the ledger and the gateway adapter, plus the companion
//! sweeps (expiry warnings, expiry, pending downgrades) and the synchronous
//! manual-renewal entry point.
//!
//! Batch discipline: candidates are paged with keyset pagination, processed
//! under a bounded worker pool, and every per-subscription failure is
//! contained to that subscription; the run always finishes and reports
//! aggregate counts. All run state lives in a [`RunStats`] accumulator passed
//! through the run, so overlapping invocations cannot trample each other.

use rand::distributions::Alphanumeric;
use rand::Rng;
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use uuid::Uuid;

use rebill_shared::TransactionKind;

use crate::error::{BillingError, BillingResult};
use crate::gateway::{ChargeRequest, GatewayRouter, Outcome};
use crate::ledger::{Disposition, LedgerService};
use crate::notify::NotificationDispatcher;
use crate::subscriptions::{Subscription, SubscriptionStore};

/// How far ahead of the period end a renewal is attempted
const RENEWAL_LOOKAHEAD: Duration = Duration::days(1);

/// Expiry warnings go out this far before a non-renewing period lapses
const WARNING_WINDOW: Duration = Duration::days(3);

/// Candidates fetched per page
const PAGE_SIZE: i64 = 100;

/// Concurrent renewal attempts within one run
const WORKER_LIMIT: usize = 8;

/// A subscription stops being retried after this many consecutive failures
const MAX_FAILURES: i32 = 3;

/// Days to wait before retrying after the Nth consecutive failure
pub fn retry_delay(failure_count: i32) -> Duration {
    match failure_count {
        i32::MIN..=1 => Duration::days(1),
        2 => Duration::days(3),
        _ => Duration::days(7),
    }
}

/// Generate a renewal idempotency key: `RENEW-{timestampBase36}-{random4}`
pub fn renewal_idempotency_key(now: OffsetDateTime) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(4)
        .map(char::from)
        .collect();
    format!("RENEW-{}-{}", to_base36(now.unix_timestamp()), suffix)
}

fn to_base36(mut n: i64) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n <= 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while n > 0 {
        out.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    out.reverse();
    String::from_utf8_lossy(&out).into_owned()
}

/// Run-scoped accumulator for one scheduler invocation
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunStats {
    pub attempted: u32,
    pub renewed: u32,
    pub failed: u32,
    pub skipped: u32,
    /// Charges awaiting asynchronous confirmation (requires-action)
    pub pending: u32,
}

impl RunStats {
    fn absorb(&mut self, outcome: AttemptOutcome) {
        match outcome {
            AttemptOutcome::Renewed => {
                self.attempted += 1;
                self.renewed += 1;
            }
            AttemptOutcome::Failed => {
                self.attempted += 1;
                self.failed += 1;
            }
            AttemptOutcome::Pending => {
                self.attempted += 1;
                self.pending += 1;
            }
            AttemptOutcome::Skipped => self.skipped += 1,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum AttemptOutcome {
    Renewed,
    Failed,
    Pending,
    Skipped,
}

/// Result of a manual renewal request
#[derive(Debug, Clone, serde::Serialize)]
pub struct ManualRenewal {
    pub transaction_key: String,
    pub new_period_end: OffsetDateTime,
}

/// Drives renewals, warnings, expiry, and downgrades
#[derive(Clone)]
pub struct RenewalScheduler {
    store: SubscriptionStore,
    ledger: LedgerService,
    gateways: Arc<GatewayRouter>,
    notifier: NotificationDispatcher,
}

impl RenewalScheduler {
    pub fn new(
        store: SubscriptionStore,
        ledger: LedgerService,
        gateways: Arc<GatewayRouter>,
        notifier: NotificationDispatcher,
    ) -> Self {
        Self {
            store,
            ledger,
            gateways,
            notifier,
        }
    }

    /// The daily renewal run. Tolerates overlapping invocations: record-level
    /// claims and idempotency keys make the duplicate work settle as skips.
    pub async fn run_renewals(&self) -> BillingResult<RunStats> {
        let now = OffsetDateTime::now_utc();
        let mut stats = RunStats::default();
        let semaphore = Arc::new(Semaphore::new(WORKER_LIMIT));
        let mut after: Option<Uuid> = None;

        loop {
            let page = self
                .store
                .due_for_renewal(now, RENEWAL_LOOKAHEAD, after, PAGE_SIZE)
                .await?;
            let Some(last) = page.last() else {
                break;
            };
            after = Some(last.id);

            let mut tasks: JoinSet<AttemptOutcome> = JoinSet::new();
            for subscription in page {
                let scheduler = self.clone();
                let semaphore = Arc::clone(&semaphore);
                tasks.spawn(async move {
                    let _permit = match semaphore.acquire_owned().await {
                        Ok(p) => p,
                        Err(_) => return AttemptOutcome::Skipped,
                    };
                    scheduler.renew_one(subscription, now, false).await
                });
            }

            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok(outcome) => stats.absorb(outcome),
                    Err(e) => {
                        error!(error = %e, "Renewal task panicked");
                        stats.absorb(AttemptOutcome::Failed);
                    }
                }
            }
        }

        info!(
            attempted = stats.attempted,
            renewed = stats.renewed,
            failed = stats.failed,
            skipped = stats.skipped,
            pending = stats.pending,
            "Renewal run complete"
        );
        Ok(stats)
    }

    /// One subscription through the renewal algorithm. Never propagates an
    /// error; everything is folded into the outcome so the batch continues.
    async fn renew_one(
        &self,
        subscription: Subscription,
        now: OffsetDateTime,
        bypass_retry_gate: bool,
    ) -> AttemptOutcome {
        let id = subscription.id;

        if !subscription.status.is_renewable() {
            return AttemptOutcome::Skipped;
        }

        // Retry budget exhausted: stop attempting and flag for action
        if subscription.failure_count >= MAX_FAILURES {
            match self.store.disable_auto_renew_exhausted(id).await {
                Ok(true) => {
                    self.notifier
                        .action_required(subscription.subscriber_id, "renewal retries exhausted")
                        .await;
                }
                Ok(false) => {}
                Err(e) => error!(subscription_id = %id, error = %e, "Failed to disable auto-renew"),
            }
            return AttemptOutcome::Skipped;
        }

        // A scheduled retry that is not due yet
        if !bypass_retry_gate {
            if let Some(last_attempt) = subscription.last_attempt_at {
                if now < last_attempt + retry_delay(subscription.failure_count) {
                    return AttemptOutcome::Skipped;
                }
            }
        }

        // Claim the record; a concurrent run holding the claim wins
        match self
            .claim(id, subscription.last_attempt_at, now)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                warn!(subscription_id = %id, "Attempt already claimed by a concurrent run");
                return AttemptOutcome::Skipped;
            }
            Err(e) => {
                error!(subscription_id = %id, error = %e, "Failed to claim renewal attempt");
                return AttemptOutcome::Failed;
            }
        }

        let key = renewal_idempotency_key(now);
        match self.attempt_charge(&subscription, &key, now).await {
            Ok(AttemptOutcome::Renewed) => AttemptOutcome::Renewed,
            Ok(outcome) => outcome,
            Err(e) => {
                error!(subscription_id = %id, error = %e, "Renewal attempt errored");
                AttemptOutcome::Failed
            }
        }
    }

    /// Claim with a short backoff retry around transient database errors.
    /// A conditional-update miss is a real skip, not a retryable error.
    async fn claim(
        &self,
        id: Uuid,
        expected: Option<OffsetDateTime>,
        now: OffsetDateTime,
    ) -> BillingResult<bool> {
        use tokio_retry::strategy::{jitter, ExponentialBackoff};
        use tokio_retry::Retry;

        let strategy = ExponentialBackoff::from_millis(50).map(jitter).take(3);
        Retry::spawn(strategy, || self.store.claim_attempt(id, expected, now)).await
    }

    /// Ledger begin -> gateway charge -> ledger finalize, with the spec'd
    /// bookkeeping on each outcome.
    async fn attempt_charge(
        &self,
        subscription: &Subscription,
        idempotency_key: &str,
        now: OffsetDateTime,
    ) -> BillingResult<AttemptOutcome> {
        let amount_cents = subscription.plan.monthly_price_cents();
        let begun = self
            .ledger
            .begin(
                idempotency_key,
                TransactionKind::Charge,
                subscription.id,
                amount_cents,
                "USD",
                subscription.gateway,
            )
            .await?;

        if !begun.is_new {
            // The key has already been attempted; report the stored outcome
            // without touching the gateway again.
            return Ok(match begun.transaction.status {
                rebill_shared::TransactionStatus::Succeeded => AttemptOutcome::Renewed,
                rebill_shared::TransactionStatus::Failed => AttemptOutcome::Failed,
                rebill_shared::TransactionStatus::Pending => AttemptOutcome::Pending,
            });
        }

        let request = ChargeRequest {
            idempotency_key: idempotency_key.to_string(),
            amount_cents,
            currency: "USD".to_string(),
            payment_instrument: subscription.payment_instrument.clone(),
        };

        let outcome = match self.gateways.rail(subscription.gateway).charge(&request).await {
            Ok(outcome) => outcome,
            Err(e) if e.is_transient() => {
                // Transport failure: the rail's answer is unknown, so the
                // ledger entry stays pending for the webhook to settle.
                // Schedule a retry through the normal failure bookkeeping.
                warn!(
                    subscription_id = %subscription.id,
                    error = %e,
                    "Gateway unreachable, leaving transaction pending"
                );
                self.handle_charge_failure(subscription, "transient_error", false, now)
                    .await;
                return Ok(AttemptOutcome::Failed);
            }
            Err(e) => return Err(e),
        };

        match &outcome {
            Outcome::Succeeded { .. } => {
                if let Some(disposition) = Disposition::from_outcome(&outcome) {
                    self.finalize_quietly(idempotency_key, disposition).await;
                }
                let renewed = self.store.get(subscription.id).await?;
                self.notifier
                    .renewal_succeeded(subscription.subscriber_id, renewed.billing_period_end)
                    .await;
                Ok(AttemptOutcome::Renewed)
            }
            Outcome::RequiresAction => {
                // Confirmation arrives by webhook; nothing to finalize yet
                info!(
                    subscription_id = %subscription.id,
                    idempotency_key = %idempotency_key,
                    "Charge pending subscriber action"
                );
                Ok(AttemptOutcome::Pending)
            }
            Outcome::Failed { code } => {
                if let Some(disposition) = Disposition::from_outcome(&outcome) {
                    self.finalize_quietly(idempotency_key, disposition).await;
                }
                self.handle_charge_failure(
                    subscription,
                    code.as_reason(),
                    code.is_permanent(),
                    now,
                )
                .await;
                Ok(AttemptOutcome::Failed)
            }
        }
    }

    /// Finalize, demoting a consistency conflict to a loud log: the webhook
    /// beat us to the terminal state and its outcome stands.
    async fn finalize_quietly(&self, idempotency_key: &str, disposition: Disposition) {
        match self.ledger.finalize(idempotency_key, disposition).await {
            Ok(_) => {}
            Err(BillingError::Consistency(msg)) => {
                error!(idempotency_key = %idempotency_key, conflict = %msg, "Finalize conflict, stored outcome kept");
            }
            Err(e) => {
                error!(idempotency_key = %idempotency_key, error = %e, "Finalize failed");
            }
        }
    }

    /// Failure bookkeeping and the matching notification
    async fn handle_charge_failure(
        &self,
        subscription: &Subscription,
        reason: &str,
        permanent: bool,
        now: OffsetDateTime,
    ) {
        let new_count = subscription.failure_count + 1;
        let disable = permanent || new_count >= MAX_FAILURES;

        let result = self
            .store
            .record_renewal_failure(
                subscription.id,
                subscription.failure_count,
                reason,
                disable,
                now,
            )
            .await;

        if let Err(e) = result {
            // Contained: the record moved under us, the other writer's
            // bookkeeping stands.
            warn!(subscription_id = %subscription.id, error = %e, "Failure bookkeeping skipped");
            return;
        }

        if disable {
            self.notifier
                .action_required(subscription.subscriber_id, reason)
                .await;
        } else {
            let next_retry_at = now + retry_delay(new_count);
            self.notifier
                .renewal_failed(subscription.subscriber_id, new_count, Some(next_retry_at))
                .await;
        }
    }

    /// Synchronous renewal for one subscriber: same algorithm, bypassing only
    /// the retry-delay gate. Still subject to idempotency and the failure-count
    /// cap.
    pub async fn manual_renew(&self, subscriber_id: Uuid) -> BillingResult<ManualRenewal> {
        let subscription = self.store.get_by_subscriber(subscriber_id).await?;
        let now = OffsetDateTime::now_utc();

        if !subscription.status.is_renewable() {
            return Err(BillingError::InvalidInput(format!(
                "subscription is {} and cannot be renewed",
                subscription.status
            )));
        }
        if subscription.failure_count >= MAX_FAILURES {
            return Err(BillingError::InvalidInput(
                "payment method needs updating before renewal can be retried".to_string(),
            ));
        }

        if !self
            .store
            .claim_attempt(subscription.id, subscription.last_attempt_at, now)
            .await?
        {
            return Err(BillingError::ConcurrentModification(
                "a renewal attempt is already in flight".to_string(),
            ));
        }

        let key = renewal_idempotency_key(now);
        match self.attempt_charge(&subscription, &key, now).await? {
            AttemptOutcome::Renewed => {
                let renewed = self.store.get(subscription.id).await?;
                Ok(ManualRenewal {
                    transaction_key: key,
                    new_period_end: renewed.billing_period_end,
                })
            }
            AttemptOutcome::Pending => Err(BillingError::Gateway(
                "charge pending confirmation from the payment provider".to_string(),
            )),
            _ => {
                let current = self.store.get(subscription.id).await?;
                let code = current
                    .last_failure_reason
                    .unwrap_or_else(|| "charge failed".to_string());
                Err(BillingError::Gateway(code))
            }
        }
    }

    /// Warn non-renewing subscribers whose period lapses soon. One warning
    /// per period end.
    pub async fn run_expiry_warnings(&self) -> BillingResult<u32> {
        let now = OffsetDateTime::now_utc();
        let candidates = self
            .store
            .warning_candidates(now, WARNING_WINDOW, PAGE_SIZE)
            .await?;

        let mut warned = 0u32;
        for subscription in candidates {
            match self
                .store
                .mark_warned(subscription.id, subscription.billing_period_end)
                .await
            {
                Ok(true) => {
                    self.notifier
                        .expiry_warning(
                            subscription.subscriber_id,
                            subscription.billing_period_end,
                        )
                        .await;
                    warned += 1;
                }
                Ok(false) => {} // period end moved; warning no longer applies
                Err(e) => {
                    error!(subscription_id = %subscription.id, error = %e, "Failed to mark warned")
                }
            }
        }

        if warned > 0 {
            info!(warned = warned, "Expiry warnings dispatched");
        }
        Ok(warned)
    }

    /// Soft-expire lapsed subscriptions
    pub async fn run_expiry_sweep(&self) -> BillingResult<u64> {
        let expired = self.store.expire_lapsed(OffsetDateTime::now_utc()).await?;
        if expired > 0 {
            info!(expired = expired, "Expired lapsed subscriptions");
        }
        Ok(expired)
    }

    /// Apply downgrades whose effective date has passed
    pub async fn run_downgrade_sweep(&self) -> BillingResult<u32> {
        self.store
            .apply_due_downgrades(OffsetDateTime::now_utc())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn test_retry_delay_ladder() {
        assert_eq!(retry_delay(0), Duration::days(1));
        assert_eq!(retry_delay(1), Duration::days(1));
        assert_eq!(retry_delay(2), Duration::days(3));
        assert_eq!(retry_delay(3), Duration::days(7));
        assert_eq!(retry_delay(10), Duration::days(7));
    }

    #[test]
    fn test_retry_gate_example() {
        // failure_count=2, last attempt 2 days ago, delay is 3 days: not due
        let now = datetime!(2025-06-10 00:00 UTC);
        let last_attempt = datetime!(2025-06-08 00:00 UTC);
        assert!(now < last_attempt + retry_delay(2));

        // At day 3 the attempt is due
        let now = datetime!(2025-06-11 00:00 UTC);
        assert!(now >= last_attempt + retry_delay(2));
    }

    #[test]
    fn test_idempotency_key_format() {
        let key = renewal_idempotency_key(datetime!(2025-06-10 00:00 UTC));
        let parts: Vec<&str> = key.split('-').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "RENEW");
        assert!(parts[1].chars().all(|c| c.is_ascii_alphanumeric()));
        assert_eq!(parts[2].len(), 4);
    }

    #[test]
    fn test_base36() {
        assert_eq!(to_base36(0), "0");
        assert_eq!(to_base36(35), "z");
        assert_eq!(to_base36(36), "10");
        assert_eq!(to_base36(1_700_000_000), "s44we8");
    }

    #[test]
    fn test_stats_absorb() {
        let mut stats = RunStats::default();
        stats.absorb(AttemptOutcome::Renewed);
        stats.absorb(AttemptOutcome::Failed);
        stats.absorb(AttemptOutcome::Skipped);
        stats.absorb(AttemptOutcome::Pending);
        assert_eq!(stats.attempted, 3);
        assert_eq!(stats.renewed, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.pending, 1);
    }
}
