//! Rebill Billing Reliability Engine
//!
//! The core of the billing system: idempotent charge/refund ledger, renewal
//! scheduling, webhook reconciliation with retry/dead-letter handling, and
//! prorated refunds with over-refund protection.
//!
//! Everything here is written to survive unreliable networks and at-least-once
//! delivery: every external effect is keyed by an idempotency key, every status
//! transition is a conditional update, and a repeated request or re-delivered
//! event collapses into a no-op.

pub mod error;
pub mod gateway;
pub mod ledger;
pub mod notify;
pub mod period;
pub mod refunds;
pub mod reporting;
pub mod scheduler;
pub mod subscriptions;
pub mod webhooks;

pub use error::{BillingError, BillingResult};
pub use gateway::{
    ChargeRequest, FailureCode, GatewayConfig, GatewayRouter, Outcome, PaymentGateway,
    RefundRequest,
};
pub use ledger::{BeginOutcome, Disposition, FinalizeResult, LedgerService, Transaction};
pub use notify::NotificationDispatcher;
pub use refunds::{
    downgrade_credit_cents, prorated_credit_cents, refund_ledger_key, Refund, RefundService,
    RefundStatus,
};
pub use reporting::{BillingStats, ReportingService};
pub use scheduler::{ManualRenewal, RenewalScheduler, RunStats};
pub use subscriptions::{Subscription, SubscriptionStore};
pub use webhooks::{WebhookEvent, WebhookService, WebhookStatus};
