//! Shared application state

use sqlx::PgPool;
use std::sync::Arc;

use rebill_billing::{
    GatewayConfig, GatewayRouter, LedgerService, NotificationDispatcher, RefundService,
    RenewalScheduler, ReportingService, SubscriptionStore, WebhookService,
};

use crate::config::Config;

/// State shared by all request handlers
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Arc<Config>,
    pub scheduler: RenewalScheduler,
    pub store: SubscriptionStore,
    pub refunds: RefundService,
    pub webhooks: WebhookService,
    pub reporting: ReportingService,
}

impl AppState {
    pub fn new(pool: PgPool, config: Config) -> Self {
        let gateways = Arc::new(GatewayRouter::new(GatewayConfig {
            card_base_url: config.card_gateway_url.clone(),
            card_api_key: config.card_gateway_api_key.clone(),
            momo_base_url: config.momo_gateway_url.clone(),
            momo_api_key: config.momo_gateway_api_key.clone(),
        }));
        let notifier =
            NotificationDispatcher::new(reqwest::Client::new(), config.notify_base_url.clone());

        let store = SubscriptionStore::new(pool.clone());
        let ledger = LedgerService::new(pool.clone());
        let scheduler = RenewalScheduler::new(
            store.clone(),
            ledger.clone(),
            Arc::clone(&gateways),
            notifier.clone(),
        );
        let refunds = RefundService::new(
            pool.clone(),
            ledger.clone(),
            Arc::clone(&gateways),
            notifier.clone(),
        );
        let webhooks = WebhookService::new(pool.clone(), ledger, notifier);
        let reporting = ReportingService::new(pool.clone());

        Self {
            pool,
            config: Arc::new(config),
            scheduler,
            store,
            refunds,
            webhooks,
            reporting,
        }
    }
}
