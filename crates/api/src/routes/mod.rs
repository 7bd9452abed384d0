//! API routes

pub mod admin;
pub mod billing;
pub mod health;
pub mod webhooks;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::state::AppState;

/// Create all API routes
pub fn create_router(state: AppState) -> Router {
    let health_routes = Router::new()
        .route("/health", get(health::health))
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness));

    // Public: signature-verified gateway callbacks
    let webhook_routes = Router::new().route("/webhooks/:gateway", post(webhooks::receive));

    // Subscriber routes (bearer token)
    let billing_routes = Router::new()
        .route("/billing/renew", post(billing::manual_renew))
        .route("/billing/cancel", post(billing::cancel))
        .route("/billing/downgrade", post(billing::schedule_downgrade))
        .route("/billing/refunds", post(billing::request_refund))
        .route("/billing/refunds/:id", get(billing::refund_status));

    // Admin routes (bearer token with admin role)
    let admin_routes = Router::new()
        .route("/admin/webhooks/dead-letter", get(admin::list_dead_letter))
        .route("/admin/webhooks/:id/retry", post(admin::retry_dead_letter))
        .route("/admin/refunds/:id/retry", post(admin::retry_refund))
        .route("/admin/renewals/run", post(admin::run_renewals))
        .route("/admin/stats", get(admin::stats));

    let api_routes = Router::new()
        .merge(webhook_routes)
        .merge(billing_routes)
        .merge(admin_routes);

    Router::new()
        .merge(health_routes)
        .nest("/api/v1", api_routes)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
