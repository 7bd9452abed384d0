//! Admin endpoints: dead-letter inspection, manual retries, stats.

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Deserialize;
use serde_json::json;
use time::Duration;
use uuid::Uuid;

use rebill_billing::BillingStats;

use crate::auth::AuthUser;
use crate::error::{ApiError, ApiResult};
use crate::routes::billing::RefundResponse;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct DeadLetterQuery {
    pub limit: Option<i64>,
}

/// GET /admin/webhooks/dead-letter
pub async fn list_dead_letter(
    State(state): State<AppState>,
    auth: AuthUser,
    Query(query): Query<DeadLetterQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    auth.require_admin()?;

    let limit = query.limit.unwrap_or(50).clamp(1, 500);
    let events = state.webhooks.list_dead_letter(limit).await?;
    Ok(Json(json!({ "events": events })))
}

/// POST /admin/webhooks/:id/retry
pub async fn retry_dead_letter(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(event_id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    auth.require_admin()?;

    state.webhooks.reprocess_dead_letter(event_id).await?;
    Ok(Json(json!({ "reprocessed": true })))
}

/// POST /admin/refunds/:id/retry
pub async fn retry_refund(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(refund_id): Path<Uuid>,
) -> ApiResult<Json<RefundResponse>> {
    auth.require_admin()?;

    let refund = state.refunds.retry_refund(refund_id).await?;
    Ok(Json(refund.into()))
}

#[derive(Debug, Deserialize)]
pub struct StatsQuery {
    pub window_hours: Option<i64>,
}

/// GET /admin/stats
pub async fn stats(
    State(state): State<AppState>,
    auth: AuthUser,
    Query(query): Query<StatsQuery>,
) -> ApiResult<Json<BillingStats>> {
    auth.require_admin()?;

    let hours = query.window_hours.unwrap_or(24);
    if !(1..=24 * 90).contains(&hours) {
        return Err(ApiError::BadRequest(
            "window_hours must be between 1 and 2160".to_string(),
        ));
    }

    let stats = state.reporting.stats(Duration::hours(hours)).await?;
    Ok(Json(stats))
}

/// POST /admin/renewals/run. Kicks the renewal sweep outside its schedule.
pub async fn run_renewals(
    State(state): State<AppState>,
    auth: AuthUser,
) -> ApiResult<Json<serde_json::Value>> {
    auth.require_admin()?;

    let run = state.scheduler.run_renewals().await?;
    Ok(Json(json!({
        "attempted": run.attempted,
        "renewed": run.renewed,
        "failed": run.failed,
        "skipped": run.skipped,
        "pending": run.pending,
    })))
}
