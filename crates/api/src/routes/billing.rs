//! Subscriber-facing billing endpoints: manual renewal, cancellation,
//! downgrades, and refund requests.

use axum::{
    extract::{Path, State},
    Json,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use rebill_billing::{downgrade_credit_cents, Refund, RefundStatus};
use rebill_shared::Plan;

use crate::auth::AuthUser;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct RenewRequest {
    /// Admins may renew on behalf of another subscriber
    pub subscriber_id: Option<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct RenewResponse {
    pub transaction_key: String,
    pub new_period_end: OffsetDateTime,
}

/// POST /billing/renew, synchronous renewal for one subscriber
pub async fn manual_renew(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(request): Json<RenewRequest>,
) -> ApiResult<Json<RenewResponse>> {
    let target = match request.subscriber_id {
        Some(other) if other != auth.subscriber_id => {
            auth.require_admin()?;
            other
        }
        _ => auth.subscriber_id,
    };

    let renewal = state.scheduler.manual_renew(target).await?;
    Ok(Json(RenewResponse {
        transaction_key: renewal.transaction_key,
        new_period_end: renewal.new_period_end,
    }))
}

/// POST /billing/cancel. Stops future renewals; access runs to the period end.
pub async fn cancel(
    State(state): State<AppState>,
    auth: AuthUser,
) -> ApiResult<Json<serde_json::Value>> {
    let subscription = state.store.cancel(auth.subscriber_id).await?;
    Ok(Json(serde_json::json!({
        "status": subscription.status,
        "access_until": subscription.billing_period_end,
    })))
}

#[derive(Debug, Deserialize)]
pub struct DowngradeRequest {
    pub new_plan: Plan,
}

#[derive(Debug, Serialize)]
pub struct DowngradeResponse {
    pub new_plan: Plan,
    pub effective_at: OffsetDateTime,
    /// What a prorated refund of the unused difference would be worth today
    pub prorated_credit_cents: i64,
}

/// POST /billing/downgrade. Schedules a downgrade for the period boundary.
pub async fn schedule_downgrade(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(request): Json<DowngradeRequest>,
) -> ApiResult<Json<DowngradeResponse>> {
    let subscription = state.store.get_by_subscriber(auth.subscriber_id).await?;
    if request.new_plan >= subscription.plan {
        return Err(ApiError::BadRequest(format!(
            "{} is not a downgrade from {}",
            request.new_plan, subscription.plan
        )));
    }

    let effective_at = subscription.billing_period_end;
    let credit = downgrade_credit_cents(&subscription, request.new_plan, OffsetDateTime::now_utc());
    state
        .store
        .schedule_downgrade(auth.subscriber_id, request.new_plan, effective_at)
        .await?;

    Ok(Json(DowngradeResponse {
        new_plan: request.new_plan,
        effective_at,
        prorated_credit_cents: credit,
    }))
}

#[derive(Debug, Deserialize)]
pub struct RefundApiRequest {
    pub transaction_key: String,
    pub amount_cents: i64,
    pub reason: String,
}

#[derive(Debug, Serialize)]
pub struct RefundResponse {
    pub refund_id: Uuid,
    pub status: RefundStatus,
}

impl From<Refund> for RefundResponse {
    fn from(refund: Refund) -> Self {
        Self {
            refund_id: refund.id,
            status: refund.status,
        }
    }
}

/// POST /billing/refunds
pub async fn request_refund(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(request): Json<RefundApiRequest>,
) -> ApiResult<Json<RefundResponse>> {
    let refund = state
        .refunds
        .request_refund(
            auth.subscriber_id,
            auth.is_admin,
            &request.transaction_key,
            request.amount_cents,
            &request.reason,
        )
        .await?;

    Ok(Json(refund.into()))
}

/// GET /billing/refunds/:id
pub async fn refund_status(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(refund_id): Path<Uuid>,
) -> ApiResult<Json<RefundResponse>> {
    let refund = state.refunds.get(refund_id).await?;
    if !auth.is_admin && refund.requested_by != auth.subscriber_id {
        return Err(ApiError::Forbidden);
    }
    Ok(Json(refund.into()))
}
