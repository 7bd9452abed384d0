//! Health check endpoints
//!
//! Beyond database connectivity, health reports the webhook queue depths an
//! operator cares about: a growing dead-letter queue means payment
//! confirmations are not reconciling.

use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;

use crate::state::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub database: String,
    pub webhooks_pending: i64,
    pub webhooks_dead_letter: i64,
}

/// Health check endpoint
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let queue_depths: Option<(i64, i64)> = sqlx::query_as(
        r#"
        SELECT
            COUNT(*) FILTER (WHERE status = 'pending'),
            COUNT(*) FILTER (WHERE status = 'dead_letter')
        FROM webhook_events
        "#,
    )
    .fetch_one(&state.pool)
    .await
    .ok();

    let (overall, database, pending, dead_letter) = match queue_depths {
        Some((pending, dead_letter)) => (StatusCode::OK, "healthy", pending, dead_letter),
        None => (StatusCode::SERVICE_UNAVAILABLE, "unhealthy", 0, 0),
    };

    (
        overall,
        Json(HealthResponse {
            status: if overall == StatusCode::OK {
                "healthy".to_string()
            } else {
                "unhealthy".to_string()
            },
            version: env!("CARGO_PKG_VERSION").to_string(),
            database: database.to_string(),
            webhooks_pending: pending,
            webhooks_dead_letter: dead_letter,
        }),
    )
}

/// Liveness probe (just returns 200 if the server is running)
pub async fn liveness() -> StatusCode {
    StatusCode::OK
}

/// Readiness probe: the service can take traffic once the database answers
/// and the billing schema is in place.
pub async fn readiness(State(state): State<AppState>) -> StatusCode {
    match sqlx::query("SELECT 1 FROM subscriptions LIMIT 1")
        .execute(&state.pool)
        .await
    {
        Ok(_) => StatusCode::OK,
        Err(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}
