//! Health and observability endpoints.
//!
//! `/healthz` and `/readyz` are unauthenticated so the gateway and
//! orchestrator can hit them directly.

use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;
use utoipa::ToSchema;

use nh_queue::QueueStats;

use crate::error::Result;
use crate::identity::Identity;
use crate::AppState;

#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: &'static str,
    pub version: &'static str,
}

/// Liveness probe
#[utoipa::path(
    get,
    path = "/healthz",
    tag = "health",
    responses((status = 200, description = "Service is alive", body = HealthResponse))
)]
pub async fn healthz() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: "notifyhub",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Readiness probe: both the store and the queue database must answer.
#[utoipa::path(
    get,
    path = "/readyz",
    tag = "health",
    responses(
        (status = 200, description = "Service is ready", body = HealthResponse),
        (status = 503, description = "A dependency is unavailable")
    )
)]
pub async fn readyz(
    State(state): State<AppState>,
) -> std::result::Result<Json<HealthResponse>, StatusCode> {
    if state.store.ping().await.is_err() {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }
    if state.queue.stats().await.is_err() {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }
    Ok(Json(HealthResponse {
        status: "ready",
        service: "notifyhub",
        version: env!("CARGO_PKG_VERSION"),
    }))
}

/// Per-queue depth and in-flight counts
#[utoipa::path(
    get,
    path = "/api/queue/stats",
    tag = "health",
    responses(
        (status = 200, description = "Queue statistics", body = Vec<QueueStats>),
        (status = 401, description = "Missing identity headers")
    )
)]
pub async fn queue_stats(
    State(state): State<AppState>,
    _identity: Identity,
) -> Result<Json<Vec<QueueStats>>> {
    Ok(Json(state.queue.stats().await?))
}
