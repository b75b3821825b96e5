//! NotifyHub REST API
//!
//! Axum router over the store, queue, and pipeline services. Identity is
//! asserted by an upstream gateway through `X-Auth-*` headers; everything
//! under `/api` requires one.

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use utoipa::OpenApi;

use nh_common::Clock;
use nh_pipeline::{AuditSink, TemplateEngine};
use nh_queue::JobQueue;
use nh_store::Store;

pub mod channels;
pub mod error;
pub mod health;
pub mod identity;
pub mod notifications;
pub mod templates;

pub use error::{ApiError, ErrorResponse};
pub use identity::Identity;

/// Shared service handles for all handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub queue: Arc<dyn JobQueue>,
    pub templates: Arc<TemplateEngine>,
    pub audit: Arc<dyn AuditSink>,
    pub clock: Arc<dyn Clock>,
    pub http_client: reqwest::Client,
    pub default_max_retries: u32,
}

#[derive(OpenApi)]
#[openapi(
    info(title = "NotifyHub API", description = "Centralized notification dispatch"),
    paths(
        notifications::create_notification,
        notifications::send_notification,
        notifications::list_notifications,
        notifications::get_notification,
        notifications::delivery_summary,
        templates::create_template,
        templates::list_templates,
        templates::get_template,
        templates::update_template,
        templates::delete_template,
        templates::test_template,
        channels::create_channel,
        channels::list_channels,
        channels::get_channel,
        channels::update_channel,
        channels::delete_channel,
        channels::test_channel,
        health::healthz,
        health::readyz,
        health::queue_stats,
    )
)]
pub struct ApiDoc;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health::healthz))
        .route("/readyz", get(health::readyz))
        .route("/api/queue/stats", get(health::queue_stats))
        .route(
            "/api/notifications",
            post(notifications::create_notification).get(notifications::list_notifications),
        )
        .route("/api/notifications/send", post(notifications::send_notification))
        .route("/api/notifications/{id}", get(notifications::get_notification))
        .route(
            "/api/notifications/delivery/{id}",
            get(notifications::delivery_summary),
        )
        .route(
            "/api/templates",
            post(templates::create_template).get(templates::list_templates),
        )
        .route(
            "/api/templates/{id}",
            get(templates::get_template)
                .put(templates::update_template)
                .delete(templates::delete_template),
        )
        .route("/api/templates/{id}/test", post(templates::test_template))
        .route(
            "/api/channels",
            post(channels::create_channel).get(channels::list_channels),
        )
        .route(
            "/api/channels/{id}",
            get(channels::get_channel)
                .put(channels::update_channel)
                .delete(channels::delete_channel),
        )
        .route("/api/channels/{id}/test", post(channels::test_channel))
        .with_state(state)
}
