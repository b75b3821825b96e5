//! Notifications API
//!
//! Create, list, and inspect notifications. Validation happens here,
//! synchronously: a request that fails validation is rejected with 400 and
//! nothing is persisted or enqueued.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::info;
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use nh_common::{
    AuditEvent, AuditEventKind, ChannelKind, Delivery, Notification, NotificationPriority,
    NotificationStatus,
};
use nh_pipeline::dispatch_notification;
use nh_queue::{EnqueueOptions, JobPayload, QueueName};
use nh_store::{DeliverySummary, NotificationFilter};

use crate::error::{ApiError, Result};
use crate::identity::Identity;
use crate::AppState;

const MAX_PAGE_SIZE: u32 = 100;

/// Create notification request: direct content (`title` + `message`) or
/// `template_name` + `variables`.
#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateNotificationRequest {
    pub external_id: Option<String>,

    /// Caller-defined classification, e.g. "alert" or "digest"
    pub notification_type: Option<String>,

    pub priority: Option<NotificationPriority>,

    pub title: Option<String>,
    pub message: Option<String>,
    pub html_message: Option<String>,

    pub template_name: Option<String>,
    #[serde(default)]
    pub variables: HashMap<String, serde_json::Value>,

    #[serde(default)]
    pub recipients: Vec<String>,
    #[serde(default)]
    pub channels: Vec<ChannelKind>,

    pub scheduled_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub max_retries: Option<u32>,

    pub source_service: Option<String>,
    pub source_tool: Option<String>,
    pub user_id: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateNotificationResponse {
    pub id: String,
    pub status: NotificationStatus,
    /// Which queue the notification was routed to
    pub queue: String,
}

/// Query parameters for the notifications list
#[derive(Debug, Default, Deserialize, IntoParams)]
#[serde(rename_all = "camelCase")]
#[into_params(parameter_in = Query)]
pub struct NotificationsQuery {
    pub status: Option<NotificationStatus>,
    #[serde(rename = "type")]
    pub notification_type: Option<String>,
    pub priority: Option<NotificationPriority>,
    pub source_service: Option<String>,
    pub source_tool: Option<String>,
    pub user_id: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u64>,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct NotificationListResponse {
    pub data: Vec<Notification>,
    pub total: u64,
    pub limit: u32,
    pub offset: u64,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct NotificationDetailResponse {
    #[serde(flatten)]
    pub notification: Notification,
    pub deliveries: Vec<Delivery>,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeliverySummaryResponse {
    pub notification_id: String,
    pub summary: DeliverySummary,
    pub deliveries: Vec<Delivery>,
}

/// Validate the request and build the notification row. Template-backed
/// requests dry-run the renderer for every requested channel, so missing
/// variables and unsupported channels fail here with nothing persisted.
async fn build_notification(
    state: &AppState,
    identity: &Identity,
    req: CreateNotificationRequest,
) -> Result<Notification> {
    if req.recipients.is_empty() {
        return Err(ApiError::validation("At least one recipient is required"));
    }
    if req.channels.is_empty() {
        return Err(ApiError::validation("At least one channel is required"));
    }

    let now = state.clock.now();
    if let Some(expires_at) = req.expires_at {
        if expires_at <= now {
            return Err(ApiError::validation("expiresAt must be in the future"));
        }
        if let Some(scheduled_at) = req.scheduled_at {
            if expires_at <= scheduled_at {
                return Err(ApiError::validation("expiresAt must be after scheduledAt"));
            }
        }
    }

    let (title, message) = match &req.template_name {
        Some(name) => {
            let mut rendered = None;
            for channel in &req.channels {
                rendered = Some(state.templates.render(name, &req.variables, *channel).await?);
            }
            // channels is non-empty, so rendered is always set by now
            let rendered = rendered.ok_or_else(|| ApiError::internal("render produced nothing"))?;
            (rendered.subject, rendered.body)
        }
        None => {
            let title = req
                .title
                .clone()
                .filter(|t| !t.trim().is_empty())
                .ok_or_else(|| {
                    ApiError::validation("Either templateName or title and message are required")
                })?;
            let message = req
                .message
                .clone()
                .filter(|m| !m.trim().is_empty())
                .ok_or_else(|| {
                    ApiError::validation("Either templateName or title and message are required")
                })?;
            (title, message)
        }
    };

    let mut recipients: Vec<String> = Vec::new();
    for r in &req.recipients {
        let trimmed = r.trim();
        if trimmed.is_empty() {
            return Err(ApiError::validation("Recipients must not be blank"));
        }
        if !recipients.iter().any(|existing| existing == trimmed) {
            recipients.push(trimmed.to_string());
        }
    }

    let mut channels: Vec<ChannelKind> = Vec::new();
    for c in &req.channels {
        if !channels.contains(c) {
            channels.push(*c);
        }
    }

    Ok(Notification {
        id: Uuid::new_v4().to_string(),
        external_id: req.external_id,
        notification_type: req
            .notification_type
            .unwrap_or_else(|| "notification".to_string()),
        priority: req.priority.unwrap_or_default(),
        title,
        message,
        html_message: req.html_message,
        template_name: req.template_name,
        variables: req.variables,
        recipients,
        channels,
        created_at: now,
        scheduled_at: req.scheduled_at,
        expires_at: req.expires_at,
        max_retries: req.max_retries.unwrap_or(state.default_max_retries),
        source_service: req.source_service,
        source_tool: req.source_tool,
        user_id: req.user_id,
        created_by: Some(identity.subject.clone()),
        status: NotificationStatus::Queued,
        escalation_level: 0,
        escalated_at: None,
        next_escalation_at: None,
    })
}

/// Create a notification and route it onto a queue
#[utoipa::path(
    post,
    path = "/api/notifications",
    tag = "notifications",
    request_body = CreateNotificationRequest,
    responses(
        (status = 201, description = "Notification created and queued", body = CreateNotificationResponse),
        (status = 400, description = "Validation error"),
        (status = 401, description = "Missing identity headers")
    )
)]
pub async fn create_notification(
    State(state): State<AppState>,
    identity: Identity,
    Json(req): Json<CreateNotificationRequest>,
) -> Result<(StatusCode, Json<CreateNotificationResponse>)> {
    let notification = build_notification(&state, &identity, req).await?;

    state.store.notifications().insert(&notification).await?;
    state
        .audit
        .record(AuditEvent::new(
            &notification.id,
            AuditEventKind::Created,
            Some(format!("by {}", identity.subject)),
            state.clock.now(),
        ))
        .await;

    let queue = dispatch_notification(state.queue.as_ref(), &notification, state.clock.now()).await?;
    state
        .audit
        .record(AuditEvent::new(
            &notification.id,
            AuditEventKind::Queued,
            Some(queue.as_str().to_string()),
            state.clock.now(),
        ))
        .await;

    info!(notification_id = %notification.id, queue = %queue, "Notification accepted");
    Ok((
        StatusCode::CREATED,
        Json(CreateNotificationResponse {
            id: notification.id,
            status: notification.status,
            queue: queue.as_str().to_string(),
        }),
    ))
}

/// Send a notification for immediate processing, bypassing scheduling and
/// priority-based queue routing
#[utoipa::path(
    post,
    path = "/api/notifications/send",
    tag = "notifications",
    request_body = CreateNotificationRequest,
    responses(
        (status = 201, description = "Notification queued for immediate processing", body = CreateNotificationResponse),
        (status = 400, description = "Validation error"),
        (status = 401, description = "Missing identity headers")
    )
)]
pub async fn send_notification(
    State(state): State<AppState>,
    identity: Identity,
    Json(mut req): Json<CreateNotificationRequest>,
) -> Result<(StatusCode, Json<CreateNotificationResponse>)> {
    req.scheduled_at = None;
    let notification = build_notification(&state, &identity, req).await?;

    state.store.notifications().insert(&notification).await?;
    state
        .audit
        .record(AuditEvent::new(
            &notification.id,
            AuditEventKind::Created,
            Some(format!("by {}", identity.subject)),
            state.clock.now(),
        ))
        .await;

    state
        .queue
        .enqueue(
            QueueName::Immediate,
            JobPayload::Process {
                notification_id: notification.id.clone(),
            },
            EnqueueOptions {
                run_at: None,
                dedupe_key: Some(format!("process:{}", notification.id)),
            },
        )
        .await?;
    state
        .audit
        .record(AuditEvent::new(
            &notification.id,
            AuditEventKind::Queued,
            Some(QueueName::Immediate.as_str().to_string()),
            state.clock.now(),
        ))
        .await;

    Ok((
        StatusCode::CREATED,
        Json(CreateNotificationResponse {
            id: notification.id,
            status: notification.status,
            queue: QueueName::Immediate.as_str().to_string(),
        }),
    ))
}

/// List notifications with filters
#[utoipa::path(
    get,
    path = "/api/notifications",
    tag = "notifications",
    params(NotificationsQuery),
    responses(
        (status = 200, description = "Paginated notifications", body = NotificationListResponse),
        (status = 401, description = "Missing identity headers")
    )
)]
pub async fn list_notifications(
    State(state): State<AppState>,
    _identity: Identity,
    Query(query): Query<NotificationsQuery>,
) -> Result<Json<NotificationListResponse>> {
    let limit = query.limit.unwrap_or(20).clamp(1, MAX_PAGE_SIZE);
    let offset = query.offset.unwrap_or(0);

    let filter = NotificationFilter {
        status: query.status,
        notification_type: query.notification_type,
        priority: query.priority,
        source_service: query.source_service,
        source_tool: query.source_tool,
        user_id: query.user_id,
    };

    let (data, total) = state.store.notifications().list(&filter, limit, offset).await?;
    Ok(Json(NotificationListResponse {
        data,
        total,
        limit,
        offset,
    }))
}

/// Get a notification with its deliveries
#[utoipa::path(
    get,
    path = "/api/notifications/{id}",
    tag = "notifications",
    params(("id" = String, Path, description = "Notification ID")),
    responses(
        (status = 200, description = "Notification found", body = NotificationDetailResponse),
        (status = 404, description = "Notification not found"),
        (status = 401, description = "Missing identity headers")
    )
)]
pub async fn get_notification(
    State(state): State<AppState>,
    _identity: Identity,
    Path(id): Path<String>,
) -> Result<Json<NotificationDetailResponse>> {
    let notification = state
        .store
        .notifications()
        .get(&id)
        .await?
        .ok_or_else(|| ApiError::not_found("Notification", &id))?;
    let deliveries = state.store.deliveries().list_for_notification(&id).await?;

    Ok(Json(NotificationDetailResponse {
        notification,
        deliveries,
    }))
}

/// Delivery list and summary counts for a notification
#[utoipa::path(
    get,
    path = "/api/notifications/delivery/{id}",
    tag = "notifications",
    params(("id" = String, Path, description = "Notification ID")),
    responses(
        (status = 200, description = "Delivery summary", body = DeliverySummaryResponse),
        (status = 404, description = "Notification not found"),
        (status = 401, description = "Missing identity headers")
    )
)]
pub async fn delivery_summary(
    State(state): State<AppState>,
    _identity: Identity,
    Path(id): Path<String>,
) -> Result<Json<DeliverySummaryResponse>> {
    // 404 for an unknown notification rather than an empty summary
    state
        .store
        .notifications()
        .get(&id)
        .await?
        .ok_or_else(|| ApiError::not_found("Notification", &id))?;

    let summary = state.store.deliveries().summary(&id).await?;
    let deliveries = state.store.deliveries().list_for_notification(&id).await?;

    Ok(Json(DeliverySummaryResponse {
        notification_id: id,
        summary,
        deliveries,
    }))
}
