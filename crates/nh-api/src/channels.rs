//! Channels API
//!
//! CRUD over configured delivery channels plus a connectivity probe.
//! Settings are the typed per-kind structs; secrets come in as references
//! to environment variables, never as raw values.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use utoipa::ToSchema;
use uuid::Uuid;

use nh_common::{AdapterHealth, Channel, ChannelSettings};
use nh_pipeline::build_adapter;

use crate::error::{ApiError, Result};
use crate::identity::Identity;
use crate::AppState;

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateChannelRequest {
    pub name: String,
    pub settings: ChannelSettings,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UpdateChannelRequest {
    pub name: Option<String>,
    pub settings: Option<ChannelSettings>,
    pub enabled: Option<bool>,
}

/// Create a channel
#[utoipa::path(
    post,
    path = "/api/channels",
    tag = "channels",
    request_body = CreateChannelRequest,
    responses(
        (status = 201, description = "Channel created", body = Channel),
        (status = 400, description = "Validation error"),
        (status = 401, description = "Missing identity headers")
    )
)]
pub async fn create_channel(
    State(state): State<AppState>,
    _identity: Identity,
    Json(req): Json<CreateChannelRequest>,
) -> Result<(StatusCode, Json<Channel>)> {
    if req.name.trim().is_empty() {
        return Err(ApiError::validation("Channel name is required"));
    }

    let channel = Channel {
        id: Uuid::new_v4().to_string(),
        name: req.name.trim().to_string(),
        settings: req.settings,
        enabled: req.enabled,
        created_at: state.clock.now(),
    };
    state.store.channels().insert(&channel).await?;

    Ok((StatusCode::CREATED, Json(channel)))
}

/// List channels
#[utoipa::path(
    get,
    path = "/api/channels",
    tag = "channels",
    responses(
        (status = 200, description = "Channels", body = Vec<Channel>),
        (status = 401, description = "Missing identity headers")
    )
)]
pub async fn list_channels(
    State(state): State<AppState>,
    _identity: Identity,
) -> Result<Json<Vec<Channel>>> {
    Ok(Json(state.store.channels().list().await?))
}

/// Get channel by ID
#[utoipa::path(
    get,
    path = "/api/channels/{id}",
    tag = "channels",
    params(("id" = String, Path, description = "Channel ID")),
    responses(
        (status = 200, description = "Channel found", body = Channel),
        (status = 404, description = "Channel not found"),
        (status = 401, description = "Missing identity headers")
    )
)]
pub async fn get_channel(
    State(state): State<AppState>,
    _identity: Identity,
    Path(id): Path<String>,
) -> Result<Json<Channel>> {
    let channel = state
        .store
        .channels()
        .get(&id)
        .await?
        .ok_or_else(|| ApiError::not_found("Channel", &id))?;
    Ok(Json(channel))
}

/// Update a channel
#[utoipa::path(
    put,
    path = "/api/channels/{id}",
    tag = "channels",
    params(("id" = String, Path, description = "Channel ID")),
    request_body = UpdateChannelRequest,
    responses(
        (status = 200, description = "Channel updated", body = Channel),
        (status = 404, description = "Channel not found"),
        (status = 401, description = "Missing identity headers")
    )
)]
pub async fn update_channel(
    State(state): State<AppState>,
    _identity: Identity,
    Path(id): Path<String>,
    Json(req): Json<UpdateChannelRequest>,
) -> Result<Json<Channel>> {
    let mut channel = state
        .store
        .channels()
        .get(&id)
        .await?
        .ok_or_else(|| ApiError::not_found("Channel", &id))?;

    if let Some(name) = req.name {
        if name.trim().is_empty() {
            return Err(ApiError::validation("Channel name is required"));
        }
        channel.name = name.trim().to_string();
    }
    if let Some(settings) = req.settings {
        channel.settings = settings;
    }
    if let Some(enabled) = req.enabled {
        channel.enabled = enabled;
    }

    state.store.channels().update(&channel).await?;
    Ok(Json(channel))
}

/// Delete a channel
#[utoipa::path(
    delete,
    path = "/api/channels/{id}",
    tag = "channels",
    params(("id" = String, Path, description = "Channel ID")),
    responses(
        (status = 204, description = "Channel deleted"),
        (status = 404, description = "Channel not found"),
        (status = 401, description = "Missing identity headers")
    )
)]
pub async fn delete_channel(
    State(state): State<AppState>,
    _identity: Identity,
    Path(id): Path<String>,
) -> Result<StatusCode> {
    state
        .store
        .channels()
        .get(&id)
        .await?
        .ok_or_else(|| ApiError::not_found("Channel", &id))?;

    state.store.channels().delete(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Probe a channel's connectivity. Builds an adapter from the stored
/// settings and asks the provider, without sending anything.
#[utoipa::path(
    post,
    path = "/api/channels/{id}/test",
    tag = "channels",
    params(("id" = String, Path, description = "Channel ID")),
    responses(
        (status = 200, description = "Probe result", body = AdapterHealth),
        (status = 404, description = "Channel not found"),
        (status = 401, description = "Missing identity headers")
    )
)]
pub async fn test_channel(
    State(state): State<AppState>,
    _identity: Identity,
    Path(id): Path<String>,
) -> Result<Json<AdapterHealth>> {
    let channel = state
        .store
        .channels()
        .get(&id)
        .await?
        .ok_or_else(|| ApiError::not_found("Channel", &id))?;

    let adapter = build_adapter(&channel.settings, state.http_client.clone());
    Ok(Json(adapter.probe().await))
}
