//! Templates API
//!
//! CRUD plus a dry-run render endpoint. Every write invalidates the
//! pipeline's template cache so a changed template takes effect without
//! waiting out the TTL.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use nh_common::{ChannelKind, Rendered, Template};
use nh_pipeline::template::render_template;

use crate::error::{ApiError, Result};
use crate::identity::Identity;
use crate::AppState;

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateTemplateRequest {
    pub name: String,
    pub category: Option<String>,
    pub subject_template: String,
    pub body_template: String,
    pub html_template: Option<String>,
    #[serde(default)]
    pub variables: Vec<String>,
    #[serde(default)]
    pub channels: Vec<ChannelKind>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UpdateTemplateRequest {
    pub category: Option<String>,
    pub subject_template: Option<String>,
    pub body_template: Option<String>,
    pub html_template: Option<String>,
    pub variables: Option<Vec<String>>,
    pub channels: Option<Vec<ChannelKind>>,
    pub enabled: Option<bool>,
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TestRenderRequest {
    #[serde(default)]
    pub variables: HashMap<String, serde_json::Value>,
    /// Restrict the dry run to one channel; defaults to any
    pub channel: Option<ChannelKind>,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TestRenderResponse {
    pub subject: String,
    pub body: String,
    pub html: Option<String>,
}

impl From<Rendered> for TestRenderResponse {
    fn from(r: Rendered) -> Self {
        Self {
            subject: r.subject,
            body: r.body,
            html: r.html,
        }
    }
}

#[derive(Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct TemplatesQuery {
    /// Filter by category
    pub category: Option<String>,
}

fn validate_name(name: &str) -> Result<()> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(ApiError::validation("Template name is required"));
    }
    if !trimmed
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        return Err(ApiError::validation(
            "Template name may only contain alphanumerics, '-', '_' and '.'",
        ));
    }
    Ok(())
}

/// Create a template
#[utoipa::path(
    post,
    path = "/api/templates",
    tag = "templates",
    request_body = CreateTemplateRequest,
    responses(
        (status = 201, description = "Template created", body = Template),
        (status = 400, description = "Validation error"),
        (status = 409, description = "Duplicate name"),
        (status = 401, description = "Missing identity headers")
    )
)]
pub async fn create_template(
    State(state): State<AppState>,
    _identity: Identity,
    Json(req): Json<CreateTemplateRequest>,
) -> Result<(StatusCode, Json<Template>)> {
    validate_name(&req.name)?;
    if req.channels.is_empty() {
        return Err(ApiError::validation(
            "A template must support at least one channel",
        ));
    }
    if state.store.templates().get_by_name(&req.name).await?.is_some() {
        return Err(ApiError::duplicate("Template", "name", &req.name));
    }

    let template = Template {
        id: Uuid::new_v4().to_string(),
        name: req.name.trim().to_string(),
        category: req.category.unwrap_or_else(|| "general".to_string()),
        subject_template: req.subject_template,
        body_template: req.body_template,
        html_template: req.html_template,
        variables: req.variables,
        channels: req.channels,
        enabled: req.enabled,
        created_at: state.clock.now(),
        updated_at: None,
    };
    state.store.templates().insert(&template).await?;
    state.templates.clear_cache();

    Ok((StatusCode::CREATED, Json(template)))
}

/// List templates
#[utoipa::path(
    get,
    path = "/api/templates",
    tag = "templates",
    params(TemplatesQuery),
    responses(
        (status = 200, description = "Templates", body = Vec<Template>),
        (status = 401, description = "Missing identity headers")
    )
)]
pub async fn list_templates(
    State(state): State<AppState>,
    _identity: Identity,
    Query(query): Query<TemplatesQuery>,
) -> Result<Json<Vec<Template>>> {
    let templates = state
        .store
        .templates()
        .list(query.category.as_deref())
        .await?;
    Ok(Json(templates))
}

/// Get template by ID
#[utoipa::path(
    get,
    path = "/api/templates/{id}",
    tag = "templates",
    params(("id" = String, Path, description = "Template ID")),
    responses(
        (status = 200, description = "Template found", body = Template),
        (status = 404, description = "Template not found"),
        (status = 401, description = "Missing identity headers")
    )
)]
pub async fn get_template(
    State(state): State<AppState>,
    _identity: Identity,
    Path(id): Path<String>,
) -> Result<Json<Template>> {
    let template = state
        .store
        .templates()
        .get(&id)
        .await?
        .ok_or_else(|| ApiError::not_found("Template", &id))?;
    Ok(Json(template))
}

/// Update a template
#[utoipa::path(
    put,
    path = "/api/templates/{id}",
    tag = "templates",
    params(("id" = String, Path, description = "Template ID")),
    request_body = UpdateTemplateRequest,
    responses(
        (status = 200, description = "Template updated", body = Template),
        (status = 404, description = "Template not found"),
        (status = 401, description = "Missing identity headers")
    )
)]
pub async fn update_template(
    State(state): State<AppState>,
    _identity: Identity,
    Path(id): Path<String>,
    Json(req): Json<UpdateTemplateRequest>,
) -> Result<Json<Template>> {
    let mut template = state
        .store
        .templates()
        .get(&id)
        .await?
        .ok_or_else(|| ApiError::not_found("Template", &id))?;

    if let Some(category) = req.category {
        template.category = category;
    }
    if let Some(subject) = req.subject_template {
        template.subject_template = subject;
    }
    if let Some(body) = req.body_template {
        template.body_template = body;
    }
    if req.html_template.is_some() {
        template.html_template = req.html_template;
    }
    if let Some(variables) = req.variables {
        template.variables = variables;
    }
    if let Some(channels) = req.channels {
        if channels.is_empty() {
            return Err(ApiError::validation(
                "A template must support at least one channel",
            ));
        }
        template.channels = channels;
    }
    if let Some(enabled) = req.enabled {
        template.enabled = enabled;
    }
    template.updated_at = Some(state.clock.now());

    state.store.templates().update(&template).await?;
    state.templates.clear_cache();

    Ok(Json(template))
}

/// Delete a template
#[utoipa::path(
    delete,
    path = "/api/templates/{id}",
    tag = "templates",
    params(("id" = String, Path, description = "Template ID")),
    responses(
        (status = 204, description = "Template deleted"),
        (status = 404, description = "Template not found"),
        (status = 401, description = "Missing identity headers")
    )
)]
pub async fn delete_template(
    State(state): State<AppState>,
    _identity: Identity,
    Path(id): Path<String>,
) -> Result<StatusCode> {
    state
        .store
        .templates()
        .get(&id)
        .await?
        .ok_or_else(|| ApiError::not_found("Template", &id))?;

    state.store.templates().delete(&id).await?;
    state.templates.clear_cache();

    Ok(StatusCode::NO_CONTENT)
}

/// Dry-run render a template. Nothing is sent or persisted; rendering
/// failures come back as 400s exactly as they would on create.
#[utoipa::path(
    post,
    path = "/api/templates/{id}/test",
    tag = "templates",
    params(("id" = String, Path, description = "Template ID")),
    request_body = TestRenderRequest,
    responses(
        (status = 200, description = "Rendered output", body = TestRenderResponse),
        (status = 400, description = "Missing variable or unsupported channel"),
        (status = 404, description = "Template not found"),
        (status = 401, description = "Missing identity headers")
    )
)]
pub async fn test_template(
    State(state): State<AppState>,
    _identity: Identity,
    Path(id): Path<String>,
    Json(req): Json<TestRenderRequest>,
) -> Result<Json<TestRenderResponse>> {
    let template = state
        .store
        .templates()
        .get(&id)
        .await?
        .ok_or_else(|| ApiError::not_found("Template", &id))?;

    if let Some(channel) = req.channel {
        if !template.channels.contains(&channel) {
            return Err(ApiError::validation(format!(
                "Template '{}' does not support channel '{channel}'",
                template.name
            )));
        }
    }

    let rendered = render_template(&template, &req.variables).map_err(ApiError::from)?;
    Ok(Json(rendered.into()))
}
