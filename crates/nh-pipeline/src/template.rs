//! Template Engine
//!
//! Resolves named templates from the store, substitutes `{{variable}}`
//! placeholders, and caches compiled templates with a bounded TTL.
//! Rendering is deterministic: the same template, variables, and channel
//! always produce the same output, and a missing declared variable is a
//! hard error rather than a silent blank.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use nh_common::{ChannelKind, Clock, Rendered, Template};
use nh_store::TemplateRepository;

#[derive(Error, Debug)]
pub enum TemplateError {
    #[error("Unknown template: {0}")]
    UnknownTemplate(String),

    #[error("Missing variable '{variable}' for template '{template}'")]
    MissingVariable { template: String, variable: String },

    #[error("Template '{template}' does not support channel '{channel}'")]
    UnsupportedChannel {
        template: String,
        channel: ChannelKind,
    },

    #[error(transparent)]
    Store(#[from] nh_store::StoreError),
}

impl TemplateError {
    /// Every template error is permanent for the affected delivery.
    pub fn is_permanent(&self) -> bool {
        true
    }
}

struct CachedTemplate {
    template: Template,
    cached_at: DateTime<Utc>,
}

pub struct TemplateEngine {
    templates: TemplateRepository,
    cache: RwLock<HashMap<String, CachedTemplate>>,
    cache_ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl TemplateEngine {
    pub fn new(templates: TemplateRepository, cache_ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            templates,
            cache: RwLock::new(HashMap::new()),
            cache_ttl,
            clock,
        }
    }

    /// Render a named template for one channel.
    pub async fn render(
        &self,
        name: &str,
        variables: &HashMap<String, serde_json::Value>,
        channel: ChannelKind,
    ) -> Result<Rendered, TemplateError> {
        let template = self.resolve(name).await?;

        if !template.channels.contains(&channel) {
            return Err(TemplateError::UnsupportedChannel {
                template: name.to_string(),
                channel,
            });
        }

        render_template(&template, variables)
    }

    /// Drop all cached templates. Called by the template write path so
    /// edits are visible without waiting out the TTL.
    pub fn clear_cache(&self) {
        self.cache.write().clear();
        debug!("Template cache cleared");
    }

    async fn resolve(&self, name: &str) -> Result<Template, TemplateError> {
        let now = self.clock.now();
        {
            let cache = self.cache.read();
            if let Some(entry) = cache.get(name) {
                let age = (now - entry.cached_at).to_std().unwrap_or(Duration::MAX);
                if age < self.cache_ttl {
                    return Ok(entry.template.clone());
                }
            }
        }

        let template = self
            .templates
            .get_enabled_by_name(name)
            .await?
            .ok_or_else(|| TemplateError::UnknownTemplate(name.to_string()))?;

        self.cache.write().insert(
            name.to_string(),
            CachedTemplate {
                template: template.clone(),
                cached_at: now,
            },
        );

        Ok(template)
    }
}

/// Substitute variables into a template without touching the store. Used by
/// the engine and by the dry-run test endpoint (which renders an unsaved
/// template body).
pub fn render_template(
    template: &Template,
    variables: &HashMap<String, serde_json::Value>,
) -> Result<Rendered, TemplateError> {
    // Every declared variable must be supplied
    for declared in &template.variables {
        if !variables.contains_key(declared) {
            return Err(TemplateError::MissingVariable {
                template: template.name.clone(),
                variable: declared.clone(),
            });
        }
    }

    let subject = substitute(&template.subject_template, variables);
    let body = substitute(&template.body_template, variables);
    let html = template
        .html_template
        .as_ref()
        .map(|h| substitute(h, variables));

    Ok(Rendered {
        subject,
        body,
        html,
    })
}

/// Single left-to-right pass over the input: each `{{name}}` placeholder is
/// replaced at most once and substituted values are never rescanned, so a
/// variable value containing `{{...}}` passes through literally. Unknown
/// placeholders are left as-is.
fn substitute(input: &str, variables: &HashMap<String, serde_json::Value>) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            out.push_str(&rest[start..]);
            return out;
        };
        match variables.get(after[..end].trim()) {
            Some(value) => out.push_str(&value_to_string(value)),
            None => out.push_str(&rest[start..start + end + 4]),
        }
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    out
}

fn value_to_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
