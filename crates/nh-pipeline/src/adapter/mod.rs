//! Channel Adapters
//!
//! One adapter per delivery mechanism. Adapters translate a rendered
//! notification into a provider call and classify the result as a success,
//! a retryable failure (timeout, 5xx, rate limit), or a permanent failure
//! (bad recipient, auth rejection, malformed payload). The pipeline decides
//! what to do with the classification; adapters never retry on their own.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

use nh_common::{AdapterHealth, ChannelKind, Delivery, DeliveryOutcome, Rendered};

mod email;
mod slack;
mod sms;
mod teams;
mod webhook;

pub use email::EmailAdapter;
pub use slack::SlackAdapter;
pub use sms::SmsAdapter;
pub use teams::TeamsAdapter;
pub use webhook::WebhookAdapter;

/// Webhook signature header
pub const SIGNATURE_HEADER: &str = "X-NOTIFYHUB-SIGNATURE";
/// Webhook timestamp header
pub const TIMESTAMP_HEADER: &str = "X-NOTIFYHUB-TIMESTAMP";

pub const USER_AGENT: &str = concat!("notifyhub/", env!("CARGO_PKG_VERSION"));

type HmacSha256 = Hmac<Sha256>;

/// Generate HMAC-SHA256 signature for a webhook payload.
///
/// - Signature payload = timestamp + body
/// - Returns (hex signature, ISO8601 timestamp with millisecond precision)
pub fn sign_webhook(payload: &str, signing_secret: &str, now: DateTime<Utc>) -> (String, String) {
    let timestamp = now.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string();
    let signature_payload = format!("{timestamp}{payload}");

    let mut mac = HmacSha256::new_from_slice(signing_secret.as_bytes())
        .expect("HMAC accepts keys of any size");
    mac.update(signature_payload.as_bytes());
    let signature = hex::encode(mac.finalize().into_bytes());

    (signature, timestamp)
}

/// A single delivery mechanism.
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    fn kind(&self) -> ChannelKind;

    /// Attempt one send. Never retries internally.
    async fn send(&self, delivery: &Delivery, content: &Rendered) -> DeliveryOutcome;

    /// Lightweight connectivity check for the admin test endpoint and
    /// readiness reporting.
    async fn probe(&self) -> AdapterHealth;
}

/// Classify an HTTP response the way every webhook-style adapter does:
/// 2xx success, 429 retryable honoring Retry-After, other 4xx permanent,
/// 5xx retryable.
pub(crate) fn classify_response(response: reqwest::Response, started: Instant) -> DeliveryOutcome {
    let latency_ms = started.elapsed().as_millis() as u64;
    let status = response.status();
    let code = status.as_u16();

    if status.is_success() {
        return DeliveryOutcome::delivered(Some(code), latency_ms);
    }

    if code == 429 {
        let retry_after = response
            .headers()
            .get("Retry-After")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(30);
        return DeliveryOutcome::retryable(
            Some(code),
            latency_ms,
            format!("HTTP 429: rate limited, retry after {retry_after}s"),
        );
    }

    if status.is_client_error() {
        return DeliveryOutcome::permanent(
            Some(code),
            latency_ms,
            format!("HTTP {code}: client error"),
        );
    }

    DeliveryOutcome::retryable(Some(code), latency_ms, format!("HTTP {code}: server error"))
}

/// Classify a transport-level failure: timeouts and connection errors are
/// retryable, everything else too (the remote may simply be down).
pub(crate) fn classify_transport_error(e: reqwest::Error, started: Instant) -> DeliveryOutcome {
    let latency_ms = started.elapsed().as_millis() as u64;
    if e.is_timeout() {
        DeliveryOutcome::retryable(None, latency_ms, "request timeout")
    } else if e.is_connect() {
        DeliveryOutcome::retryable(None, latency_ms, format!("connection error: {e}"))
    } else {
        DeliveryOutcome::retryable(None, latency_ms, format!("request failed: {e}"))
    }
}

/// Probe an HTTP endpoint: any response proves connectivity, transport
/// failures do not.
pub(crate) async fn probe_url(
    client: &reqwest::Client,
    kind: ChannelKind,
    url: &str,
) -> AdapterHealth {
    let started = Instant::now();
    match client.head(url).send().await {
        Ok(response) => AdapterHealth {
            channel: kind,
            healthy: true,
            detail: Some(format!("HTTP {}", response.status().as_u16())),
            latency_ms: Some(started.elapsed().as_millis() as u64),
        },
        Err(e) => AdapterHealth {
            channel: kind,
            healthy: false,
            detail: Some(e.to_string()),
            latency_ms: Some(started.elapsed().as_millis() as u64),
        },
    }
}

/// The set of configured adapters, built at startup from enabled channels.
/// Dispatch is by `ChannelKind`; a kind with no registered adapter produces
/// a permanent failure, never a silent skip.
pub struct AdapterRegistry {
    adapters: HashMap<ChannelKind, Arc<dyn ChannelAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self {
            adapters: HashMap::new(),
        }
    }

    pub fn register(&mut self, adapter: Arc<dyn ChannelAdapter>) {
        let kind = adapter.kind();
        if self.adapters.insert(kind, adapter).is_some() {
            warn!(channel = %kind, "Replacing previously registered adapter");
        }
    }

    pub fn get(&self, kind: ChannelKind) -> Option<&Arc<dyn ChannelAdapter>> {
        self.adapters.get(&kind)
    }

    pub fn kinds(&self) -> Vec<ChannelKind> {
        let mut kinds: Vec<_> = self.adapters.keys().copied().collect();
        kinds.sort_by_key(|k| k.as_str());
        kinds
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Build the shared HTTP client for outbound sends. Every request through
/// this client is bounded by the per-send timeout, so a hung provider
/// surfaces as a retryable timeout instead of stalling a worker.
pub fn build_http_client(send_timeout: Duration) -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder().timeout(send_timeout).build()
}

/// Build an adapter from a channel row. The match is exhaustive: adding a
/// channel kind forces a decision here.
pub fn build_adapter(
    settings: &nh_common::ChannelSettings,
    client: reqwest::Client,
) -> Arc<dyn ChannelAdapter> {
    match settings {
        nh_common::ChannelSettings::Email(s) => Arc::new(EmailAdapter::new(s.clone())),
        nh_common::ChannelSettings::Slack(s) => Arc::new(SlackAdapter::new(s.clone(), client)),
        nh_common::ChannelSettings::Webhook(s) => Arc::new(WebhookAdapter::new(s.clone(), client)),
        nh_common::ChannelSettings::Sms(s) => Arc::new(SmsAdapter::new(s.clone(), client)),
        nh_common::ChannelSettings::Teams(s) => Arc::new(TeamsAdapter::new(s.clone(), client)),
    }
}
