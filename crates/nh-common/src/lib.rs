use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use utoipa::ToSchema;

pub mod clock;
pub mod logging;

pub use clock::{Clock, ManualClock, SystemClock};

/// Hard ceiling on per-notification retry budgets. Caller-supplied values
/// above this are clamped, never rejected.
pub const MAX_RETRY_CEILING: u32 = 10;

// ============================================================================
// Core Domain Types
// ============================================================================

/// Notification priority as supplied by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum NotificationPriority {
    Low,
    Medium,
    High,
    Critical,
}

impl NotificationPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationPriority::Low => "low",
            NotificationPriority::Medium => "medium",
            NotificationPriority::High => "high",
            NotificationPriority::Critical => "critical",
        }
    }

    pub fn parse_str(s: &str) -> Option<Self> {
        match s {
            "low" => Some(NotificationPriority::Low),
            "medium" => Some(NotificationPriority::Medium),
            "high" => Some(NotificationPriority::High),
            "critical" => Some(NotificationPriority::Critical),
            _ => None,
        }
    }
}

impl Default for NotificationPriority {
    fn default() -> Self {
        NotificationPriority::Medium
    }
}

/// Aggregate lifecycle status of a notification.
///
/// The status is always derived from the deliveries: `Delivered` only if every
/// delivery reached a terminal success state, `Failed` only if every delivery
/// exhausted retries or failed permanently, `PartiallyDelivered` when the
/// channels disagree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum NotificationStatus {
    Queued,
    Processing,
    Sent,
    PartiallyDelivered,
    Delivered,
    Failed,
    Expired,
}

impl NotificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationStatus::Queued => "queued",
            NotificationStatus::Processing => "processing",
            NotificationStatus::Sent => "sent",
            NotificationStatus::PartiallyDelivered => "partially_delivered",
            NotificationStatus::Delivered => "delivered",
            NotificationStatus::Failed => "failed",
            NotificationStatus::Expired => "expired",
        }
    }

    pub fn parse_str(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(NotificationStatus::Queued),
            "processing" => Some(NotificationStatus::Processing),
            "sent" => Some(NotificationStatus::Sent),
            "partially_delivered" => Some(NotificationStatus::PartiallyDelivered),
            "delivered" => Some(NotificationStatus::Delivered),
            "failed" => Some(NotificationStatus::Failed),
            "expired" => Some(NotificationStatus::Expired),
            _ => None,
        }
    }

    /// Terminal statuses are never transitioned out of.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NotificationStatus::Sent
                | NotificationStatus::PartiallyDelivered
                | NotificationStatus::Delivered
                | NotificationStatus::Failed
                | NotificationStatus::Expired
        )
    }
}

/// Status of a single delivery attempt record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Sent,
    Delivered,
    Failed,
    Retrying,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Failed => "failed",
            DeliveryStatus::Retrying => "retrying",
        }
    }

    pub fn parse_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(DeliveryStatus::Pending),
            "sent" => Some(DeliveryStatus::Sent),
            "delivered" => Some(DeliveryStatus::Delivered),
            "failed" => Some(DeliveryStatus::Failed),
            "retrying" => Some(DeliveryStatus::Retrying),
            _ => None,
        }
    }

    /// A delivery in terminal state is never mutated again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DeliveryStatus::Sent | DeliveryStatus::Delivered | DeliveryStatus::Failed
        )
    }

    pub fn is_success(&self) -> bool {
        matches!(self, DeliveryStatus::Sent | DeliveryStatus::Delivered)
    }
}

/// Supported delivery mechanisms. Adding a channel kind is a compile-time
/// extension point: every `match` over this enum is exhaustive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Email,
    Slack,
    Webhook,
    Sms,
    Teams,
}

impl ChannelKind {
    pub const ALL: [ChannelKind; 5] = [
        ChannelKind::Email,
        ChannelKind::Slack,
        ChannelKind::Webhook,
        ChannelKind::Sms,
        ChannelKind::Teams,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelKind::Email => "email",
            ChannelKind::Slack => "slack",
            ChannelKind::Webhook => "webhook",
            ChannelKind::Sms => "sms",
            ChannelKind::Teams => "teams",
        }
    }

    pub fn parse_str(s: &str) -> Option<Self> {
        match s {
            "email" => Some(ChannelKind::Email),
            "slack" => Some(ChannelKind::Slack),
            "webhook" => Some(ChannelKind::Webhook),
            "sms" => Some(ChannelKind::Sms),
            "teams" => Some(ChannelKind::Teams),
            _ => None,
        }
    }
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of intent to inform one or more recipients, independent of channel.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: String,
    /// Caller-supplied id for idempotent dedupe by the caller.
    pub external_id: Option<String>,
    pub notification_type: String,
    pub priority: NotificationPriority,
    pub title: String,
    pub message: String,
    pub html_message: Option<String>,
    /// Template reference, mutually consistent with direct content.
    pub template_name: Option<String>,
    #[serde(default)]
    pub variables: HashMap<String, serde_json::Value>,
    /// Opaque recipient identifiers: emails, user ids, channel names.
    pub recipients: Vec<String>,
    pub channels: Vec<ChannelKind>,
    pub created_at: DateTime<Utc>,
    /// Delivery is not attempted before this time.
    pub scheduled_at: Option<DateTime<Utc>>,
    /// Delivery is never attempted after this time; the notification is
    /// abandoned as `expired`, not `failed`.
    pub expires_at: Option<DateTime<Utc>>,
    pub max_retries: u32,
    pub source_service: Option<String>,
    pub source_tool: Option<String>,
    pub user_id: Option<String>,
    pub created_by: Option<String>,
    pub status: NotificationStatus,
    pub escalation_level: u32,
    pub escalated_at: Option<DateTime<Utc>>,
    pub next_escalation_at: Option<DateTime<Utc>>,
}

impl Notification {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|e| now > e).unwrap_or(false)
    }

    /// Upper bound on attempts for each of this notification's deliveries.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.min(MAX_RETRY_CEILING) + 1
    }
}

/// One attempt record per (notification x recipient x channel).
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Delivery {
    pub id: String,
    pub notification_id: String,
    pub channel: ChannelKind,
    pub recipient: String,
    pub status: DeliveryStatus,
    pub attempt_count: u32,
    pub last_error: Option<String>,
    pub provider_status: Option<u16>,
    pub latency_ms: Option<u64>,
    pub first_attempted_at: Option<DateTime<Utc>>,
    pub last_attempted_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// A named, versioned content-rendering recipe with declared variables.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Template {
    pub id: String,
    pub name: String,
    pub category: String,
    pub subject_template: String,
    pub body_template: String,
    pub html_template: Option<String>,
    /// Declared variable names; rendering with any of these absent fails
    /// deterministically, never silently substitutes a blank.
    pub variables: Vec<String>,
    pub channels: Vec<ChannelKind>,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Typed per-kind channel configuration.
///
/// Channel settings are explicit structs validated at load time, not untyped
/// maps threaded through at runtime.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ChannelSettings {
    Email(EmailSettings),
    Slack(SlackSettings),
    Webhook(WebhookSettings),
    Sms(SmsSettings),
    Teams(TeamsSettings),
}

impl ChannelSettings {
    pub fn kind(&self) -> ChannelKind {
        match self {
            ChannelSettings::Email(_) => ChannelKind::Email,
            ChannelSettings::Slack(_) => ChannelKind::Slack,
            ChannelSettings::Webhook(_) => ChannelKind::Webhook,
            ChannelSettings::Sms(_) => ChannelKind::Sms,
            ChannelSettings::Teams(_) => ChannelKind::Teams,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct EmailSettings {
    pub smtp_host: String,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    pub username: Option<String>,
    /// Reference into the secret store, never the secret itself.
    pub password_ref: Option<String>,
    pub from_address: String,
    #[serde(default)]
    pub use_tls: bool,
}

fn default_smtp_port() -> u16 {
    587
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SlackSettings {
    pub webhook_url: String,
    pub default_channel: Option<String>,
    pub username: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct WebhookSettings {
    pub url: String,
    /// Shared secret for HMAC-SHA256 body signing; optional for unsigned
    /// internal endpoints.
    pub signing_secret: Option<String>,
    #[serde(default = "default_webhook_timeout")]
    pub timeout_seconds: u64,
}

fn default_webhook_timeout() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SmsSettings {
    pub api_url: String,
    pub api_key_ref: Option<String>,
    pub from_number: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TeamsSettings {
    pub webhook_url: String,
}

/// A configured delivery mechanism instance. Read-mostly from the pipeline's
/// perspective; only the admin surface mutates these rows.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Channel {
    pub id: String,
    pub name: String,
    pub settings: ChannelSettings,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

impl Channel {
    pub fn kind(&self) -> ChannelKind {
        self.settings.kind()
    }
}

// ============================================================================
// Delivery Outcomes
// ============================================================================

/// Classification of a single adapter send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutcomeStatus {
    /// Accepted by the provider; delivery confirmation pending.
    Sent,
    /// Confirmed delivered by the provider.
    Delivered,
    /// Transient failure (timeout, 5xx, network) - re-enters the retry queue.
    RetryableFailure,
    /// Permanent failure (bad recipient, auth rejection, malformed payload) -
    /// terminal, skips the retry queue.
    PermanentFailure,
}

/// Outcome of one adapter send, including provider details.
#[derive(Debug, Clone)]
pub struct DeliveryOutcome {
    pub status: OutcomeStatus,
    pub provider_status: Option<u16>,
    pub latency_ms: u64,
    pub error: Option<String>,
}

impl DeliveryOutcome {
    pub fn sent(latency_ms: u64) -> Self {
        Self {
            status: OutcomeStatus::Sent,
            provider_status: None,
            latency_ms,
            error: None,
        }
    }

    pub fn delivered(provider_status: Option<u16>, latency_ms: u64) -> Self {
        Self {
            status: OutcomeStatus::Delivered,
            provider_status,
            latency_ms,
            error: None,
        }
    }

    pub fn retryable(
        provider_status: Option<u16>,
        latency_ms: u64,
        error: impl Into<String>,
    ) -> Self {
        Self {
            status: OutcomeStatus::RetryableFailure,
            provider_status,
            latency_ms,
            error: Some(error.into()),
        }
    }

    pub fn permanent(
        provider_status: Option<u16>,
        latency_ms: u64,
        error: impl Into<String>,
    ) -> Self {
        Self {
            status: OutcomeStatus::PermanentFailure,
            provider_status,
            latency_ms,
            error: Some(error.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.status, OutcomeStatus::Sent | OutcomeStatus::Delivered)
    }
}

/// Result of an adapter connectivity probe.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AdapterHealth {
    pub channel: ChannelKind,
    pub healthy: bool,
    pub detail: Option<String>,
    pub latency_ms: Option<u64>,
}

/// Channel-ready content produced by the template engine (or taken directly
/// from the notification body).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Rendered {
    pub subject: String,
    pub body: String,
    pub html: Option<String>,
}

// ============================================================================
// Audit Events
// ============================================================================

/// Lifecycle transitions emitted to the audit sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventKind {
    Created,
    Queued,
    Claimed,
    DeliveryAttempted,
    DeliveryFailed,
    Retried,
    Escalated,
    EscalationExhausted,
    Expired,
    Completed,
}

impl AuditEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEventKind::Created => "created",
            AuditEventKind::Queued => "queued",
            AuditEventKind::Claimed => "claimed",
            AuditEventKind::DeliveryAttempted => "delivery_attempted",
            AuditEventKind::DeliveryFailed => "delivery_failed",
            AuditEventKind::Retried => "retried",
            AuditEventKind::Escalated => "escalated",
            AuditEventKind::EscalationExhausted => "escalation_exhausted",
            AuditEventKind::Expired => "expired",
            AuditEventKind::Completed => "completed",
        }
    }
}

/// One structured audit record. Fire-and-forget from the pipeline's
/// perspective.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    pub id: String,
    pub notification_id: String,
    pub event: AuditEventKind,
    pub detail: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(
        notification_id: impl Into<String>,
        event: AuditEventKind,
        detail: Option<String>,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            notification_id: notification_id.into(),
            event,
            detail,
            occurred_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            NotificationStatus::Queued,
            NotificationStatus::Processing,
            NotificationStatus::Sent,
            NotificationStatus::PartiallyDelivered,
            NotificationStatus::Delivered,
            NotificationStatus::Failed,
            NotificationStatus::Expired,
        ] {
            assert_eq!(NotificationStatus::parse_str(status.as_str()), Some(status));
        }
    }

    #[test]
    fn terminal_statuses() {
        assert!(!NotificationStatus::Queued.is_terminal());
        assert!(!NotificationStatus::Processing.is_terminal());
        assert!(NotificationStatus::Delivered.is_terminal());
        assert!(NotificationStatus::Expired.is_terminal());
        assert!(DeliveryStatus::Failed.is_terminal());
        assert!(!DeliveryStatus::Retrying.is_terminal());
    }

    #[test]
    fn max_attempts_clamps_retry_budget() {
        let mut n = sample_notification();
        n.max_retries = 2;
        assert_eq!(n.max_attempts(), 3);
        n.max_retries = 99;
        assert_eq!(n.max_attempts(), MAX_RETRY_CEILING + 1);
    }

    #[test]
    fn channel_settings_tagged_by_kind() {
        let settings = ChannelSettings::Webhook(WebhookSettings {
            url: "https://hooks.example.com/notify".to_string(),
            signing_secret: Some("s3cret".to_string()),
            timeout_seconds: 30,
        });
        let json = serde_json::to_value(&settings).unwrap();
        assert_eq!(json["kind"], "webhook");
        let back: ChannelSettings = serde_json::from_value(json).unwrap();
        assert_eq!(back.kind(), ChannelKind::Webhook);
    }

    fn sample_notification() -> Notification {
        Notification {
            id: "n-1".to_string(),
            external_id: None,
            notification_type: "test".to_string(),
            priority: NotificationPriority::Medium,
            title: "t".to_string(),
            message: "m".to_string(),
            html_message: None,
            template_name: None,
            variables: HashMap::new(),
            recipients: vec!["a@example.com".to_string()],
            channels: vec![ChannelKind::Email],
            created_at: Utc::now(),
            scheduled_at: None,
            expires_at: None,
            max_retries: 3,
            source_service: None,
            source_tool: None,
            user_id: None,
            created_by: None,
            status: NotificationStatus::Queued,
            escalation_level: 0,
            escalated_at: None,
            next_escalation_at: None,
        }
    }
}
