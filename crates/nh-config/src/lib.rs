//! NotifyHub Configuration System
//!
//! This crate provides TOML-based configuration with environment variable override support.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

mod loader;

pub use loader::ConfigLoader;

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),

    #[error("Environment variable error: {0}")]
    EnvError(String),
}

/// Root application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub http: HttpConfig,
    pub database: DatabaseConfig,
    pub queue: QueueSettings,
    pub retry: RetryConfig,
    pub escalation: EscalationConfig,
    pub processor: ProcessorConfig,
    pub channels: ChannelsConfig,

    /// Data directory for local storage
    pub data_dir: String,

    /// Enable development mode
    pub dev_mode: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            http: HttpConfig::default(),
            database: DatabaseConfig::default(),
            queue: QueueSettings::default(),
            retry: RetryConfig::default(),
            escalation: EscalationConfig::default(),
            processor: ProcessorConfig::default(),
            channels: ChannelsConfig::default(),
            data_dir: "./data".to_string(),
            dev_mode: false,
        }
    }
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub port: u16,
    pub host: String,
    pub cors_origins: Vec<String>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            host: "0.0.0.0".to_string(),
            cors_origins: vec!["http://localhost:4200".to_string()],
        }
    }
}

/// SQLite database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite connection URL for the notification store
    pub url: String,
    /// Maximum pool connections
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://./data/notifyhub.db".to_string(),
            max_connections: 10,
        }
    }
}

/// Durable queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    /// SQLite connection URL for queue storage (empty = share database.url)
    pub url: String,
    /// Worker poll interval in milliseconds when queues are idle
    pub poll_interval_ms: u64,
    /// Visibility timeout in seconds for claimed jobs
    pub visibility_timeout_secs: u64,
    /// Interval in milliseconds for promoting due delayed jobs
    pub promote_interval_ms: u64,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            url: String::new(),
            poll_interval_ms: 250,
            visibility_timeout_secs: 120,
            promote_interval_ms: 1000,
        }
    }
}

/// Delivery retry policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Default max retries when a notification does not specify one
    pub default_max_retries: u32,
    /// Base backoff delay in seconds (doubled per attempt)
    pub base_delay_secs: u64,
    /// Backoff ceiling in seconds
    pub max_delay_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            default_max_retries: 3,
            base_delay_secs: 30,
            max_delay_secs: 3600,
        }
    }
}

/// Escalation policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EscalationConfig {
    pub enabled: bool,
    /// Delay before escalating an unresolved notification, in seconds
    pub delay_secs: u64,
    /// Maximum escalation levels before giving up
    pub max_levels: u32,
    /// Additional recipients added at each level (index 0 = level 1)
    pub level_recipients: Vec<Vec<String>>,
    /// Sweep interval in milliseconds
    pub sweep_interval_ms: u64,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            delay_secs: 300,
            max_levels: 3,
            level_recipients: Vec::new(),
            sweep_interval_ms: 5000,
        }
    }
}

/// Notification processor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    /// Number of concurrent workers
    pub concurrency: usize,
    /// Per-delivery send timeout in milliseconds
    pub send_timeout_ms: u64,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            send_timeout_ms: 30000,
        }
    }
}

/// Per-channel adapter configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelsConfig {
    pub email: EmailChannelConfig,
    pub slack: SlackChannelConfig,
    pub webhook: WebhookChannelConfig,
    pub sms: SmsChannelConfig,
    pub teams: TeamsChannelConfig,
}

/// SMTP email channel
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmailChannelConfig {
    pub enabled: bool,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub username: String,
    /// Name of the environment variable holding the SMTP password
    pub password_ref: String,
    pub from_address: String,
    pub use_tls: bool,
}

impl Default for EmailChannelConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            smtp_host: String::new(),
            smtp_port: 587,
            username: String::new(),
            password_ref: String::new(),
            from_address: "notifyhub@localhost".to_string(),
            use_tls: true,
        }
    }
}

/// Slack incoming-webhook channel
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SlackChannelConfig {
    pub enabled: bool,
    pub webhook_url: String,
    pub default_channel: String,
}

/// Generic signed webhook channel
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookChannelConfig {
    pub enabled: bool,
    /// Name of the environment variable holding the HMAC signing secret
    pub signing_secret_ref: String,
    pub timeout_ms: u64,
}

impl Default for WebhookChannelConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            signing_secret_ref: String::new(),
            timeout_ms: 10000,
        }
    }
}

/// SMS provider channel
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SmsChannelConfig {
    pub enabled: bool,
    pub api_url: String,
    /// Name of the environment variable holding the provider API key
    pub api_key_ref: String,
    pub from_number: String,
}

/// Microsoft Teams incoming-webhook channel
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TeamsChannelConfig {
    pub enabled: bool,
    pub webhook_url: String,
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load configuration with environment variable override
    pub fn load() -> Result<Self, ConfigError> {
        let loader = ConfigLoader::new();
        loader.load()
    }

    /// The queue storage URL, falling back to the store URL when unset
    pub fn queue_url(&self) -> &str {
        if self.queue.url.is_empty() {
            &self.database.url
        } else {
            &self.queue.url
        }
    }

    /// Validate cross-field consistency
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.processor.concurrency == 0 {
            return Err(ConfigError::ValidationError(
                "processor.concurrency must be at least 1".to_string(),
            ));
        }
        if self.retry.base_delay_secs == 0 {
            return Err(ConfigError::ValidationError(
                "retry.base_delay_secs must be at least 1".to_string(),
            ));
        }
        if self.retry.max_delay_secs < self.retry.base_delay_secs {
            return Err(ConfigError::ValidationError(
                "retry.max_delay_secs must be >= retry.base_delay_secs".to_string(),
            ));
        }
        if self.escalation.enabled && self.escalation.max_levels == 0 {
            return Err(ConfigError::ValidationError(
                "escalation.max_levels must be at least 1 when escalation is enabled".to_string(),
            ));
        }
        if self.channels.email.enabled && self.channels.email.smtp_host.is_empty() {
            return Err(ConfigError::ValidationError(
                "channels.email.smtp_host is required when email is enabled".to_string(),
            ));
        }
        if self.channels.slack.enabled && self.channels.slack.webhook_url.is_empty() {
            return Err(ConfigError::ValidationError(
                "channels.slack.webhook_url is required when slack is enabled".to_string(),
            ));
        }
        if self.channels.webhook.enabled && self.channels.webhook.signing_secret_ref.is_empty() {
            return Err(ConfigError::ValidationError(
                "channels.webhook.signing_secret_ref is required when webhook is enabled"
                    .to_string(),
            ));
        }
        if self.channels.sms.enabled && self.channels.sms.api_url.is_empty() {
            return Err(ConfigError::ValidationError(
                "channels.sms.api_url is required when sms is enabled".to_string(),
            ));
        }
        if self.channels.teams.enabled && self.channels.teams.webhook_url.is_empty() {
            return Err(ConfigError::ValidationError(
                "channels.teams.webhook_url is required when teams is enabled".to_string(),
            ));
        }
        Ok(())
    }

    /// Generate an example TOML configuration
    pub fn example_toml() -> String {
        r##"# NotifyHub Configuration
# Environment variables override these settings

[http]
port = 8080
host = "0.0.0.0"
cors_origins = ["http://localhost:4200"]

[database]
url = "sqlite://./data/notifyhub.db"
max_connections = 10

[queue]
url = ""  # empty = share database.url
poll_interval_ms = 250
visibility_timeout_secs = 120
promote_interval_ms = 1000

[retry]
default_max_retries = 3
base_delay_secs = 30
max_delay_secs = 3600

[escalation]
enabled = true
delay_secs = 300
max_levels = 3
level_recipients = [["oncall@example.com"], ["team-lead@example.com"], ["director@example.com"]]
sweep_interval_ms = 5000

[processor]
concurrency = 5
send_timeout_ms = 30000

[channels.email]
enabled = false
smtp_host = ""
smtp_port = 587
username = ""
password_ref = "NOTIFYHUB_SMTP_PASSWORD"
from_address = "notifyhub@localhost"
use_tls = true

[channels.slack]
enabled = false
webhook_url = ""
default_channel = "#alerts"

[channels.webhook]
enabled = false
signing_secret_ref = "NOTIFYHUB_WEBHOOK_SECRET"
timeout_ms = 10000

[channels.sms]
enabled = false
api_url = ""
api_key_ref = "NOTIFYHUB_SMS_API_KEY"
from_number = ""

[channels.teams]
enabled = false
webhook_url = ""

data_dir = "./data"
dev_mode = false
"##
        .to_string()
    }
}
