//! Configuration loader with file and environment variable support

use crate::{AppConfig, ConfigError};
use std::env;
use std::path::PathBuf;
use tracing::info;

/// Standard config file search paths
const CONFIG_PATHS: &[&str] = &[
    "config.toml",
    "application.toml",
    "notifyhub.toml",
    "./config/config.toml",
    "./config/application.toml",
    "/etc/notifyhub/config.toml",
];

/// Configuration loader
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    /// Create a new configuration loader
    pub fn new() -> Self {
        Self { config_path: None }
    }

    /// Create a loader with a specific config file path
    pub fn with_path<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            config_path: Some(path.into()),
        }
    }

    /// Load configuration from file (if found) with environment variable overrides
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        // Start with defaults
        let mut config = AppConfig::default();

        // Try to load from file
        if let Some(path) = self.find_config_file() {
            info!(?path, "Loading configuration from file");
            config = AppConfig::from_file(&path)?;
        }

        // Apply environment variable overrides
        self.apply_env_overrides(&mut config);

        Ok(config)
    }

    /// Find the configuration file to use
    fn find_config_file(&self) -> Option<PathBuf> {
        // Check explicit path first
        if let Some(path) = &self.config_path {
            if path.exists() {
                return Some(path.clone());
            }
        }

        // Check NOTIFYHUB_CONFIG env var
        if let Ok(path) = env::var("NOTIFYHUB_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        // Search standard paths
        for path in CONFIG_PATHS {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        None
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&self, config: &mut AppConfig) {
        // HTTP
        if let Ok(val) = env::var("NOTIFYHUB_HTTP_PORT") {
            if let Ok(port) = val.parse() {
                config.http.port = port;
            }
        }
        if let Ok(val) = env::var("NOTIFYHUB_HTTP_HOST") {
            config.http.host = val;
        }
        if let Ok(val) = env::var("NOTIFYHUB_CORS_ORIGINS") {
            config.http.cors_origins = val.split(',').map(|s| s.trim().to_string()).collect();
        }

        // Database
        if let Ok(val) = env::var("NOTIFYHUB_DATABASE_URL") {
            config.database.url = val;
        }
        if let Ok(val) = env::var("NOTIFYHUB_DATABASE_MAX_CONNECTIONS") {
            if let Ok(max) = val.parse() {
                config.database.max_connections = max;
            }
        }

        // Queue
        if let Ok(val) = env::var("NOTIFYHUB_QUEUE_URL") {
            config.queue.url = val;
        }
        if let Ok(val) = env::var("NOTIFYHUB_QUEUE_POLL_INTERVAL_MS") {
            if let Ok(interval) = val.parse() {
                config.queue.poll_interval_ms = interval;
            }
        }
        if let Ok(val) = env::var("NOTIFYHUB_QUEUE_VISIBILITY_TIMEOUT_SECS") {
            if let Ok(timeout) = val.parse() {
                config.queue.visibility_timeout_secs = timeout;
            }
        }

        // Retry
        if let Ok(val) = env::var("NOTIFYHUB_RETRY_DEFAULT_MAX_RETRIES") {
            if let Ok(retries) = val.parse() {
                config.retry.default_max_retries = retries;
            }
        }
        if let Ok(val) = env::var("NOTIFYHUB_RETRY_BASE_DELAY_SECS") {
            if let Ok(delay) = val.parse() {
                config.retry.base_delay_secs = delay;
            }
        }
        if let Ok(val) = env::var("NOTIFYHUB_RETRY_MAX_DELAY_SECS") {
            if let Ok(delay) = val.parse() {
                config.retry.max_delay_secs = delay;
            }
        }

        // Escalation
        if let Ok(val) = env::var("NOTIFYHUB_ESCALATION_ENABLED") {
            config.escalation.enabled = val.parse().unwrap_or(true);
        }
        if let Ok(val) = env::var("NOTIFYHUB_ESCALATION_DELAY_SECS") {
            if let Ok(delay) = val.parse() {
                config.escalation.delay_secs = delay;
            }
        }
        if let Ok(val) = env::var("NOTIFYHUB_ESCALATION_MAX_LEVELS") {
            if let Ok(levels) = val.parse() {
                config.escalation.max_levels = levels;
            }
        }

        // Processor
        if let Ok(val) = env::var("NOTIFYHUB_PROCESSOR_CONCURRENCY") {
            if let Ok(workers) = val.parse() {
                config.processor.concurrency = workers;
            }
        }
        if let Ok(val) = env::var("NOTIFYHUB_PROCESSOR_SEND_TIMEOUT_MS") {
            if let Ok(timeout) = val.parse() {
                config.processor.send_timeout_ms = timeout;
            }
        }

        // Channels
        if let Ok(val) = env::var("NOTIFYHUB_EMAIL_ENABLED") {
            config.channels.email.enabled = val.parse().unwrap_or(false);
        }
        if let Ok(val) = env::var("NOTIFYHUB_EMAIL_SMTP_HOST") {
            config.channels.email.smtp_host = val;
        }
        if let Ok(val) = env::var("NOTIFYHUB_EMAIL_SMTP_PORT") {
            if let Ok(port) = val.parse() {
                config.channels.email.smtp_port = port;
            }
        }
        if let Ok(val) = env::var("NOTIFYHUB_EMAIL_FROM_ADDRESS") {
            config.channels.email.from_address = val;
        }
        if let Ok(val) = env::var("NOTIFYHUB_SLACK_ENABLED") {
            config.channels.slack.enabled = val.parse().unwrap_or(false);
        }
        if let Ok(val) = env::var("NOTIFYHUB_SLACK_WEBHOOK_URL") {
            config.channels.slack.webhook_url = val;
        }
        if let Ok(val) = env::var("NOTIFYHUB_WEBHOOK_ENABLED") {
            config.channels.webhook.enabled = val.parse().unwrap_or(false);
        }
        if let Ok(val) = env::var("NOTIFYHUB_WEBHOOK_SIGNING_SECRET_REF") {
            config.channels.webhook.signing_secret_ref = val;
        }
        if let Ok(val) = env::var("NOTIFYHUB_SMS_ENABLED") {
            config.channels.sms.enabled = val.parse().unwrap_or(false);
        }
        if let Ok(val) = env::var("NOTIFYHUB_SMS_API_URL") {
            config.channels.sms.api_url = val;
        }
        if let Ok(val) = env::var("NOTIFYHUB_TEAMS_ENABLED") {
            config.channels.teams.enabled = val.parse().unwrap_or(false);
        }
        if let Ok(val) = env::var("NOTIFYHUB_TEAMS_WEBHOOK_URL") {
            config.channels.teams.webhook_url = val;
        }

        // General
        if let Ok(val) = env::var("NOTIFYHUB_DATA_DIR") {
            config.data_dir = val;
        }
        if let Ok(val) = env::var("NOTIFYHUB_DEV_MODE") {
            config.dev_mode = val.parse().unwrap_or(false);
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_from_explicit_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[http]\nport = 9090\n\n[retry]\ndefault_max_retries = 5"
        )
        .unwrap();

        let loader = ConfigLoader::with_path(file.path());
        let config = loader.load().unwrap();
        assert_eq!(config.http.port, 9090);
        assert_eq!(config.retry.default_max_retries, 5);
        // Untouched sections keep their defaults
        assert_eq!(config.processor.concurrency, 5);
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let loader = ConfigLoader::with_path("/nonexistent/notifyhub.toml");
        let config = loader.load().unwrap();
        assert_eq!(config.http.port, 8080);
    }
}
