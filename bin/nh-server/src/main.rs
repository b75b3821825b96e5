//! NotifyHub Server
//!
//! Runs the REST API and the delivery pipeline in one process: a SQLite
//! store, the five durable queues, the worker pool, and the escalation
//! sweep. Configuration comes from TOML with `NOTIFYHUB_*` environment
//! overrides.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use tokio::{net::TcpListener, signal};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use nh_api::{create_router, AppState};
use nh_common::logging::init_logging;
use nh_common::{
    ChannelSettings, EmailSettings, SlackSettings, SmsSettings, SystemClock, TeamsSettings,
    WebhookSettings,
};
use nh_config::{AppConfig, ChannelsConfig};
use nh_pipeline::{
    build_adapter, build_http_client, AdapterRegistry, EscalationEngine, EscalationPolicy,
    LogAuditSink, Processor, ProcessorOptions, RetryPolicy, TemplateEngine,
};
use nh_queue::SqliteJobQueue;
use nh_store::Store;

const TEMPLATE_CACHE_TTL: Duration = Duration::from_secs(300);

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (for local development)
    let _ = dotenvy::dotenv();

    init_logging("nh-server");

    let config = AppConfig::load().context("failed to load configuration")?;
    config.validate().context("invalid configuration")?;

    info!(
        host = %config.http.host,
        port = config.http.port,
        dev_mode = config.dev_mode,
        "Starting NotifyHub"
    );

    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("failed to create data dir {}", config.data_dir))?;

    // 1. Store
    let store_pool = connect_sqlite(&config.database.url, config.database.max_connections).await?;
    let store = Store::new(store_pool);
    store.init_schema().await.context("store schema init failed")?;

    let clock = Arc::new(SystemClock);

    // 2. Queues; they share the store database unless queue.url points elsewhere
    let queue_url = config.queue_url().to_string();
    let queue_pool = if queue_url == config.database.url {
        store.pool().clone()
    } else {
        connect_sqlite(&queue_url, config.database.max_connections).await?
    };
    let queue = Arc::new(SqliteJobQueue::new(
        queue_pool,
        config.queue.visibility_timeout_secs as u32,
        clock.clone(),
    ));
    queue.init_schema().await.context("queue schema init failed")?;

    // 3. Channel adapters: configured channels first, then rows from the
    // channels table override or extend them
    let http_client =
        build_http_client(Duration::from_millis(config.processor.send_timeout_ms))
            .context("failed to build HTTP client")?;
    let mut registry = AdapterRegistry::new();
    for settings in configured_channels(&config.channels) {
        info!(channel = %settings.kind(), "Registering channel from config");
        registry.register(build_adapter(&settings, http_client.clone()));
    }
    for channel in store.channels().list().await? {
        if channel.enabled {
            info!(channel = %channel.kind(), name = %channel.name, "Registering channel from store");
            registry.register(build_adapter(&channel.settings, http_client.clone()));
        }
    }
    let registry = Arc::new(registry);

    // 4. Pipeline services
    let templates = Arc::new(TemplateEngine::new(
        store.templates(),
        TEMPLATE_CACHE_TTL,
        clock.clone(),
    ));
    let escalation = Arc::new(EscalationEngine::new(EscalationPolicy {
        enabled: config.escalation.enabled,
        delay: Duration::from_secs(config.escalation.delay_secs),
        max_levels: config.escalation.max_levels,
        level_recipients: config.escalation.level_recipients.clone(),
    }));
    let audit = Arc::new(LogAuditSink);

    let processor = Arc::new(Processor::new(
        store.clone(),
        queue.clone(),
        registry,
        templates.clone(),
        escalation,
        audit.clone(),
        RetryPolicy {
            base_delay: Duration::from_secs(config.retry.base_delay_secs),
            max_delay: Duration::from_secs(config.retry.max_delay_secs),
        },
        ProcessorOptions {
            concurrency: config.processor.concurrency,
            poll_interval: Duration::from_millis(config.queue.poll_interval_ms),
            sweep_interval: Duration::from_millis(config.escalation.sweep_interval_ms),
            promote_interval: Duration::from_millis(config.queue.promote_interval_ms),
        },
        clock.clone(),
    ));
    let pipeline_handles = processor.start();

    // 5. HTTP API
    let state = AppState {
        store,
        queue,
        templates,
        audit,
        clock,
        http_client,
        default_max_retries: config.retry.default_max_retries,
    };
    let app = create_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(&config.http.cors_origins));

    let addr = format!("{}:{}", config.http.host, config.http.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(addr = %addr, "HTTP API listening");

    let server_task = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            warn!(error = %e, "HTTP server stopped");
        }
    });

    info!("NotifyHub started. Press Ctrl+C to shutdown.");
    shutdown_signal().await;
    info!("Shutdown signal received");

    processor.stop();
    server_task.abort();
    for handle in pipeline_handles {
        if tokio::time::timeout(Duration::from_secs(10), handle)
            .await
            .is_err()
        {
            warn!("Pipeline task did not stop within 10s");
            break;
        }
    }

    info!("NotifyHub shutdown complete");
    Ok(())
}

async fn connect_sqlite(url: &str, max_connections: u32) -> Result<Pool<Sqlite>> {
    let options = SqliteConnectOptions::from_str(url)
        .with_context(|| format!("invalid database url {url}"))?
        .create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await
        .with_context(|| format!("failed to open database {url}"))?;
    Ok(pool)
}

/// Map the `[channels.*]` config sections to typed adapter settings.
/// Secret-bearing fields stay references to environment variable names;
/// only the webhook signing secret is resolved here because the wire
/// signer needs the raw value.
fn configured_channels(channels: &ChannelsConfig) -> Vec<ChannelSettings> {
    let mut out = Vec::new();

    if channels.email.enabled {
        out.push(ChannelSettings::Email(EmailSettings {
            smtp_host: channels.email.smtp_host.clone(),
            smtp_port: channels.email.smtp_port,
            username: non_empty(&channels.email.username),
            password_ref: non_empty(&channels.email.password_ref),
            from_address: channels.email.from_address.clone(),
            use_tls: channels.email.use_tls,
        }));
    }
    if channels.slack.enabled {
        out.push(ChannelSettings::Slack(SlackSettings {
            webhook_url: channels.slack.webhook_url.clone(),
            default_channel: non_empty(&channels.slack.default_channel),
            username: None,
        }));
    }
    if channels.webhook.enabled {
        let signing_secret = std::env::var(&channels.webhook.signing_secret_ref).ok();
        if signing_secret.is_none() {
            warn!(
                var = %channels.webhook.signing_secret_ref,
                "Webhook signing secret variable not set; outgoing webhooks will be unsigned"
            );
        }
        out.push(ChannelSettings::Webhook(WebhookSettings {
            // Recipients carry the target URL for config-level webhooks
            url: String::new(),
            signing_secret,
            timeout_seconds: channels.webhook.timeout_ms / 1000,
        }));
    }
    if channels.sms.enabled {
        out.push(ChannelSettings::Sms(SmsSettings {
            api_url: channels.sms.api_url.clone(),
            api_key_ref: non_empty(&channels.sms.api_key_ref),
            from_number: channels.sms.from_number.clone(),
        }));
    }
    if channels.teams.enabled {
        out.push(ChannelSettings::Teams(TeamsSettings {
            webhook_url: channels.teams.webhook_url.clone(),
        }));
    }

    out
}

fn non_empty(s: &str) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.iter().any(|o| o == "*") || origins.is_empty() {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let parsed: Vec<_> = origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(parsed)
            .allow_methods(Any)
            .allow_headers(Any)
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
