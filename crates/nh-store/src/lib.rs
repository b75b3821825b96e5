//! NotifyHub Notification Store
//!
//! SQLite persistence for notifications, deliveries, templates, and channels.
//! Repositories enforce the claim and terminal-state guards the processor
//! relies on: a notification is claimed by at most one worker, and a delivery
//! row that reached a terminal status is never mutated again.

use chrono::{DateTime, Utc};
use sqlx::{Pool, Sqlite};
use tracing::info;

mod channels;
mod deliveries;
mod error;
mod notifications;
mod templates;

pub use channels::ChannelRepository;
pub use deliveries::{new_pending, DeliveryRepository, DeliverySummary};
pub use error::StoreError;
pub use notifications::{NotificationFilter, NotificationRepository};
pub use templates::TemplateRepository;

pub type Result<T> = std::result::Result<T, StoreError>;

/// Handle to the notification store. Cheap to clone; repositories share the
/// underlying pool.
#[derive(Clone)]
pub struct Store {
    pool: Pool<Sqlite>,
}

impl Store {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub fn notifications(&self) -> NotificationRepository {
        NotificationRepository::new(self.pool.clone())
    }

    pub fn deliveries(&self) -> DeliveryRepository {
        DeliveryRepository::new(self.pool.clone())
    }

    pub fn templates(&self) -> TemplateRepository {
        TemplateRepository::new(self.pool.clone())
    }

    pub fn channels(&self) -> ChannelRepository {
        ChannelRepository::new(self.pool.clone())
    }

    /// Cheap liveness probe against the connection pool.
    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Create all tables and indexes
    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS notifications (
                id TEXT PRIMARY KEY,
                external_id TEXT,
                notification_type TEXT NOT NULL,
                priority TEXT NOT NULL,
                title TEXT NOT NULL,
                message TEXT NOT NULL,
                html_message TEXT,
                template_name TEXT,
                variables TEXT NOT NULL,
                recipients TEXT NOT NULL,
                channels TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                scheduled_at INTEGER,
                expires_at INTEGER,
                max_retries INTEGER NOT NULL,
                source_service TEXT,
                source_tool TEXT,
                user_id TEXT,
                created_by TEXT,
                status TEXT NOT NULL,
                escalation_level INTEGER NOT NULL DEFAULT 0,
                escalated_at INTEGER,
                next_escalation_at INTEGER
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_notifications_status
            ON notifications (status, created_at)
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Escalation sweep scans by due time over non-terminal rows
        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_notifications_escalation
            ON notifications (next_escalation_at)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS deliveries (
                id TEXT PRIMARY KEY,
                notification_id TEXT NOT NULL,
                channel TEXT NOT NULL,
                recipient TEXT NOT NULL,
                status TEXT NOT NULL,
                attempt_count INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                provider_status INTEGER,
                latency_ms INTEGER,
                first_attempted_at INTEGER,
                last_attempted_at INTEGER,
                completed_at INTEGER,
                UNIQUE(notification_id, channel, recipient)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_deliveries_notification
            ON deliveries (notification_id)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS templates (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                category TEXT NOT NULL,
                subject_template TEXT NOT NULL,
                body_template TEXT NOT NULL,
                html_template TEXT,
                variables TEXT NOT NULL,
                channels TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                created_at INTEGER NOT NULL,
                updated_at INTEGER
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS channels (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                kind TEXT NOT NULL,
                settings TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                created_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Store schema initialized");
        Ok(())
    }
}

// Timestamps are stored as unix milliseconds.

pub(crate) fn to_millis(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

pub(crate) fn opt_millis(t: Option<DateTime<Utc>>) -> Option<i64> {
    t.map(to_millis)
}

pub(crate) fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| StoreError::Invalid(format!("timestamp out of range: {ms}")))
}

pub(crate) fn opt_from_millis(ms: Option<i64>) -> Result<Option<DateTime<Utc>>> {
    ms.map(from_millis).transpose()
}
