use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Pool, Row, Sqlite};
use tracing::debug;
use utoipa::ToSchema;

use nh_common::{ChannelKind, Delivery, DeliveryOutcome, DeliveryStatus};

use crate::{from_millis, opt_from_millis, opt_millis, to_millis, Result, StoreError};

/// Per-notification delivery rollup used for aggregate status recompute
/// and the delivery summary endpoint.
#[derive(Debug, Clone, Default, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeliverySummary {
    pub total: u64,
    pub pending: u64,
    pub sent: u64,
    pub delivered: u64,
    pub failed: u64,
    pub retrying: u64,
}

impl DeliverySummary {
    pub fn all_terminal(&self) -> bool {
        self.total > 0 && self.pending == 0 && self.retrying == 0
    }

    pub fn all_succeeded(&self) -> bool {
        self.all_terminal() && self.failed == 0
    }

    pub fn all_failed(&self) -> bool {
        self.all_terminal() && self.failed == self.total
    }
}

pub struct DeliveryRepository {
    pool: Pool<Sqlite>,
}

impl DeliveryRepository {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    /// Create a pending delivery row unless one already exists for this
    /// (notification, channel, recipient). Redelivered jobs hit the
    /// conflict and reuse the existing row.
    pub async fn insert_if_absent(&self, d: &Delivery) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO deliveries (
                id, notification_id, channel, recipient, status, attempt_count,
                last_error, provider_status, latency_ms,
                first_attempted_at, last_attempted_at, completed_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(notification_id, channel, recipient) DO NOTHING
            "#,
        )
        .bind(&d.id)
        .bind(&d.notification_id)
        .bind(d.channel.as_str())
        .bind(&d.recipient)
        .bind(d.status.as_str())
        .bind(d.attempt_count as i64)
        .bind(&d.last_error)
        .bind(d.provider_status.map(|s| s as i64))
        .bind(d.latency_ms.map(|l| l as i64))
        .bind(opt_millis(d.first_attempted_at))
        .bind(opt_millis(d.last_attempted_at))
        .bind(opt_millis(d.completed_at))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn get(&self, id: &str) -> Result<Option<Delivery>> {
        let row = sqlx::query("SELECT * FROM deliveries WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_delivery).transpose()
    }

    pub async fn list_for_notification(&self, notification_id: &str) -> Result<Vec<Delivery>> {
        let rows = sqlx::query(
            "SELECT * FROM deliveries WHERE notification_id = ? ORDER BY channel, recipient",
        )
        .bind(notification_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_delivery).collect()
    }

    /// Record one attempt outcome. The guard skips rows that already reached
    /// a terminal state; returns whether the row was updated.
    pub async fn record_attempt(
        &self,
        id: &str,
        status: DeliveryStatus,
        outcome: &DeliveryOutcome,
        attempted_at: DateTime<Utc>,
    ) -> Result<bool> {
        let completed_at = if status.is_terminal() {
            Some(to_millis(attempted_at))
        } else {
            None
        };

        let result = sqlx::query(
            r#"
            UPDATE deliveries
            SET status = ?,
                attempt_count = attempt_count + 1,
                last_error = ?,
                provider_status = ?,
                latency_ms = ?,
                first_attempted_at = COALESCE(first_attempted_at, ?),
                last_attempted_at = ?,
                completed_at = ?
            WHERE id = ? AND status NOT IN ('sent', 'delivered', 'failed')
            "#,
        )
        .bind(status.as_str())
        .bind(&outcome.error)
        .bind(outcome.provider_status.map(|s| s as i64))
        .bind(outcome.latency_ms as i64)
        .bind(to_millis(attempted_at))
        .bind(to_millis(attempted_at))
        .bind(completed_at)
        .bind(id)
        .execute(&self.pool)
        .await?;

        let updated = result.rows_affected() > 0;
        if updated {
            debug!(delivery_id = %id, status = %status.as_str(), "Delivery attempt recorded");
        }
        Ok(updated)
    }

    /// Flip a retrying delivery back to pending-equivalent terminal failure
    /// without counting an attempt (expiry, exhausted escalation).
    pub async fn finalize(&self, id: &str, status: DeliveryStatus, error: Option<&str>, at: DateTime<Utc>) -> Result<bool> {
        if !status.is_terminal() {
            return Err(StoreError::Invalid(format!(
                "finalize requires a terminal status, got {}",
                status.as_str()
            )));
        }
        let result = sqlx::query(
            r#"
            UPDATE deliveries
            SET status = ?, last_error = COALESCE(?, last_error), completed_at = ?
            WHERE id = ? AND status NOT IN ('sent', 'delivered', 'failed')
            "#,
        )
        .bind(status.as_str())
        .bind(error)
        .bind(to_millis(at))
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn summary(&self, notification_id: &str) -> Result<DeliverySummary> {
        let rows = sqlx::query(
            "SELECT status, COUNT(*) as count FROM deliveries WHERE notification_id = ? GROUP BY status",
        )
        .bind(notification_id)
        .fetch_all(&self.pool)
        .await?;

        let mut summary = DeliverySummary::default();
        for row in rows {
            let status: String = row.get("status");
            let count: i64 = row.get("count");
            let count = count as u64;
            summary.total += count;
            match DeliveryStatus::parse_str(&status) {
                Some(DeliveryStatus::Pending) => summary.pending += count,
                Some(DeliveryStatus::Sent) => summary.sent += count,
                Some(DeliveryStatus::Delivered) => summary.delivered += count,
                Some(DeliveryStatus::Failed) => summary.failed += count,
                Some(DeliveryStatus::Retrying) => summary.retrying += count,
                None => return Err(StoreError::Invalid(format!("delivery status: {status}"))),
            }
        }
        Ok(summary)
    }
}

fn row_to_delivery(row: SqliteRow) -> Result<Delivery> {
    let channel: String = row.get("channel");
    let status: String = row.get("status");

    Ok(Delivery {
        id: row.get("id"),
        notification_id: row.get("notification_id"),
        channel: ChannelKind::parse_str(&channel)
            .ok_or_else(|| StoreError::Invalid(format!("channel: {channel}")))?,
        recipient: row.get("recipient"),
        status: DeliveryStatus::parse_str(&status)
            .ok_or_else(|| StoreError::Invalid(format!("status: {status}")))?,
        attempt_count: row.get::<i64, _>("attempt_count") as u32,
        last_error: row.get("last_error"),
        provider_status: row.get::<Option<i64>, _>("provider_status").map(|s| s as u16),
        latency_ms: row.get::<Option<i64>, _>("latency_ms").map(|l| l as u64),
        first_attempted_at: opt_from_millis(row.get("first_attempted_at"))?,
        last_attempted_at: opt_from_millis(row.get("last_attempted_at"))?,
        completed_at: opt_from_millis(row.get("completed_at"))?,
    })
}

/// Build a fresh pending delivery row.
pub fn new_pending(notification_id: &str, channel: ChannelKind, recipient: &str) -> Delivery {
    Delivery {
        id: uuid::Uuid::new_v4().to_string(),
        notification_id: notification_id.to_string(),
        channel,
        recipient: recipient.to_string(),
        status: DeliveryStatus::Pending,
        attempt_count: 0,
        last_error: None,
        provider_status: None,
        latency_ms: None,
        first_attempted_at: None,
        last_attempted_at: None,
        completed_at: None,
    }
}
