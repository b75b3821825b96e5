use chrono::{DateTime, Utc};
use sqlx::{Pool, Row, Sqlite};
use sqlx::sqlite::SqliteRow;
use tracing::debug;

use nh_common::{Notification, NotificationPriority, NotificationStatus};

use crate::{from_millis, opt_from_millis, opt_millis, to_millis, Result, StoreError};

/// Filters for listing notifications
#[derive(Debug, Clone, Default)]
pub struct NotificationFilter {
    pub status: Option<NotificationStatus>,
    pub notification_type: Option<String>,
    pub priority: Option<NotificationPriority>,
    pub source_service: Option<String>,
    pub source_tool: Option<String>,
    pub user_id: Option<String>,
}

pub struct NotificationRepository {
    pool: Pool<Sqlite>,
}

impl NotificationRepository {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, n: &Notification) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO notifications (
                id, external_id, notification_type, priority, title, message,
                html_message, template_name, variables, recipients, channels,
                created_at, scheduled_at, expires_at, max_retries,
                source_service, source_tool, user_id, created_by, status,
                escalation_level, escalated_at, next_escalation_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&n.id)
        .bind(&n.external_id)
        .bind(&n.notification_type)
        .bind(n.priority.as_str())
        .bind(&n.title)
        .bind(&n.message)
        .bind(&n.html_message)
        .bind(&n.template_name)
        .bind(serde_json::to_string(&n.variables)?)
        .bind(serde_json::to_string(&n.recipients)?)
        .bind(serde_json::to_string(&n.channels)?)
        .bind(to_millis(n.created_at))
        .bind(opt_millis(n.scheduled_at))
        .bind(opt_millis(n.expires_at))
        .bind(n.max_retries as i64)
        .bind(&n.source_service)
        .bind(&n.source_tool)
        .bind(&n.user_id)
        .bind(&n.created_by)
        .bind(n.status.as_str())
        .bind(n.escalation_level as i64)
        .bind(opt_millis(n.escalated_at))
        .bind(opt_millis(n.next_escalation_at))
        .execute(&self.pool)
        .await?;

        debug!(notification_id = %n.id, "Notification inserted");
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Option<Notification>> {
        let row = sqlx::query("SELECT * FROM notifications WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_notification).transpose()
    }

    /// Paginated list, newest first. Returns the page plus the total count
    /// across all matching rows.
    pub async fn list(
        &self,
        filter: &NotificationFilter,
        limit: u32,
        offset: u64,
    ) -> Result<(Vec<Notification>, u64)> {
        let mut conditions = Vec::new();
        let mut binds: Vec<String> = Vec::new();

        if let Some(status) = filter.status {
            conditions.push("status = ?");
            binds.push(status.as_str().to_string());
        }
        if let Some(ty) = &filter.notification_type {
            conditions.push("notification_type = ?");
            binds.push(ty.clone());
        }
        if let Some(priority) = filter.priority {
            conditions.push("priority = ?");
            binds.push(priority.as_str().to_string());
        }
        if let Some(svc) = &filter.source_service {
            conditions.push("source_service = ?");
            binds.push(svc.clone());
        }
        if let Some(tool) = &filter.source_tool {
            conditions.push("source_tool = ?");
            binds.push(tool.clone());
        }
        if let Some(user) = &filter.user_id {
            conditions.push("user_id = ?");
            binds.push(user.clone());
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", conditions.join(" AND "))
        };

        let count_sql = format!("SELECT COUNT(*) as count FROM notifications{where_clause}");
        let mut count_query = sqlx::query(&count_sql);
        for bind in &binds {
            count_query = count_query.bind(bind.as_str());
        }
        let total: i64 = count_query.fetch_one(&self.pool).await?.get("count");

        let list_sql = format!(
            "SELECT * FROM notifications{where_clause} ORDER BY created_at DESC LIMIT ? OFFSET ?"
        );
        let mut list_query = sqlx::query(&list_sql);
        for bind in &binds {
            list_query = list_query.bind(bind.as_str());
        }
        let rows = list_query
            .bind(limit as i64)
            .bind(offset as i64)
            .fetch_all(&self.pool)
            .await?;

        let notifications = rows
            .into_iter()
            .map(row_to_notification)
            .collect::<Result<Vec<_>>>()?;

        Ok((notifications, total as u64))
    }

    /// Exclusive claim: flips queued -> processing for exactly one caller.
    /// Returns false when the row is missing, already claimed, or terminal.
    pub async fn claim(&self, id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE notifications SET status = 'processing' WHERE id = ? AND status = 'queued'",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Guarded status transition: only non-terminal rows move. Returns
    /// whether this call performed the transition, so terminal writes
    /// (failed on exhaustion, expired) happen exactly once.
    pub async fn set_status(&self, id: &str, status: NotificationStatus) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE notifications SET status = ?
            WHERE id = ? AND status NOT IN ('sent', 'partially_delivered', 'delivered', 'failed', 'expired')
            "#,
        )
        .bind(status.as_str())
        .bind(id)
        .execute(&self.pool)
        .await?;

        let transitioned = result.rows_affected() > 0;
        if transitioned {
            debug!(notification_id = %id, status = %status.as_str(), "Notification status updated");
        }
        Ok(transitioned)
    }

    /// Advance escalation from `expected_level` to the next one. The level
    /// guard makes the bump exactly-once even when sweeps overlap.
    pub async fn advance_escalation(
        &self,
        id: &str,
        expected_level: u32,
        escalated_at: DateTime<Utc>,
        next_escalation_at: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE notifications
            SET escalation_level = ?, escalated_at = ?, next_escalation_at = ?
            WHERE id = ? AND escalation_level = ?
              AND status NOT IN ('sent', 'partially_delivered', 'delivered', 'failed', 'expired')
            "#,
        )
        .bind(expected_level as i64 + 1)
        .bind(to_millis(escalated_at))
        .bind(opt_millis(next_escalation_at))
        .bind(id)
        .bind(expected_level as i64)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Arm the escalation timer once: only rows with no deadline yet are
    /// touched, so reprocessing never pushes an armed deadline out.
    pub async fn schedule_escalation_if_unset(
        &self,
        id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE notifications SET next_escalation_at = ?
            WHERE id = ? AND next_escalation_at IS NULL
              AND status NOT IN ('sent', 'partially_delivered', 'delivered', 'failed', 'expired')
            "#,
        )
        .bind(to_millis(at))
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Stop future escalation sweeps from picking this row up.
    pub async fn clear_escalation_schedule(&self, id: &str) -> Result<()> {
        sqlx::query("UPDATE notifications SET next_escalation_at = NULL WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Non-terminal notifications whose escalation deadline has passed.
    pub async fn due_for_escalation(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Notification>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM notifications
            WHERE next_escalation_at IS NOT NULL AND next_escalation_at <= ?
              AND status NOT IN ('sent', 'partially_delivered', 'delivered', 'failed', 'expired')
            ORDER BY next_escalation_at
            LIMIT ?
            "#,
        )
        .bind(to_millis(now))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_notification).collect()
    }

    /// Broaden the recipient list (escalation adds audience). Duplicates are
    /// dropped so repeated escalations stay idempotent.
    pub async fn append_recipients(&self, id: &str, additional: &[String]) -> Result<()> {
        let Some(notification) = self.get(id).await? else {
            return Err(StoreError::NotFound(format!("notification {id}")));
        };

        let mut recipients = notification.recipients;
        for r in additional {
            if !recipients.contains(r) {
                recipients.push(r.clone());
            }
        }

        sqlx::query("UPDATE notifications SET recipients = ? WHERE id = ?")
            .bind(serde_json::to_string(&recipients)?)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn row_to_notification(row: SqliteRow) -> Result<Notification> {
    let priority: String = row.get("priority");
    let status: String = row.get("status");
    let variables: String = row.get("variables");
    let recipients: String = row.get("recipients");
    let channels: String = row.get("channels");

    Ok(Notification {
        id: row.get("id"),
        external_id: row.get("external_id"),
        notification_type: row.get("notification_type"),
        priority: NotificationPriority::parse_str(&priority)
            .ok_or_else(|| StoreError::Invalid(format!("priority: {priority}")))?,
        title: row.get("title"),
        message: row.get("message"),
        html_message: row.get("html_message"),
        template_name: row.get("template_name"),
        variables: serde_json::from_str(&variables)?,
        recipients: serde_json::from_str(&recipients)?,
        channels: serde_json::from_str(&channels)?,
        created_at: from_millis(row.get("created_at"))?,
        scheduled_at: opt_from_millis(row.get("scheduled_at"))?,
        expires_at: opt_from_millis(row.get("expires_at"))?,
        max_retries: row.get::<i64, _>("max_retries") as u32,
        source_service: row.get("source_service"),
        source_tool: row.get("source_tool"),
        user_id: row.get("user_id"),
        created_by: row.get("created_by"),
        status: NotificationStatus::parse_str(&status)
            .ok_or_else(|| StoreError::Invalid(format!("status: {status}")))?,
        escalation_level: row.get::<i64, _>("escalation_level") as u32,
        escalated_at: opt_from_millis(row.get("escalated_at"))?,
        next_escalation_at: opt_from_millis(row.get("next_escalation_at"))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Store;
    use nh_common::ChannelKind;
    use sqlx::sqlite::SqlitePoolOptions;
    use std::collections::HashMap;

    async fn test_store() -> Store {
        let pool = SqlitePoolOptions::new()
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = Store::new(pool);
        store.init_schema().await.unwrap();
        store
    }

    fn sample(id: &str) -> Notification {
        Notification {
            id: id.to_string(),
            external_id: None,
            notification_type: "deploy.failed".to_string(),
            priority: NotificationPriority::High,
            title: "Deploy failed".to_string(),
            message: "Pipeline run 42 failed".to_string(),
            html_message: None,
            template_name: None,
            variables: HashMap::new(),
            recipients: vec!["ops@example.com".to_string()],
            channels: vec![ChannelKind::Email, ChannelKind::Slack],
            created_at: Utc::now(),
            scheduled_at: None,
            expires_at: None,
            max_retries: 3,
            source_service: Some("ci".to_string()),
            source_tool: None,
            user_id: None,
            created_by: Some("svc-ci".to_string()),
            status: NotificationStatus::Queued,
            escalation_level: 0,
            escalated_at: None,
            next_escalation_at: None,
        }
    }

    #[tokio::test]
    async fn test_insert_and_get() {
        let store = test_store().await;
        let repo = store.notifications();
        let n = sample("n-1");
        repo.insert(&n).await.unwrap();

        let loaded = repo.get("n-1").await.unwrap().unwrap();
        assert_eq!(loaded.title, "Deploy failed");
        assert_eq!(loaded.channels, vec![ChannelKind::Email, ChannelKind::Slack]);
        assert_eq!(loaded.status, NotificationStatus::Queued);
        assert!(repo.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let store = test_store().await;
        let repo = store.notifications();
        repo.insert(&sample("n-1")).await.unwrap();

        assert!(repo.claim("n-1").await.unwrap());
        // Second claim loses
        assert!(!repo.claim("n-1").await.unwrap());
        assert_eq!(
            repo.get("n-1").await.unwrap().unwrap().status,
            NotificationStatus::Processing
        );
    }

    #[tokio::test]
    async fn test_terminal_status_is_sticky() {
        let store = test_store().await;
        let repo = store.notifications();
        repo.insert(&sample("n-1")).await.unwrap();

        assert!(repo.set_status("n-1", NotificationStatus::Failed).await.unwrap());
        // Terminal rows never transition again
        assert!(!repo.set_status("n-1", NotificationStatus::Delivered).await.unwrap());
        assert!(!repo.set_status("n-1", NotificationStatus::Failed).await.unwrap());
    }

    #[tokio::test]
    async fn test_list_filters_and_pagination() {
        let store = test_store().await;
        let repo = store.notifications();
        for i in 0..5 {
            let mut n = sample(&format!("n-{i}"));
            if i % 2 == 0 {
                n.priority = NotificationPriority::Low;
            }
            repo.insert(&n).await.unwrap();
        }

        let filter = NotificationFilter {
            priority: Some(NotificationPriority::Low),
            ..Default::default()
        };
        let (page, total) = repo.list(&filter, 2, 0).await.unwrap();
        assert_eq!(total, 3);
        assert_eq!(page.len(), 2);

        let (rest, _) = repo.list(&filter, 2, 2).await.unwrap();
        assert_eq!(rest.len(), 1);
    }

    #[tokio::test]
    async fn test_escalation_advance_exactly_once() {
        let store = test_store().await;
        let repo = store.notifications();
        let mut n = sample("n-1");
        let due = Utc::now() - chrono::Duration::seconds(1);
        n.next_escalation_at = Some(due);
        repo.insert(&n).await.unwrap();

        let found = repo.due_for_escalation(Utc::now(), 10).await.unwrap();
        assert_eq!(found.len(), 1);

        let now = Utc::now();
        assert!(repo.advance_escalation("n-1", 0, now, Some(now)).await.unwrap());
        // Stale sweep still holds level 0: the guard rejects it
        assert!(!repo.advance_escalation("n-1", 0, now, Some(now)).await.unwrap());

        let loaded = repo.get("n-1").await.unwrap().unwrap();
        assert_eq!(loaded.escalation_level, 1);
    }

    #[tokio::test]
    async fn test_append_recipients_dedupes() {
        let store = test_store().await;
        let repo = store.notifications();
        repo.insert(&sample("n-1")).await.unwrap();

        repo.append_recipients(
            "n-1",
            &["ops@example.com".to_string(), "oncall@example.com".to_string()],
        )
        .await
        .unwrap();

        let loaded = repo.get("n-1").await.unwrap().unwrap();
        assert_eq!(
            loaded.recipients,
            vec!["ops@example.com".to_string(), "oncall@example.com".to_string()]
        );
    }
}
