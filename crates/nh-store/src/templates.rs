use sqlx::sqlite::SqliteRow;
use sqlx::{Pool, Row, Sqlite};
use tracing::debug;

use nh_common::Template;

use crate::{from_millis, opt_from_millis, opt_millis, to_millis, Result, StoreError};

pub struct TemplateRepository {
    pool: Pool<Sqlite>,
}

impl TemplateRepository {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, t: &Template) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO templates (
                id, name, category, subject_template, body_template,
                html_template, variables, channels, enabled, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&t.id)
        .bind(&t.name)
        .bind(&t.category)
        .bind(&t.subject_template)
        .bind(&t.body_template)
        .bind(&t.html_template)
        .bind(serde_json::to_string(&t.variables)?)
        .bind(serde_json::to_string(&t.channels)?)
        .bind(t.enabled as i64)
        .bind(to_millis(t.created_at))
        .bind(opt_millis(t.updated_at))
        .execute(&self.pool)
        .await?;

        debug!(template = %t.name, "Template inserted");
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Option<Template>> {
        let row = sqlx::query("SELECT * FROM templates WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_template).transpose()
    }

    pub async fn get_by_name(&self, name: &str) -> Result<Option<Template>> {
        let row = sqlx::query("SELECT * FROM templates WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_template).transpose()
    }

    /// Lookup used by the rendering path: only enabled templates resolve.
    pub async fn get_enabled_by_name(&self, name: &str) -> Result<Option<Template>> {
        let row = sqlx::query("SELECT * FROM templates WHERE name = ? AND enabled = 1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_template).transpose()
    }

    pub async fn list(&self, category: Option<&str>) -> Result<Vec<Template>> {
        let rows = match category {
            Some(cat) => {
                sqlx::query("SELECT * FROM templates WHERE category = ? ORDER BY name")
                    .bind(cat)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                sqlx::query("SELECT * FROM templates ORDER BY name")
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.into_iter().map(row_to_template).collect()
    }

    pub async fn update(&self, t: &Template) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE templates
            SET name = ?, category = ?, subject_template = ?, body_template = ?,
                html_template = ?, variables = ?, channels = ?, enabled = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&t.name)
        .bind(&t.category)
        .bind(&t.subject_template)
        .bind(&t.body_template)
        .bind(&t.html_template)
        .bind(serde_json::to_string(&t.variables)?)
        .bind(serde_json::to_string(&t.channels)?)
        .bind(t.enabled as i64)
        .bind(opt_millis(t.updated_at))
        .bind(&t.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("template {}", t.id)));
        }
        Ok(())
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM templates WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("template {id}")));
        }
        Ok(())
    }
}

fn row_to_template(row: SqliteRow) -> Result<Template> {
    let variables: String = row.get("variables");
    let channels: String = row.get("channels");

    Ok(Template {
        id: row.get("id"),
        name: row.get("name"),
        category: row.get("category"),
        subject_template: row.get("subject_template"),
        body_template: row.get("body_template"),
        html_template: row.get("html_template"),
        variables: serde_json::from_str(&variables)?,
        channels: serde_json::from_str(&channels)?,
        enabled: row.get::<i64, _>("enabled") != 0,
        created_at: from_millis(row.get("created_at"))?,
        updated_at: opt_from_millis(row.get("updated_at"))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Store;
    use chrono::Utc;
    use nh_common::ChannelKind;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn test_store() -> Store {
        let pool = SqlitePoolOptions::new()
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = Store::new(pool);
        store.init_schema().await.unwrap();
        store
    }

    fn sample(name: &str) -> Template {
        Template {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            category: "alerts".to_string(),
            subject_template: "Alert: {{alert_name}}".to_string(),
            body_template: "{{alert_name}} fired at {{fired_at}}".to_string(),
            html_template: None,
            variables: vec!["alert_name".to_string(), "fired_at".to_string()],
            channels: vec![ChannelKind::Email, ChannelKind::Slack],
            enabled: true,
            created_at: Utc::now(),
            updated_at: None,
        }
    }

    #[tokio::test]
    async fn test_crud_round_trip() {
        let store = test_store().await;
        let repo = store.templates();

        let mut t = sample("alert-fired");
        repo.insert(&t).await.unwrap();

        let loaded = repo.get_by_name("alert-fired").await.unwrap().unwrap();
        assert_eq!(loaded.variables, t.variables);

        t.enabled = false;
        t.updated_at = Some(Utc::now());
        repo.update(&t).await.unwrap();
        assert!(repo.get_enabled_by_name("alert-fired").await.unwrap().is_none());

        repo.delete(&t.id).await.unwrap();
        assert!(repo.get(&t.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_name_rejected() {
        let store = test_store().await;
        let repo = store.templates();
        repo.insert(&sample("dup")).await.unwrap();
        assert!(repo.insert(&sample("dup")).await.is_err());
    }

    #[tokio::test]
    async fn test_list_by_category() {
        let store = test_store().await;
        let repo = store.templates();
        repo.insert(&sample("a")).await.unwrap();
        let mut other = sample("b");
        other.category = "digest".to_string();
        repo.insert(&other).await.unwrap();

        assert_eq!(repo.list(Some("alerts")).await.unwrap().len(), 1);
        assert_eq!(repo.list(None).await.unwrap().len(), 2);
    }
}
