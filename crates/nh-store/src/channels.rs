use sqlx::sqlite::SqliteRow;
use sqlx::{Pool, Row, Sqlite};
use tracing::debug;

use nh_common::{Channel, ChannelKind, ChannelSettings};

use crate::{from_millis, to_millis, Result, StoreError};

pub struct ChannelRepository {
    pool: Pool<Sqlite>,
}

impl ChannelRepository {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, c: &Channel) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO channels (id, name, kind, settings, enabled, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&c.id)
        .bind(&c.name)
        .bind(c.kind().as_str())
        .bind(serde_json::to_string(&c.settings)?)
        .bind(c.enabled as i64)
        .bind(to_millis(c.created_at))
        .execute(&self.pool)
        .await?;

        debug!(channel = %c.name, kind = %c.kind(), "Channel inserted");
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Option<Channel>> {
        let row = sqlx::query("SELECT * FROM channels WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_channel).transpose()
    }

    pub async fn list(&self) -> Result<Vec<Channel>> {
        let rows = sqlx::query("SELECT * FROM channels ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(row_to_channel).collect()
    }

    /// The adapter registry is built from enabled channels only.
    pub async fn find_enabled_by_kind(&self, kind: ChannelKind) -> Result<Option<Channel>> {
        let row = sqlx::query("SELECT * FROM channels WHERE kind = ? AND enabled = 1 LIMIT 1")
            .bind(kind.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_channel).transpose()
    }

    pub async fn update(&self, c: &Channel) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE channels SET name = ?, kind = ?, settings = ?, enabled = ?
            WHERE id = ?
            "#,
        )
        .bind(&c.name)
        .bind(c.kind().as_str())
        .bind(serde_json::to_string(&c.settings)?)
        .bind(c.enabled as i64)
        .bind(&c.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("channel {}", c.id)));
        }
        Ok(())
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM channels WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("channel {id}")));
        }
        Ok(())
    }
}

fn row_to_channel(row: SqliteRow) -> Result<Channel> {
    let settings: String = row.get("settings");
    let settings: ChannelSettings = serde_json::from_str(&settings)?;

    Ok(Channel {
        id: row.get("id"),
        name: row.get("name"),
        settings,
        enabled: row.get::<i64, _>("enabled") != 0,
        created_at: from_millis(row.get("created_at"))?,
    })
}
