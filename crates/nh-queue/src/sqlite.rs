use async_trait::async_trait;
use sqlx::{Pool, Row, Sqlite};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use nh_common::Clock;

use crate::{
    EnqueueOptions, JobPayload, JobQueue, QueueError, QueueName, QueueStats, QueuedJob, Result,
};

/// SQLite-backed durable job queue. All five queues share one table;
/// the queue name is a column so stats and promotion are single statements.
pub struct SqliteJobQueue {
    pool: Pool<Sqlite>,
    visibility_timeout_seconds: u32,
    clock: Arc<dyn Clock>,
    running: AtomicBool,
}

impl SqliteJobQueue {
    pub fn new(pool: Pool<Sqlite>, visibility_timeout_seconds: u32, clock: Arc<dyn Clock>) -> Self {
        Self {
            pool,
            visibility_timeout_seconds,
            clock,
            running: AtomicBool::new(true),
        }
    }

    /// Create the queue schema
    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS queue_jobs (
                id TEXT PRIMARY KEY,
                queue_name TEXT NOT NULL,
                dedupe_key TEXT,
                receipt_handle TEXT,
                visible_at INTEGER NOT NULL,
                payload TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                receive_count INTEGER DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Index for efficient polling
        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_queue_jobs_visible
            ON queue_jobs (queue_name, visible_at)
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Unique dedupe key per queue (NULLs are exempt in SQLite)
        sqlx::query(
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_queue_jobs_dedupe
            ON queue_jobs (queue_name, dedupe_key)
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Queue schema initialized");
        Ok(())
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        info!("Job queue stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn generate_receipt_handle(&self) -> String {
        uuid::Uuid::new_v4().to_string()
    }
}

#[async_trait]
impl JobQueue for SqliteJobQueue {
    async fn enqueue(
        &self,
        queue: QueueName,
        payload: JobPayload,
        opts: EnqueueOptions,
    ) -> Result<String> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(QueueError::Stopped);
        }

        let now = self.clock.now();
        let visible_at = opts.run_at.map(|t| t.timestamp()).unwrap_or(now.timestamp());

        let id = uuid::Uuid::new_v4().to_string();
        let body = serde_json::to_string(&payload)?;

        // Idempotent enqueue: the unique (queue_name, dedupe_key) index makes
        // the insert a no-op for duplicates, so concurrent enqueues with the
        // same key both resolve to the surviving row
        let result = sqlx::query(
            r#"
            INSERT INTO queue_jobs (id, queue_name, dedupe_key, visible_at, payload, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT (queue_name, dedupe_key) DO NOTHING
            "#,
        )
        .bind(&id)
        .bind(queue.as_str())
        .bind(&opts.dedupe_key)
        .bind(visible_at)
        .bind(&body)
        .bind(now.timestamp())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            if let Some(key) = &opts.dedupe_key {
                let row = sqlx::query(
                    "SELECT id FROM queue_jobs WHERE queue_name = ? AND dedupe_key = ?",
                )
                .bind(queue.as_str())
                .bind(key)
                .fetch_one(&self.pool)
                .await?;
                let id: String = row.get("id");
                debug!(
                    dedupe_key = %key,
                    queue = %queue,
                    job_id = %id,
                    "Duplicate enqueue detected, skipping"
                );
                return Ok(id);
            }
        }

        debug!(job_id = %id, queue = %queue, "Job enqueued");
        Ok(id)
    }

    async fn dequeue(&self, queue: QueueName) -> Result<Option<QueuedJob>> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(QueueError::Stopped);
        }

        let now = self.clock.now().timestamp();
        let new_visible_at = now + self.visibility_timeout_seconds as i64;

        let row = sqlx::query(
            r#"
            SELECT id, payload, receive_count
            FROM queue_jobs
            WHERE queue_name = ? AND visible_at <= ?
            ORDER BY created_at
            LIMIT 1
            "#,
        )
        .bind(queue.as_str())
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let id: String = row.get("id");
        let payload: String = row.get("payload");
        let receive_count: i64 = row.get("receive_count");

        // Claim by setting the receipt handle; the WHERE guard loses the
        // race cleanly if another worker grabbed the row first.
        let receipt_handle = self.generate_receipt_handle();
        let updated = sqlx::query(
            r#"
            UPDATE queue_jobs
            SET receipt_handle = ?, visible_at = ?, receive_count = receive_count + 1
            WHERE id = ? AND visible_at <= ?
            "#,
        )
        .bind(&receipt_handle)
        .bind(new_visible_at)
        .bind(&id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Ok(None);
        }

        let payload: JobPayload = serde_json::from_str(&payload)?;

        debug!(job_id = %id, queue = %queue, "Job claimed");

        Ok(Some(QueuedJob {
            id,
            queue,
            payload,
            receipt_handle,
            receive_count: receive_count as u32 + 1,
        }))
    }

    async fn ack(&self, receipt_handle: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM queue_jobs WHERE receipt_handle = ?")
            .bind(receipt_handle)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            warn!(
                receipt_handle = %receipt_handle,
                "ACK failed - job not found or already deleted"
            );
            return Err(QueueError::NotFound(receipt_handle.to_string()));
        }

        debug!(receipt_handle = %receipt_handle, "Job acknowledged");
        Ok(())
    }

    async fn nack(&self, receipt_handle: &str, delay: Duration) -> Result<()> {
        let new_visible_at = self.clock.now().timestamp() + delay.as_secs() as i64;

        let result = sqlx::query(
            r#"
            UPDATE queue_jobs
            SET visible_at = ?, receipt_handle = NULL
            WHERE receipt_handle = ?
            "#,
        )
        .bind(new_visible_at)
        .bind(receipt_handle)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            warn!(
                receipt_handle = %receipt_handle,
                "NACK failed - job not found"
            );
            return Err(QueueError::NotFound(receipt_handle.to_string()));
        }

        debug!(
            receipt_handle = %receipt_handle,
            delay_seconds = delay.as_secs(),
            "Job negative acknowledged"
        );
        Ok(())
    }

    async fn promote_due(&self) -> Result<u64> {
        let now = self.clock.now().timestamp();

        let result = sqlx::query(
            r#"
            UPDATE queue_jobs
            SET queue_name = ?
            WHERE queue_name = ? AND visible_at <= ? AND receipt_handle IS NULL
            "#,
        )
        .bind(QueueName::Immediate.as_str())
        .bind(QueueName::Delayed.as_str())
        .bind(now)
        .execute(&self.pool)
        .await?;

        let promoted = result.rows_affected();
        if promoted > 0 {
            debug!(count = promoted, "Promoted due delayed jobs");
        }
        Ok(promoted)
    }

    async fn stats(&self) -> Result<Vec<QueueStats>> {
        let now = self.clock.now().timestamp();
        let mut stats = Vec::with_capacity(QueueName::ALL.len());

        for queue in QueueName::ALL {
            let pending_row = sqlx::query(
                "SELECT COUNT(*) as count FROM queue_jobs WHERE queue_name = ? AND receipt_handle IS NULL AND (? = 'delayed' OR visible_at <= ?)",
            )
            .bind(queue.as_str())
            .bind(queue.as_str())
            .bind(now)
            .fetch_one(&self.pool)
            .await?;
            let pending: i64 = pending_row.get("count");

            let in_flight_row = sqlx::query(
                "SELECT COUNT(*) as count FROM queue_jobs WHERE queue_name = ? AND receipt_handle IS NOT NULL",
            )
            .bind(queue.as_str())
            .fetch_one(&self.pool)
            .await?;
            let in_flight: i64 = in_flight_row.get("count");

            stats.push(QueueStats {
                queue,
                pending: pending as u64,
                in_flight: in_flight as u64,
            });
        }

        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use nh_common::ManualClock;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn create_test_queue(clock: Arc<ManualClock>) -> SqliteJobQueue {
        let pool = SqlitePoolOptions::new()
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let queue = SqliteJobQueue::new(pool, 30, clock);
        queue.init_schema().await.unwrap();
        queue
    }

    fn manual_clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 1, 15, 12, 0, 0).unwrap(),
        ))
    }

    fn process_payload(id: &str) -> JobPayload {
        JobPayload::Process {
            notification_id: id.to_string(),
        }
    }

    #[tokio::test]
    async fn test_enqueue_and_dequeue() {
        let queue = create_test_queue(manual_clock()).await;

        queue
            .enqueue(
                QueueName::Immediate,
                process_payload("n-1"),
                EnqueueOptions::default(),
            )
            .await
            .unwrap();

        let job = queue.dequeue(QueueName::Immediate).await.unwrap().unwrap();
        assert_eq!(job.payload, process_payload("n-1"));
        assert_eq!(job.receive_count, 1);

        queue.ack(&job.receipt_handle).await.unwrap();

        assert!(queue.dequeue(QueueName::Immediate).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let clock = manual_clock();
        let queue = create_test_queue(clock.clone()).await;

        queue
            .enqueue(
                QueueName::Immediate,
                process_payload("first"),
                EnqueueOptions::default(),
            )
            .await
            .unwrap();
        clock.advance(chrono::Duration::seconds(1));
        queue
            .enqueue(
                QueueName::Immediate,
                process_payload("second"),
                EnqueueOptions::default(),
            )
            .await
            .unwrap();

        let job = queue.dequeue(QueueName::Immediate).await.unwrap().unwrap();
        assert_eq!(job.payload, process_payload("first"));
    }

    #[tokio::test]
    async fn test_visibility_timeout_redelivery() {
        let clock = manual_clock();
        let queue = create_test_queue(clock.clone()).await;

        queue
            .enqueue(
                QueueName::Retry,
                process_payload("n-1"),
                EnqueueOptions::default(),
            )
            .await
            .unwrap();

        let job = queue.dequeue(QueueName::Retry).await.unwrap().unwrap();
        // Claimed: invisible to other consumers
        assert!(queue.dequeue(QueueName::Retry).await.unwrap().is_none());

        // A crashed worker never acks; past the visibility timeout the
        // job is deliverable again with a bumped receive count.
        clock.advance(chrono::Duration::seconds(31));
        let redelivered = queue.dequeue(QueueName::Retry).await.unwrap().unwrap();
        assert_eq!(redelivered.id, job.id);
        assert_eq!(redelivered.receive_count, 2);
    }

    #[tokio::test]
    async fn test_nack_with_delay() {
        let clock = manual_clock();
        let queue = create_test_queue(clock.clone()).await;

        queue
            .enqueue(
                QueueName::Immediate,
                process_payload("n-1"),
                EnqueueOptions::default(),
            )
            .await
            .unwrap();

        let job = queue.dequeue(QueueName::Immediate).await.unwrap().unwrap();
        queue
            .nack(&job.receipt_handle, Duration::from_secs(60))
            .await
            .unwrap();

        assert!(queue.dequeue(QueueName::Immediate).await.unwrap().is_none());

        clock.advance(chrono::Duration::seconds(61));
        assert!(queue.dequeue(QueueName::Immediate).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_dedupe_key_idempotent() {
        let queue = create_test_queue(manual_clock()).await;

        let opts = EnqueueOptions {
            run_at: None,
            dedupe_key: Some("notif:n-1".to_string()),
        };
        let first = queue
            .enqueue(QueueName::Immediate, process_payload("n-1"), opts.clone())
            .await
            .unwrap();
        let second = queue
            .enqueue(QueueName::Immediate, process_payload("n-1"), opts)
            .await
            .unwrap();
        assert_eq!(first, second);

        queue.dequeue(QueueName::Immediate).await.unwrap().unwrap();
        assert!(queue.dequeue(QueueName::Immediate).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_concurrent_dedupe_enqueues_resolve_to_one_job() {
        let queue = create_test_queue(manual_clock()).await;

        let opts = EnqueueOptions {
            run_at: None,
            dedupe_key: Some("notif:n-1".to_string()),
        };
        // Interleaved enqueues with the same key must both succeed and
        // agree on the surviving job id
        let (a, b) = tokio::join!(
            queue.enqueue(QueueName::Immediate, process_payload("n-1"), opts.clone()),
            queue.enqueue(QueueName::Immediate, process_payload("n-1"), opts),
        );
        let a = a.unwrap();
        let b = b.unwrap();
        assert_eq!(a, b);

        queue.dequeue(QueueName::Immediate).await.unwrap().unwrap();
        assert!(queue.dequeue(QueueName::Immediate).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_scheduled_job_promotes_when_due() {
        let clock = manual_clock();
        let queue = create_test_queue(clock.clone()).await;

        let run_at = clock.now() + chrono::Duration::seconds(300);
        queue
            .enqueue(
                QueueName::Delayed,
                process_payload("n-1"),
                EnqueueOptions {
                    run_at: Some(run_at),
                    dedupe_key: None,
                },
            )
            .await
            .unwrap();

        // Not due yet: sits in delayed, nothing to promote
        assert_eq!(queue.promote_due().await.unwrap(), 0);
        assert!(queue.dequeue(QueueName::Immediate).await.unwrap().is_none());

        let stats = queue.stats().await.unwrap();
        let delayed = stats
            .iter()
            .find(|s| s.queue == QueueName::Delayed)
            .unwrap();
        assert_eq!(delayed.pending, 1);

        clock.advance(chrono::Duration::seconds(301));
        assert_eq!(queue.promote_due().await.unwrap(), 1);

        let job = queue.dequeue(QueueName::Immediate).await.unwrap().unwrap();
        assert_eq!(job.payload, process_payload("n-1"));
    }

    #[tokio::test]
    async fn test_stats_counts_in_flight() {
        let queue = create_test_queue(manual_clock()).await;

        queue
            .enqueue(
                QueueName::Escalation,
                JobPayload::Escalate {
                    notification_id: "n-1".to_string(),
                },
                EnqueueOptions::default(),
            )
            .await
            .unwrap();
        queue.dequeue(QueueName::Escalation).await.unwrap().unwrap();

        let stats = queue.stats().await.unwrap();
        let escalation = stats
            .iter()
            .find(|s| s.queue == QueueName::Escalation)
            .unwrap();
        assert_eq!(escalation.pending, 0);
        assert_eq!(escalation.in_flight, 1);
    }

    #[tokio::test]
    async fn test_stopped_queue_rejects_work() {
        let queue = create_test_queue(manual_clock()).await;
        queue.stop();
        assert!(matches!(
            queue
                .enqueue(
                    QueueName::Immediate,
                    process_payload("n-1"),
                    EnqueueOptions::default()
                )
                .await,
            Err(QueueError::Stopped)
        ));
    }
}
