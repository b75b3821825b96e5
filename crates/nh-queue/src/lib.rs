//! NotifyHub Queue Manager
//!
//! Five named durable queues backed by SQLite with visibility-timeout
//! claim semantics (at-least-once delivery). Jobs carry a serde-tagged
//! payload identifying the pipeline work to perform.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use utoipa::ToSchema;

mod error;
mod sqlite;

pub use error::QueueError;
pub use sqlite::SqliteJobQueue;

pub type Result<T> = std::result::Result<T, QueueError>;

/// The five dispatch queues. Priority is expressed by queue choice;
/// ordering within a queue is FIFO.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum QueueName {
    Immediate,
    Delayed,
    Retry,
    Escalation,
    Batch,
}

impl QueueName {
    pub const ALL: [QueueName; 5] = [
        QueueName::Immediate,
        QueueName::Delayed,
        QueueName::Retry,
        QueueName::Escalation,
        QueueName::Batch,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::Immediate => "immediate",
            QueueName::Delayed => "delayed",
            QueueName::Retry => "retry",
            QueueName::Escalation => "escalation",
            QueueName::Batch => "batch",
        }
    }

    pub fn parse_str(s: &str) -> Option<Self> {
        match s {
            "immediate" => Some(QueueName::Immediate),
            "delayed" => Some(QueueName::Delayed),
            "retry" => Some(QueueName::Retry),
            "escalation" => Some(QueueName::Escalation),
            "batch" => Some(QueueName::Batch),
            _ => None,
        }
    }
}

impl std::fmt::Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Work item payload carried by a queued job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobPayload {
    /// Process a notification end to end (expand deliveries, send)
    Process { notification_id: String },
    /// Retry a single failed delivery
    RetryDelivery { delivery_id: String },
    /// Escalate an unresolved notification to the next level
    Escalate { notification_id: String },
}

/// Options controlling enqueue behavior
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// Earliest time the job becomes visible (scheduled delivery)
    pub run_at: Option<DateTime<Utc>>,
    /// Idempotency key; a second enqueue with the same key is a no-op
    pub dedupe_key: Option<String>,
}

/// A claimed job. The receipt handle must be passed back to `ack` or
/// `nack`; losing it means the job reappears after the visibility timeout.
#[derive(Debug, Clone)]
pub struct QueuedJob {
    pub id: String,
    pub queue: QueueName,
    pub payload: JobPayload,
    pub receipt_handle: String,
    pub receive_count: u32,
}

/// Per-queue depth snapshot
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct QueueStats {
    pub queue: QueueName,
    pub pending: u64,
    pub in_flight: u64,
}

/// Durable job queue contract. Implementations are injected wherever the
/// pipeline needs to enqueue or consume work.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Enqueue a job; returns the job id. Fails loudly when the backing
    /// store is unavailable.
    async fn enqueue(
        &self,
        queue: QueueName,
        payload: JobPayload,
        opts: EnqueueOptions,
    ) -> Result<String>;

    /// Non-blocking poll: claim the oldest visible job, if any.
    async fn dequeue(&self, queue: QueueName) -> Result<Option<QueuedJob>>;

    /// Delete a claimed job.
    async fn ack(&self, receipt_handle: &str) -> Result<()>;

    /// Release a claimed job, making it visible again after `delay`.
    async fn nack(&self, receipt_handle: &str, delay: Duration) -> Result<()>;

    /// Move delayed jobs whose run_at has elapsed into the immediate queue.
    /// Returns the number of jobs promoted.
    async fn promote_due(&self) -> Result<u64>;

    /// Pending/in-flight depth for every queue.
    async fn stats(&self) -> Result<Vec<QueueStats>>;
}
