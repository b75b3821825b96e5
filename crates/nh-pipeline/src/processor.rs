//! Notification Processor
//!
//! A bounded pool of workers drains the queues in priority order and drives
//! each notification through its state machine:
//! `queued -> processing -> {sent, partially_delivered, delivered, failed} | expired`.
//!
//! Workers re-read persisted state at every stage boundary and never carry
//! in-memory state across queue hops, so a crash mid-flight only costs a
//! visibility timeout, never a lost notification.

use chrono::Duration as ChronoDuration;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use nh_common::{
    AuditEvent, AuditEventKind, Clock, Delivery, DeliveryOutcome, DeliveryStatus, Notification,
    NotificationStatus, OutcomeStatus, Rendered,
};
use nh_queue::{EnqueueOptions, JobPayload, JobQueue, QueueName, QueuedJob};
use nh_store::{new_pending, Store};

use crate::adapter::AdapterRegistry;
use crate::audit::AuditSink;
use crate::escalation::{EscalationDecision, EscalationEngine};
use crate::template::{TemplateEngine, TemplateError};

/// Queues drained by each worker, highest priority first. The delayed queue
/// is not polled directly; due jobs are promoted into `immediate` by the
/// sweep loop.
const POLL_ORDER: [QueueName; 4] = [
    QueueName::Immediate,
    QueueName::Escalation,
    QueueName::Retry,
    QueueName::Batch,
];

/// Re-visibility delay when a job handler errors out.
const NACK_DELAY: Duration = Duration::from_secs(5);

/// Escalation sweep batch size.
const SWEEP_BATCH: u32 = 100;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Store(#[from] nh_store::StoreError),

    #[error(transparent)]
    Queue(#[from] nh_queue::QueueError),
}

/// Exponential backoff policy for retryable delivery failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(3600),
        }
    }
}

impl RetryPolicy {
    /// Delay before the retry that follows `attempt` (0-based):
    /// `base * 2^attempt`, capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let shift = attempt.min(32);
        let secs = self
            .base_delay
            .as_secs()
            .saturating_mul(1u64 << shift.min(63));
        Duration::from_secs(secs).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct ProcessorOptions {
    pub concurrency: usize,
    pub poll_interval: Duration,
    pub sweep_interval: Duration,
    pub promote_interval: Duration,
}

impl Default for ProcessorOptions {
    fn default() -> Self {
        Self {
            concurrency: 5,
            poll_interval: Duration::from_millis(250),
            sweep_interval: Duration::from_secs(5),
            promote_interval: Duration::from_secs(1),
        }
    }
}

/// Route a freshly persisted notification onto the right queue:
/// a future `scheduled_at` parks it on `delayed`, low priority goes to
/// `batch`, everything else is immediate.
pub async fn dispatch_notification(
    queue: &dyn JobQueue,
    notification: &Notification,
    now: chrono::DateTime<chrono::Utc>,
) -> Result<QueueName, nh_queue::QueueError> {
    let payload = JobPayload::Process {
        notification_id: notification.id.clone(),
    };
    let dedupe_key = Some(format!("process:{}", notification.id));

    let target = match notification.scheduled_at {
        Some(at) if at > now => {
            queue
                .enqueue(
                    QueueName::Delayed,
                    payload,
                    EnqueueOptions {
                        run_at: Some(at),
                        dedupe_key,
                    },
                )
                .await?;
            QueueName::Delayed
        }
        _ => {
            let target = if notification.priority == nh_common::NotificationPriority::Low {
                QueueName::Batch
            } else {
                QueueName::Immediate
            };
            queue
                .enqueue(
                    target,
                    payload,
                    EnqueueOptions {
                        run_at: None,
                        dedupe_key,
                    },
                )
                .await?;
            target
        }
    };

    debug!(notification_id = %notification.id, queue = %target, "Notification dispatched");
    Ok(target)
}

pub struct Processor {
    store: Store,
    queue: Arc<dyn JobQueue>,
    registry: Arc<AdapterRegistry>,
    templates: Arc<TemplateEngine>,
    escalation: Arc<EscalationEngine>,
    audit: Arc<dyn AuditSink>,
    retry: RetryPolicy,
    options: ProcessorOptions,
    clock: Arc<dyn Clock>,
    running: AtomicBool,
}

impl Processor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Store,
        queue: Arc<dyn JobQueue>,
        registry: Arc<AdapterRegistry>,
        templates: Arc<TemplateEngine>,
        escalation: Arc<EscalationEngine>,
        audit: Arc<dyn AuditSink>,
        retry: RetryPolicy,
        options: ProcessorOptions,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            queue,
            registry,
            templates,
            escalation,
            audit,
            retry,
            options,
            clock,
            running: AtomicBool::new(true),
        }
    }

    /// Spawn the worker pool and the sweep loop.
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::with_capacity(self.options.concurrency + 2);

        for worker_id in 0..self.options.concurrency {
            let processor = Arc::clone(self);
            handles.push(tokio::spawn(async move {
                processor.worker_loop(worker_id).await;
            }));
        }

        let processor = Arc::clone(self);
        handles.push(tokio::spawn(async move {
            processor.promote_loop().await;
        }));

        let processor = Arc::clone(self);
        handles.push(tokio::spawn(async move {
            processor.sweep_loop().await;
        }));

        info!(workers = self.options.concurrency, "Processor started");
        handles
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        info!("Processor stopping");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn worker_loop(&self, worker_id: usize) {
        debug!(worker_id, "Worker started");
        while self.is_running() {
            match self.poll_once().await {
                Ok(true) => {}
                Ok(false) => tokio::time::sleep(self.options.poll_interval).await,
                Err(e) => {
                    warn!(worker_id, error = %e, "Worker poll failed");
                    tokio::time::sleep(self.options.poll_interval).await;
                }
            }
        }
        debug!(worker_id, "Worker stopped");
    }

    async fn promote_loop(&self) {
        while self.is_running() {
            if let Err(e) = self.promote_once().await {
                warn!(error = %e, "Delayed-job promotion failed");
            }
            tokio::time::sleep(self.options.promote_interval).await;
        }
    }

    async fn sweep_loop(&self) {
        while self.is_running() {
            if let Err(e) = self.sweep_once().await {
                warn!(error = %e, "Sweep failed");
            }
            tokio::time::sleep(self.options.sweep_interval).await;
        }
    }

    /// Move delayed jobs whose run time has passed into the immediate queue.
    pub async fn promote_once(&self) -> Result<(), PipelineError> {
        self.queue.promote_due().await?;
        Ok(())
    }

    /// Claim and handle at most one job, highest-priority queue first.
    /// Returns whether any work was done.
    pub async fn poll_once(&self) -> Result<bool, PipelineError> {
        for queue in POLL_ORDER {
            let Some(job) = self.queue.dequeue(queue).await? else {
                continue;
            };

            match self.handle_job(&job).await {
                Ok(()) => self.queue.ack(&job.receipt_handle).await?,
                Err(e) => {
                    warn!(job_id = %job.id, error = %e, "Job failed, returning to queue");
                    self.queue.nack(&job.receipt_handle, NACK_DELAY).await?;
                }
            }
            return Ok(true);
        }
        Ok(false)
    }

    /// Enqueue escalation checks for unresolved notifications whose deadline
    /// passed. The dedupe key ties one enqueue to one (notification, level)
    /// pair.
    pub async fn sweep_once(&self) -> Result<(), PipelineError> {
        let now = self.clock.now();
        let due = self
            .store
            .notifications()
            .due_for_escalation(now, SWEEP_BATCH)
            .await?;
        for notification in due {
            self.queue
                .enqueue(
                    QueueName::Escalation,
                    JobPayload::Escalate {
                        notification_id: notification.id.clone(),
                    },
                    EnqueueOptions {
                        run_at: None,
                        dedupe_key: Some(format!(
                            "escalate:{}:{}",
                            notification.id, notification.escalation_level
                        )),
                    },
                )
                .await?;
        }
        Ok(())
    }

    pub async fn handle_job(&self, job: &QueuedJob) -> Result<(), PipelineError> {
        match &job.payload {
            JobPayload::Process { notification_id } => {
                self.process_notification(notification_id).await
            }
            JobPayload::RetryDelivery { delivery_id } => self.retry_delivery(delivery_id).await,
            JobPayload::Escalate { notification_id } => self.escalate(notification_id).await,
        }
    }

    async fn process_notification(&self, id: &str) -> Result<(), PipelineError> {
        let Some(notification) = self.store.notifications().get(id).await? else {
            warn!(notification_id = %id, "Process job for unknown notification");
            return Ok(());
        };

        if notification.status.is_terminal() {
            return Ok(());
        }

        if notification.status == NotificationStatus::Queued {
            if !self.store.notifications().claim(id).await? {
                // Lost the claim race; the winner drives this notification.
                debug!(notification_id = %id, "Claim lost");
                return Ok(());
            }
            self.audit(id, AuditEventKind::Claimed, None).await;
        }
        // A redelivered job finds the row already in `processing` and
        // resumes: delivery expansion and sends below are idempotent.

        let now = self.clock.now();
        if notification.is_expired(now) {
            self.expire(&notification).await?;
            return Ok(());
        }

        // Arm the escalation timer exactly once per notification
        if self.escalation.policy().enabled {
            let delay = ChronoDuration::from_std(self.escalation.policy().delay)
                .unwrap_or_else(|_| ChronoDuration::seconds(300));
            self.store
                .notifications()
                .schedule_escalation_if_unset(id, now + delay)
                .await?;
        }

        // One delivery row per (recipient x channel), created only if absent
        for recipient in &notification.recipients {
            for channel in &notification.channels {
                self.store
                    .deliveries()
                    .insert_if_absent(&new_pending(id, *channel, recipient))
                    .await?;
            }
        }

        let deliveries = self.store.deliveries().list_for_notification(id).await?;
        for delivery in deliveries
            .iter()
            .filter(|d| d.status == DeliveryStatus::Pending)
        {
            self.attempt_delivery(&notification, delivery).await?;
        }

        self.finalize_if_complete(id).await
    }

    async fn retry_delivery(&self, delivery_id: &str) -> Result<(), PipelineError> {
        let Some(delivery) = self.store.deliveries().get(delivery_id).await? else {
            warn!(delivery_id = %delivery_id, "Retry job for unknown delivery");
            return Ok(());
        };
        if delivery.status.is_terminal() {
            return Ok(());
        }

        let Some(notification) = self
            .store
            .notifications()
            .get(&delivery.notification_id)
            .await?
        else {
            return Ok(());
        };

        if notification.status.is_terminal() {
            self.store
                .deliveries()
                .finalize(
                    delivery_id,
                    DeliveryStatus::Failed,
                    Some("notification reached terminal state"),
                    self.clock.now(),
                )
                .await?;
            return Ok(());
        }

        if notification.is_expired(self.clock.now()) {
            self.expire(&notification).await?;
            return Ok(());
        }

        self.attempt_delivery(&notification, &delivery).await?;
        self.finalize_if_complete(&notification.id).await
    }

    async fn escalate(&self, id: &str) -> Result<(), PipelineError> {
        let Some(notification) = self.store.notifications().get(id).await? else {
            return Ok(());
        };
        if notification.status.is_terminal() {
            return Ok(());
        }

        match self.escalation.evaluate(&notification) {
            EscalationDecision::Disabled => Ok(()),
            EscalationDecision::Exhausted => {
                // The level guard on the status update makes this terminal
                // write happen exactly once even across racing sweeps.
                if self
                    .store
                    .notifications()
                    .set_status(id, NotificationStatus::Failed)
                    .await?
                {
                    let now = self.clock.now();
                    for delivery in self.store.deliveries().list_for_notification(id).await? {
                        if !delivery.status.is_terminal() {
                            self.store
                                .deliveries()
                                .finalize(
                                    &delivery.id,
                                    DeliveryStatus::Failed,
                                    Some("escalation exhausted"),
                                    now,
                                )
                                .await?;
                        }
                    }
                    self.store.notifications().clear_escalation_schedule(id).await?;
                    self.audit(
                        id,
                        AuditEventKind::EscalationExhausted,
                        Some(format!("level {}", notification.escalation_level)),
                    )
                    .await;
                }
                Ok(())
            }
            EscalationDecision::Escalate {
                next_level,
                recipients,
                delay,
            } => {
                let now = self.clock.now();
                let next_at =
                    now + ChronoDuration::from_std(delay).unwrap_or_else(|_| ChronoDuration::seconds(300));
                if !self
                    .store
                    .notifications()
                    .advance_escalation(id, notification.escalation_level, now, Some(next_at))
                    .await?
                {
                    // A concurrent sweep already advanced this level
                    return Ok(());
                }

                if !recipients.is_empty() {
                    self.store
                        .notifications()
                        .append_recipients(id, &recipients)
                        .await?;
                }

                self.audit(
                    id,
                    AuditEventKind::Escalated,
                    Some(format!("level {next_level}")),
                )
                .await;

                // Re-process to expand and send deliveries for the broadened
                // audience.
                self.queue
                    .enqueue(
                        QueueName::Immediate,
                        JobPayload::Process {
                            notification_id: id.to_string(),
                        },
                        EnqueueOptions {
                            run_at: None,
                            dedupe_key: Some(format!("process:{id}:level{next_level}")),
                        },
                    )
                    .await?;
                Ok(())
            }
        }
    }

    async fn attempt_delivery(
        &self,
        notification: &Notification,
        delivery: &Delivery,
    ) -> Result<(), PipelineError> {
        let content = match self.resolve_content(notification, delivery).await {
            Ok(content) => content,
            Err(e) => {
                // Template errors are permanent for this delivery
                let outcome = DeliveryOutcome::permanent(None, 0, e.to_string());
                self.store
                    .deliveries()
                    .record_attempt(&delivery.id, DeliveryStatus::Failed, &outcome, self.clock.now())
                    .await?;
                self.audit(
                    &notification.id,
                    AuditEventKind::DeliveryFailed,
                    Some(format!("{} to {}: {e}", delivery.channel, delivery.recipient)),
                )
                .await;
                return Ok(());
            }
        };

        let outcome = match self.registry.get(delivery.channel) {
            Some(adapter) => adapter.send(delivery, &content).await,
            None => DeliveryOutcome::permanent(
                None,
                0,
                format!("channel '{}' is not configured or disabled", delivery.channel),
            ),
        };

        let now = self.clock.now();
        match outcome.status {
            OutcomeStatus::Sent => {
                self.store
                    .deliveries()
                    .record_attempt(&delivery.id, DeliveryStatus::Sent, &outcome, now)
                    .await?;
                self.audit(
                    &notification.id,
                    AuditEventKind::DeliveryAttempted,
                    Some(format!("{} to {}: sent", delivery.channel, delivery.recipient)),
                )
                .await;
            }
            OutcomeStatus::Delivered => {
                self.store
                    .deliveries()
                    .record_attempt(&delivery.id, DeliveryStatus::Delivered, &outcome, now)
                    .await?;
                self.audit(
                    &notification.id,
                    AuditEventKind::DeliveryAttempted,
                    Some(format!(
                        "{} to {}: delivered",
                        delivery.channel, delivery.recipient
                    )),
                )
                .await;
            }
            OutcomeStatus::RetryableFailure => {
                // attempt_count is pre-increment here; this send is attempt
                // attempt_count + 1 of max_attempts
                let attempts_made = delivery.attempt_count + 1;
                if attempts_made < notification.max_attempts() {
                    self.store
                        .deliveries()
                        .record_attempt(&delivery.id, DeliveryStatus::Retrying, &outcome, now)
                        .await?;
                    let delay = self.retry.delay_for_attempt(delivery.attempt_count);
                    let run_at = now
                        + ChronoDuration::from_std(delay)
                            .unwrap_or_else(|_| ChronoDuration::seconds(30));
                    self.queue
                        .enqueue(
                            QueueName::Retry,
                            JobPayload::RetryDelivery {
                                delivery_id: delivery.id.clone(),
                            },
                            EnqueueOptions {
                                run_at: Some(run_at),
                                dedupe_key: Some(format!(
                                    "retry:{}:{}",
                                    delivery.id, attempts_made
                                )),
                            },
                        )
                        .await?;
                    self.audit(
                        &notification.id,
                        AuditEventKind::Retried,
                        Some(format!(
                            "{} to {}: attempt {attempts_made}, retry in {}s",
                            delivery.channel,
                            delivery.recipient,
                            delay.as_secs()
                        )),
                    )
                    .await;
                } else {
                    self.store
                        .deliveries()
                        .record_attempt(&delivery.id, DeliveryStatus::Failed, &outcome, now)
                        .await?;
                    self.audit(
                        &notification.id,
                        AuditEventKind::DeliveryFailed,
                        Some(format!(
                            "{} to {}: retries exhausted after {attempts_made} attempts",
                            delivery.channel, delivery.recipient
                        )),
                    )
                    .await;
                }
            }
            OutcomeStatus::PermanentFailure => {
                self.store
                    .deliveries()
                    .record_attempt(&delivery.id, DeliveryStatus::Failed, &outcome, now)
                    .await?;
                self.audit(
                    &notification.id,
                    AuditEventKind::DeliveryFailed,
                    Some(format!(
                        "{} to {}: {}",
                        delivery.channel,
                        delivery.recipient,
                        outcome.error.as_deref().unwrap_or("permanent failure")
                    )),
                )
                .await;
            }
        }
        Ok(())
    }

    async fn resolve_content(
        &self,
        notification: &Notification,
        delivery: &Delivery,
    ) -> Result<Rendered, TemplateError> {
        match &notification.template_name {
            Some(name) => {
                self.templates
                    .render(name, &notification.variables, delivery.channel)
                    .await
            }
            None => Ok(Rendered {
                subject: notification.title.clone(),
                body: notification.message.clone(),
                html: notification.html_message.clone(),
            }),
        }
    }

    /// Recompute the aggregate status once every delivery is terminal. The
    /// guarded UPDATE keeps this a single-writer transition, so the
    /// completion audit event fires exactly once.
    async fn finalize_if_complete(&self, id: &str) -> Result<(), PipelineError> {
        let summary = self.store.deliveries().summary(id).await?;
        if !summary.all_terminal() {
            return Ok(());
        }

        let status = if summary.all_failed() {
            NotificationStatus::Failed
        } else if summary.failed > 0 {
            NotificationStatus::PartiallyDelivered
        } else if summary.delivered > 0 {
            NotificationStatus::Delivered
        } else {
            NotificationStatus::Sent
        };

        if self.store.notifications().set_status(id, status).await? {
            self.store.notifications().clear_escalation_schedule(id).await?;
            self.audit(
                id,
                AuditEventKind::Completed,
                Some(status.as_str().to_string()),
            )
            .await;
            info!(notification_id = %id, status = %status.as_str(), "Notification completed");
        }
        Ok(())
    }

    async fn expire(&self, notification: &Notification) -> Result<(), PipelineError> {
        let id = &notification.id;
        if self
            .store
            .notifications()
            .set_status(id, NotificationStatus::Expired)
            .await?
        {
            let now = self.clock.now();
            for delivery in self.store.deliveries().list_for_notification(id).await? {
                if !delivery.status.is_terminal() {
                    self.store
                        .deliveries()
                        .finalize(
                            &delivery.id,
                            DeliveryStatus::Failed,
                            Some("notification expired"),
                            now,
                        )
                        .await?;
                }
            }
            self.store.notifications().clear_escalation_schedule(id).await?;
            self.audit(id, AuditEventKind::Expired, None).await;
            info!(notification_id = %id, "Notification expired before delivery");
        }
        Ok(())
    }

    async fn audit(&self, notification_id: &str, kind: AuditEventKind, detail: Option<String>) {
        self.audit
            .record(AuditEvent::new(
                notification_id,
                kind,
                detail,
                self.clock.now(),
            ))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::ChannelAdapter;
    use crate::audit::testing::CapturingAuditSink;
    use crate::escalation::EscalationPolicy;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use nh_common::{AdapterHealth, ChannelKind, ManualClock, NotificationPriority};
    use nh_queue::SqliteJobQueue;
    use parking_lot::Mutex;
    use sqlx::sqlite::SqlitePoolOptions;
    use std::collections::HashMap;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicU32;

    /// Adapter that plays back a script of outcomes, then keeps returning
    /// the last configured default.
    struct ScriptedAdapter {
        kind: ChannelKind,
        script: Mutex<VecDeque<DeliveryOutcome>>,
        default: DeliveryOutcome,
        sends: AtomicU32,
    }

    impl ScriptedAdapter {
        fn new(kind: ChannelKind, default: DeliveryOutcome) -> Self {
            Self {
                kind,
                script: Mutex::new(VecDeque::new()),
                default,
                sends: AtomicU32::new(0),
            }
        }

        fn push(&self, outcome: DeliveryOutcome) {
            self.script.lock().push_back(outcome);
        }

        fn sends(&self) -> u32 {
            self.sends.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ChannelAdapter for ScriptedAdapter {
        fn kind(&self) -> ChannelKind {
            self.kind
        }

        async fn send(&self, _delivery: &Delivery, _content: &Rendered) -> DeliveryOutcome {
            self.sends.fetch_add(1, Ordering::SeqCst);
            self.script
                .lock()
                .pop_front()
                .unwrap_or_else(|| self.default.clone())
        }

        async fn probe(&self) -> AdapterHealth {
            AdapterHealth {
                channel: self.kind,
                healthy: true,
                detail: None,
                latency_ms: Some(1),
            }
        }
    }

    struct Harness {
        processor: Arc<Processor>,
        store: Store,
        queue: Arc<SqliteJobQueue>,
        clock: Arc<ManualClock>,
        audit: Arc<CapturingAuditSink>,
    }

    async fn harness(adapters: Vec<Arc<ScriptedAdapter>>, policy: EscalationPolicy) -> Harness {
        let store_pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = Store::new(store_pool);
        store.init_schema().await.unwrap();

        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 1, 15, 12, 0, 0).unwrap(),
        ));

        let queue_pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let queue = Arc::new(SqliteJobQueue::new(queue_pool, 120, clock.clone()));
        queue.init_schema().await.unwrap();

        let mut registry = AdapterRegistry::new();
        for adapter in adapters {
            registry.register(adapter);
        }

        let templates = Arc::new(TemplateEngine::new(
            store.templates(),
            Duration::from_secs(300),
            clock.clone(),
        ));
        let audit = Arc::new(CapturingAuditSink::default());
        let processor = Arc::new(Processor::new(
            store.clone(),
            queue.clone(),
            Arc::new(registry),
            templates,
            Arc::new(EscalationEngine::new(policy)),
            audit.clone(),
            RetryPolicy {
                base_delay: Duration::from_secs(30),
                max_delay: Duration::from_secs(3600),
            },
            ProcessorOptions::default(),
            clock.clone(),
        ));

        Harness {
            processor,
            store,
            queue,
            clock,
            audit,
        }
    }

    fn notification(id: &str, recipients: &[&str], channels: &[ChannelKind]) -> Notification {
        Notification {
            id: id.to_string(),
            external_id: None,
            notification_type: "alert".to_string(),
            priority: NotificationPriority::High,
            title: "Deploy failed".to_string(),
            message: "Pipeline 42 failed".to_string(),
            html_message: None,
            template_name: None,
            variables: HashMap::new(),
            recipients: recipients.iter().map(|r| r.to_string()).collect(),
            channels: channels.to_vec(),
            created_at: Utc.with_ymd_and_hms(2026, 1, 15, 12, 0, 0).unwrap(),
            scheduled_at: None,
            expires_at: None,
            max_retries: 3,
            source_service: Some("ci".to_string()),
            source_tool: None,
            user_id: None,
            created_by: None,
            status: NotificationStatus::Queued,
            escalation_level: 0,
            escalated_at: None,
            next_escalation_at: None,
        }
    }

    async fn run_until_idle(h: &Harness) {
        while h.processor.poll_once().await.unwrap() {}
    }

    /// Drain everything, advancing the clock so scheduled retries become
    /// visible, until no queue has work left.
    async fn run_to_completion(h: &Harness, step: ChronoDuration, max_steps: u32) {
        for _ in 0..max_steps {
            run_until_idle(h).await;
            let stats = h.queue.stats().await.unwrap();
            let remaining: u64 = stats.iter().map(|s| s.pending + s.in_flight).sum();
            if remaining == 0 {
                return;
            }
            h.clock.advance(step);
            h.processor.promote_once().await.unwrap();
            h.processor.sweep_once().await.unwrap();
        }
        panic!("queues never drained");
    }

    fn no_escalation() -> EscalationPolicy {
        EscalationPolicy {
            enabled: false,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_all_deliveries_succeed_means_delivered() {
        let email = Arc::new(ScriptedAdapter::new(
            ChannelKind::Email,
            DeliveryOutcome::delivered(Some(200), 10),
        ));
        let h = harness(vec![email.clone()], no_escalation()).await;

        let n = notification("n-1", &["a@x.com", "b@x.com", "c@x.com", "d@x.com"], &[ChannelKind::Email]);
        h.store.notifications().insert(&n).await.unwrap();
        dispatch_notification(h.queue.as_ref(), &n, h.clock.now()).await.unwrap();

        run_until_idle(&h).await;

        let loaded = h.store.notifications().get("n-1").await.unwrap().unwrap();
        assert_eq!(loaded.status, NotificationStatus::Delivered);
        assert_eq!(email.sends(), 4);
        let summary = h.store.deliveries().summary("n-1").await.unwrap();
        assert_eq!(summary.delivered, 4);
    }

    #[tokio::test]
    async fn test_mixed_outcomes_mean_partially_delivered() {
        let email = Arc::new(ScriptedAdapter::new(
            ChannelKind::Email,
            DeliveryOutcome::delivered(Some(200), 10),
        ));
        // Deliveries run in (channel, recipient) order; the first recipient
        // fails permanently, the other three succeed.
        email.push(DeliveryOutcome::permanent(Some(550), 10, "mailbox unavailable"));
        let h = harness(vec![email.clone()], no_escalation()).await;

        let n = notification("n-1", &["a@x.com", "b@x.com", "c@x.com", "d@x.com"], &[ChannelKind::Email]);
        h.store.notifications().insert(&n).await.unwrap();
        dispatch_notification(h.queue.as_ref(), &n, h.clock.now()).await.unwrap();

        run_until_idle(&h).await;

        let loaded = h.store.notifications().get("n-1").await.unwrap().unwrap();
        assert_eq!(loaded.status, NotificationStatus::PartiallyDelivered);
        let summary = h.store.deliveries().summary("n-1").await.unwrap();
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.delivered, 3);
    }

    #[tokio::test]
    async fn test_max_retries_two_means_exactly_three_attempts() {
        let webhook = Arc::new(ScriptedAdapter::new(
            ChannelKind::Webhook,
            DeliveryOutcome::retryable(Some(503), 10, "unavailable"),
        ));
        let h = harness(vec![webhook.clone()], no_escalation()).await;

        let mut n = notification("n-1", &["https://client.example/hook"], &[ChannelKind::Webhook]);
        n.max_retries = 2;
        h.store.notifications().insert(&n).await.unwrap();
        dispatch_notification(h.queue.as_ref(), &n, h.clock.now()).await.unwrap();

        run_to_completion(&h, ChronoDuration::seconds(3600), 20).await;

        // max_retries = 2 bounds attempts at 3, no more, no less
        assert_eq!(webhook.sends(), 3);
        let loaded = h.store.notifications().get("n-1").await.unwrap().unwrap();
        assert_eq!(loaded.status, NotificationStatus::Failed);
        let deliveries = h.store.deliveries().list_for_notification("n-1").await.unwrap();
        assert_eq!(deliveries[0].attempt_count, 3);
        assert_eq!(deliveries[0].status, DeliveryStatus::Failed);
    }

    #[tokio::test]
    async fn test_retry_then_success() {
        let webhook = Arc::new(ScriptedAdapter::new(
            ChannelKind::Webhook,
            DeliveryOutcome::delivered(Some(200), 10),
        ));
        webhook.push(DeliveryOutcome::retryable(Some(500), 10, "boom"));
        let h = harness(vec![webhook.clone()], no_escalation()).await;

        let n = notification("n-1", &["https://client.example/hook"], &[ChannelKind::Webhook]);
        h.store.notifications().insert(&n).await.unwrap();
        dispatch_notification(h.queue.as_ref(), &n, h.clock.now()).await.unwrap();

        run_to_completion(&h, ChronoDuration::seconds(60), 10).await;

        assert_eq!(webhook.sends(), 2);
        let loaded = h.store.notifications().get("n-1").await.unwrap().unwrap();
        assert_eq!(loaded.status, NotificationStatus::Delivered);
    }

    #[tokio::test]
    async fn test_expired_before_claim_is_abandoned_with_no_deliveries() {
        let email = Arc::new(ScriptedAdapter::new(
            ChannelKind::Email,
            DeliveryOutcome::delivered(Some(200), 10),
        ));
        let h = harness(vec![email.clone()], no_escalation()).await;

        let mut n = notification("n-1", &["a@x.com"], &[ChannelKind::Email]);
        n.expires_at = Some(h.clock.now() + ChronoDuration::seconds(60));
        h.store.notifications().insert(&n).await.unwrap();
        dispatch_notification(h.queue.as_ref(), &n, h.clock.now()).await.unwrap();

        // The job sits in the queue past the expiry
        h.clock.advance(ChronoDuration::seconds(120));
        run_until_idle(&h).await;

        let loaded = h.store.notifications().get("n-1").await.unwrap().unwrap();
        assert_eq!(loaded.status, NotificationStatus::Expired);
        assert_eq!(email.sends(), 0);
        assert!(h.store.deliveries().list_for_notification("n-1").await.unwrap().is_empty());

        let events: Vec<_> = h.audit.events();
        assert!(events.iter().any(|e| e.event == AuditEventKind::Expired));
    }

    #[tokio::test]
    async fn test_scheduled_notification_waits_in_delayed_queue() {
        let email = Arc::new(ScriptedAdapter::new(
            ChannelKind::Email,
            DeliveryOutcome::delivered(Some(200), 10),
        ));
        let h = harness(vec![email.clone()], no_escalation()).await;

        let mut n = notification("n-1", &["a@x.com"], &[ChannelKind::Email]);
        n.scheduled_at = Some(h.clock.now() + ChronoDuration::seconds(600));
        h.store.notifications().insert(&n).await.unwrap();
        let target = dispatch_notification(h.queue.as_ref(), &n, h.clock.now()).await.unwrap();
        assert_eq!(target, QueueName::Delayed);

        // Before the scheduled time: visible in delayed stats, no work done
        run_until_idle(&h).await;
        assert_eq!(email.sends(), 0);
        let stats = h.queue.stats().await.unwrap();
        let delayed = stats.iter().find(|s| s.queue == QueueName::Delayed).unwrap();
        assert_eq!(delayed.pending, 1);

        // After the scheduled time the promote pass moves it to immediate
        // and a worker delivers
        h.clock.advance(ChronoDuration::seconds(601));
        h.processor.promote_once().await.unwrap();
        run_until_idle(&h).await;

        assert_eq!(email.sends(), 1);
        let loaded = h.store.notifications().get("n-1").await.unwrap().unwrap();
        assert_eq!(loaded.status, NotificationStatus::Delivered);
    }

    #[tokio::test]
    async fn test_low_priority_routes_to_batch_queue() {
        let email = Arc::new(ScriptedAdapter::new(
            ChannelKind::Email,
            DeliveryOutcome::delivered(Some(200), 10),
        ));
        let h = harness(vec![email], no_escalation()).await;

        let mut n = notification("n-1", &["a@x.com"], &[ChannelKind::Email]);
        n.priority = NotificationPriority::Low;
        h.store.notifications().insert(&n).await.unwrap();
        let target = dispatch_notification(h.queue.as_ref(), &n, h.clock.now()).await.unwrap();
        assert_eq!(target, QueueName::Batch);

        run_until_idle(&h).await;
        let loaded = h.store.notifications().get("n-1").await.unwrap().unwrap();
        assert_eq!(loaded.status, NotificationStatus::Delivered);
    }

    #[tokio::test]
    async fn test_unconfigured_channel_fails_permanently() {
        // No sms adapter registered
        let email = Arc::new(ScriptedAdapter::new(
            ChannelKind::Email,
            DeliveryOutcome::delivered(Some(200), 10),
        ));
        let h = harness(vec![email], no_escalation()).await;

        let n = notification("n-1", &["a@x.com"], &[ChannelKind::Email, ChannelKind::Sms]);
        h.store.notifications().insert(&n).await.unwrap();
        dispatch_notification(h.queue.as_ref(), &n, h.clock.now()).await.unwrap();

        run_until_idle(&h).await;

        let loaded = h.store.notifications().get("n-1").await.unwrap().unwrap();
        assert_eq!(loaded.status, NotificationStatus::PartiallyDelivered);
        let deliveries = h.store.deliveries().list_for_notification("n-1").await.unwrap();
        let sms = deliveries.iter().find(|d| d.channel == ChannelKind::Sms).unwrap();
        assert_eq!(sms.status, DeliveryStatus::Failed);
        assert!(sms.last_error.as_ref().unwrap().contains("not configured"));
    }

    #[tokio::test]
    async fn test_template_failure_is_permanent_and_skips_retry() {
        let email = Arc::new(ScriptedAdapter::new(
            ChannelKind::Email,
            DeliveryOutcome::delivered(Some(200), 10),
        ));
        let h = harness(vec![email.clone()], no_escalation()).await;

        let mut n = notification("n-1", &["a@x.com"], &[ChannelKind::Email]);
        n.template_name = Some("missing-template".to_string());
        h.store.notifications().insert(&n).await.unwrap();
        dispatch_notification(h.queue.as_ref(), &n, h.clock.now()).await.unwrap();

        run_until_idle(&h).await;

        // Adapter never invoked, delivery failed on the first pass
        assert_eq!(email.sends(), 0);
        let loaded = h.store.notifications().get("n-1").await.unwrap().unwrap();
        assert_eq!(loaded.status, NotificationStatus::Failed);
        let stats = h.queue.stats().await.unwrap();
        let retry = stats.iter().find(|s| s.queue == QueueName::Retry).unwrap();
        assert_eq!(retry.pending + retry.in_flight, 0);
    }

    #[tokio::test]
    async fn test_escalation_broadens_audience_then_exhausts_exactly_once() {
        let email = Arc::new(ScriptedAdapter::new(
            ChannelKind::Email,
            // Never succeeds, never permanent: stays unresolved via retries
            DeliveryOutcome::retryable(Some(500), 10, "down"),
        ));
        let policy = EscalationPolicy {
            enabled: true,
            delay: Duration::from_secs(300),
            max_levels: 2,
            level_recipients: vec![vec!["oncall@x.com".to_string()]],
        };
        let h = harness(vec![email.clone()], policy).await;

        let mut n = notification("n-1", &["ops@x.com"], &[ChannelKind::Email]);
        n.max_retries = nh_common::MAX_RETRY_CEILING; // keep it non-terminal long enough
        h.store.notifications().insert(&n).await.unwrap();
        dispatch_notification(h.queue.as_ref(), &n, h.clock.now()).await.unwrap();

        run_until_idle(&h).await;

        // First sweep after the delay: level 0 -> 1, audience broadened
        h.clock.advance(ChronoDuration::seconds(301));
        h.processor.sweep_once().await.unwrap();
        run_until_idle(&h).await;

        let loaded = h.store.notifications().get("n-1").await.unwrap().unwrap();
        assert_eq!(loaded.escalation_level, 1);
        assert!(loaded.recipients.contains(&"oncall@x.com".to_string()));
        assert_eq!(h.store.deliveries().list_for_notification("n-1").await.unwrap().len(), 2);

        // Second sweep: level 1 -> 2 (the cap)
        h.clock.advance(ChronoDuration::seconds(301));
        h.processor.sweep_once().await.unwrap();
        run_until_idle(&h).await;
        let loaded = h.store.notifications().get("n-1").await.unwrap().unwrap();
        assert_eq!(loaded.escalation_level, 2);

        // Third sweep: exhausted, notification fails
        h.clock.advance(ChronoDuration::seconds(301));
        h.processor.sweep_once().await.unwrap();
        run_until_idle(&h).await;

        let loaded = h.store.notifications().get("n-1").await.unwrap().unwrap();
        assert_eq!(loaded.status, NotificationStatus::Failed);
        assert!(loaded.next_escalation_at.is_none());

        // Exactly one exhaustion event, even after further sweeps
        h.clock.advance(ChronoDuration::seconds(301));
        h.processor.sweep_once().await.unwrap();
        run_until_idle(&h).await;
        let exhausted = h
            .audit
            .events()
            .iter()
            .filter(|e| e.event == AuditEventKind::EscalationExhausted)
            .count();
        assert_eq!(exhausted, 1);
    }

    #[test]
    fn test_backoff_is_monotonic_and_capped() {
        let policy = RetryPolicy {
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(3600),
        };
        let delays: Vec<_> = (0..12).map(|a| policy.delay_for_attempt(a)).collect();
        for pair in delays.windows(2) {
            assert!(pair[0] <= pair[1]);
        }
        assert_eq!(delays[0], Duration::from_secs(30));
        assert_eq!(delays[1], Duration::from_secs(60));
        assert_eq!(delays[11], Duration::from_secs(3600));
        // Huge attempt numbers never overflow
        assert_eq!(policy.delay_for_attempt(u32::MAX), Duration::from_secs(3600));
    }
}
