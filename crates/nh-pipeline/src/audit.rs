//! Audit sink
//!
//! Every lifecycle transition emits one audit event. Sinks are
//! fire-and-forget from the pipeline's point of view: a slow or failing
//! sink never blocks or fails a delivery.

use async_trait::async_trait;
use tracing::{info, warn};

use nh_common::AuditEvent;

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, event: AuditEvent);
}

/// Writes audit events as structured log lines.
pub struct LogAuditSink;

#[async_trait]
impl AuditSink for LogAuditSink {
    async fn record(&self, event: AuditEvent) {
        info!(
            audit_id = %event.id,
            notification_id = %event.notification_id,
            event = %event.event.as_str(),
            detail = event.detail.as_deref().unwrap_or(""),
            occurred_at = %event.occurred_at,
            "audit"
        );
    }
}

/// POSTs audit events to an external collector. The request is spawned so
/// the pipeline never waits on the collector; failures are logged and
/// dropped.
pub struct WebhookAuditSink {
    client: reqwest::Client,
    url: String,
}

impl WebhookAuditSink {
    pub fn new(url: String, client: reqwest::Client) -> Self {
        Self { client, url }
    }
}

#[async_trait]
impl AuditSink for WebhookAuditSink {
    async fn record(&self, event: AuditEvent) {
        let client = self.client.clone();
        let url = self.url.clone();
        tokio::spawn(async move {
            let event_id = event.id.clone();
            if let Err(e) = client.post(&url).json(&event).send().await {
                warn!(audit_id = %event_id, error = %e, "Audit webhook delivery failed");
            }
        });
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use nh_common::AuditEventKind;
    use wiremock::matchers::{body_partial_json, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_webhook_sink_posts_event() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(
                serde_json::json!({"notificationId": "n-1", "event": "escalated"}),
            ))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let sink = WebhookAuditSink::new(server.uri(), reqwest::Client::new());
        sink.record(AuditEvent::new(
            "n-1",
            AuditEventKind::Escalated,
            None,
            Utc::now(),
        ))
        .await;

        // The POST is spawned; give it a moment before the mock asserts
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }
}
