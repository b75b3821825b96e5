//! Generic signed webhook adapter.
//!
//! POSTs the rendered notification as JSON. When a signing secret is
//! configured the body is signed with HMAC-SHA256 over timestamp + body,
//! carried in the X-NOTIFYHUB-SIGNATURE / X-NOTIFYHUB-TIMESTAMP headers.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use std::time::{Duration, Instant};
use tracing::debug;

use nh_common::{AdapterHealth, ChannelKind, Delivery, DeliveryOutcome, Rendered, WebhookSettings};

use super::{
    classify_response, classify_transport_error, probe_url, sign_webhook, ChannelAdapter,
    SIGNATURE_HEADER, TIMESTAMP_HEADER, USER_AGENT,
};

pub struct WebhookAdapter {
    settings: WebhookSettings,
    client: reqwest::Client,
}

impl WebhookAdapter {
    pub fn new(settings: WebhookSettings, client: reqwest::Client) -> Self {
        Self { settings, client }
    }

    /// A recipient that is itself a URL overrides the configured endpoint.
    fn target_url<'a>(&'a self, recipient: &'a str) -> &'a str {
        if recipient.starts_with("http://") || recipient.starts_with("https://") {
            recipient
        } else {
            &self.settings.url
        }
    }
}

#[async_trait]
impl ChannelAdapter for WebhookAdapter {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Webhook
    }

    async fn send(&self, delivery: &Delivery, content: &Rendered) -> DeliveryOutcome {
        let url = self.target_url(&delivery.recipient);
        let payload = json!({
            "deliveryId": delivery.id,
            "notificationId": delivery.notification_id,
            "subject": content.subject,
            "body": content.body,
            "html": content.html,
        });
        let body = match serde_json::to_string(&payload) {
            Ok(b) => b,
            Err(e) => return DeliveryOutcome::permanent(None, 0, format!("payload encode: {e}")),
        };

        let mut request = self
            .client
            .post(url)
            .timeout(Duration::from_secs(self.settings.timeout_seconds))
            .header("Content-Type", "application/json")
            .header("User-Agent", USER_AGENT);

        if let Some(secret) = &self.settings.signing_secret {
            let (signature, timestamp) = sign_webhook(&body, secret, Utc::now());
            request = request
                .header(SIGNATURE_HEADER, signature)
                .header(TIMESTAMP_HEADER, timestamp);
        }

        debug!(delivery_id = %delivery.id, url = %url, "Sending webhook");

        let started = Instant::now();
        match request.body(body).send().await {
            Ok(response) => classify_response(response, started),
            Err(e) => classify_transport_error(e, started),
        }
    }

    async fn probe(&self) -> AdapterHealth {
        probe_url(&self.client, ChannelKind::Webhook, &self.settings.url).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hmac::{Hmac, Mac};
    use nh_common::{DeliveryStatus, OutcomeStatus};
    use sha2::Sha256;
    use wiremock::matchers::{header_exists, method, path};
    use wiremock::{Mock, MockServer, Request, ResponseTemplate};

    fn delivery_to(recipient: &str) -> Delivery {
        Delivery {
            id: "d-1".to_string(),
            notification_id: "n-1".to_string(),
            channel: ChannelKind::Webhook,
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

    fn rendered() -> Rendered {
        Rendered {
            subject: "Deploy failed".to_string(),
            body: "Pipeline 42 failed".to_string(),
            html: None,
        }
    }

    fn adapter(url: &str, secret: Option<&str>) -> WebhookAdapter {
        WebhookAdapter::new(
            WebhookSettings {
                url: url.to_string(),
                signing_secret: secret.map(|s| s.to_string()),
                timeout_seconds: 5,
            },
            reqwest::Client::new(),
        )
    }

    #[tokio::test]
    async fn test_2xx_is_delivered() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let adapter = adapter(&format!("{}/hook", server.uri()), None);
        let outcome = adapter.send(&delivery_to("ops"), &rendered()).await;
        assert_eq!(outcome.status, OutcomeStatus::Delivered);
        assert_eq!(outcome.provider_status, Some(200));
    }

    #[tokio::test]
    async fn test_5xx_is_retryable_and_4xx_is_permanent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/flaky"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/bad"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let flaky = adapter(&format!("{}/flaky", server.uri()), None);
        let outcome = flaky.send(&delivery_to("ops"), &rendered()).await;
        assert_eq!(outcome.status, OutcomeStatus::RetryableFailure);

        let bad = adapter(&format!("{}/bad", server.uri()), None);
        let outcome = bad.send(&delivery_to("ops"), &rendered()).await;
        assert_eq!(outcome.status, OutcomeStatus::PermanentFailure);
        assert_eq!(outcome.provider_status, Some(404));
    }

    #[tokio::test]
    async fn test_429_is_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "7"))
            .mount(&server)
            .await;

        let adapter = adapter(&server.uri(), None);
        let outcome = adapter.send(&delivery_to("ops"), &rendered()).await;
        assert_eq!(outcome.status, OutcomeStatus::RetryableFailure);
        assert!(outcome.error.unwrap().contains("retry after 7s"));
    }

    #[tokio::test]
    async fn test_connection_refused_is_retryable() {
        // Nothing listens on this port
        let adapter = adapter("http://127.0.0.1:1/hook", None);
        let outcome = adapter.send(&delivery_to("ops"), &rendered()).await;
        assert_eq!(outcome.status, OutcomeStatus::RetryableFailure);
    }

    #[tokio::test]
    async fn test_signature_headers_verify_against_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header_exists("X-NOTIFYHUB-SIGNATURE"))
            .and(header_exists("X-NOTIFYHUB-TIMESTAMP"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let adapter = adapter(&server.uri(), Some("s3cret"));
        let outcome = adapter.send(&delivery_to("ops"), &rendered()).await;
        assert!(outcome.is_success());

        // Recompute the signature server-side from the received request
        let request: Request = server.received_requests().await.unwrap().pop().unwrap();
        let signature = request.headers["X-NOTIFYHUB-SIGNATURE"].to_str().unwrap().to_string();
        let timestamp = request.headers["X-NOTIFYHUB-TIMESTAMP"].to_str().unwrap().to_string();

        let mut mac = Hmac::<Sha256>::new_from_slice(b"s3cret").unwrap();
        mac.update(timestamp.as_bytes());
        mac.update(&request.body);
        let expected = hex::encode(mac.finalize().into_bytes());
        assert_eq!(signature, expected);
    }

    #[tokio::test]
    async fn test_recipient_url_overrides_configured_endpoint() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/per-recipient"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let adapter = adapter("http://127.0.0.1:1/unused", None);
        let outcome = adapter
            .send(
                &delivery_to(&format!("{}/per-recipient", server.uri())),
                &rendered(),
            )
            .await;
        assert!(outcome.is_success());
    }
}
