//! Slack incoming-webhook adapter.

use async_trait::async_trait;
use serde_json::json;
use std::time::Instant;
use tracing::debug;

use nh_common::{AdapterHealth, ChannelKind, Delivery, DeliveryOutcome, Rendered, SlackSettings};

use super::{classify_response, classify_transport_error, probe_url, ChannelAdapter, USER_AGENT};

pub struct SlackAdapter {
    settings: SlackSettings,
    client: reqwest::Client,
}

impl SlackAdapter {
    pub fn new(settings: SlackSettings, client: reqwest::Client) -> Self {
        Self { settings, client }
    }
}

#[async_trait]
impl ChannelAdapter for SlackAdapter {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Slack
    }

    async fn send(&self, delivery: &Delivery, content: &Rendered) -> DeliveryOutcome {
        // A '#channel' recipient overrides the configured default channel
        let channel = if delivery.recipient.starts_with('#') {
            Some(delivery.recipient.as_str())
        } else {
            self.settings.default_channel.as_deref()
        };

        let mut payload = json!({
            "text": format!("*{}*\n{}", content.subject, content.body),
        });
        if let Some(channel) = channel {
            payload["channel"] = json!(channel);
        }
        if let Some(username) = &self.settings.username {
            payload["username"] = json!(username);
        }

        debug!(delivery_id = %delivery.id, channel = ?channel, "Sending slack message");

        let started = Instant::now();
        let result = self
            .client
            .post(&self.settings.webhook_url)
            .header("User-Agent", USER_AGENT)
            .json(&payload)
            .send()
            .await;

        match result {
            Ok(response) => classify_response(response, started),
            Err(e) => classify_transport_error(e, started),
        }
    }

    async fn probe(&self) -> AdapterHealth {
        probe_url(&self.client, ChannelKind::Slack, &self.settings.webhook_url).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nh_common::{DeliveryStatus, OutcomeStatus};
    use wiremock::matchers::{body_partial_json, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn delivery_to(recipient: &str) -> Delivery {
        Delivery {
            id: "d-1".to_string(),
            notification_id: "n-1".to_string(),
            channel: ChannelKind::Slack,
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

    #[tokio::test]
    async fn test_recipient_channel_overrides_default() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"channel": "#incidents"})))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let adapter = SlackAdapter::new(
            SlackSettings {
                webhook_url: server.uri(),
                default_channel: Some("#alerts".to_string()),
                username: None,
            },
            reqwest::Client::new(),
        );

        let outcome = adapter
            .send(
                &delivery_to("#incidents"),
                &Rendered {
                    subject: "s".to_string(),
                    body: "b".to_string(),
                    html: None,
                },
            )
            .await;
        assert_eq!(outcome.status, OutcomeStatus::Delivered);
    }
}
