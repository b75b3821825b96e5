//! Microsoft Teams incoming-webhook adapter using Adaptive Cards.

use async_trait::async_trait;
use serde_json::json;
use std::time::Instant;
use tracing::debug;

use nh_common::{AdapterHealth, ChannelKind, Delivery, DeliveryOutcome, Rendered, TeamsSettings};

use super::{classify_response, classify_transport_error, probe_url, ChannelAdapter, USER_AGENT};

pub struct TeamsAdapter {
    settings: TeamsSettings,
    client: reqwest::Client,
}

impl TeamsAdapter {
    pub fn new(settings: TeamsSettings, client: reqwest::Client) -> Self {
        Self { settings, client }
    }

    fn build_card(&self, content: &Rendered) -> serde_json::Value {
        json!({
            "attachments": [{
                "contentType": "application/vnd.microsoft.card.adaptive",
                "content": {
                    "type": "AdaptiveCard",
                    "version": "1.4",
                    "body": [
                        {
                            "type": "TextBlock",
                            "text": content.subject,
                            "weight": "Bolder",
                            "size": "Large"
                        },
                        {
                            "type": "TextBlock",
                            "text": content.body,
                            "wrap": true,
                            "spacing": "Small"
                        }
                    ]
                }
            }]
        })
    }
}

#[async_trait]
impl ChannelAdapter for TeamsAdapter {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Teams
    }

    async fn send(&self, delivery: &Delivery, content: &Rendered) -> DeliveryOutcome {
        let card = self.build_card(content);

        debug!(delivery_id = %delivery.id, "Sending teams card");

        let started = Instant::now();
        let result = self
            .client
            .post(&self.settings.webhook_url)
            .header("User-Agent", USER_AGENT)
            .json(&card)
            .send()
            .await;

        match result {
            Ok(response) => classify_response(response, started),
            Err(e) => classify_transport_error(e, started),
        }
    }

    async fn probe(&self) -> AdapterHealth {
        probe_url(&self.client, ChannelKind::Teams, &self.settings.webhook_url).await
    }
}
