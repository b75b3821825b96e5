//! SMS provider adapter.
//!
//! Provider-style HTTP POST: `{to, from, message}` with a bearer API key
//! resolved from the environment via `api_key_ref`.

use async_trait::async_trait;
use serde_json::json;
use std::time::Instant;
use tracing::debug;

use nh_common::{AdapterHealth, ChannelKind, Delivery, DeliveryOutcome, Rendered, SmsSettings};

use super::{classify_response, classify_transport_error, probe_url, ChannelAdapter, USER_AGENT};

pub struct SmsAdapter {
    settings: SmsSettings,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl SmsAdapter {
    pub fn new(settings: SmsSettings, client: reqwest::Client) -> Self {
        let api_key = settings
            .api_key_ref
            .as_ref()
            .and_then(|r| std::env::var(r).ok());
        Self {
            settings,
            api_key,
            client,
        }
    }
}

#[async_trait]
impl ChannelAdapter for SmsAdapter {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Sms
    }

    async fn send(&self, delivery: &Delivery, content: &Rendered) -> DeliveryOutcome {
        let payload = json!({
            "to": delivery.recipient,
            "from": self.settings.from_number,
            "message": content.body,
        });

        debug!(delivery_id = %delivery.id, "Sending sms");

        let mut request = self
            .client
            .post(&self.settings.api_url)
            .header("User-Agent", USER_AGENT)
            .json(&payload);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let started = Instant::now();
        match request.send().await {
            Ok(response) => classify_response(response, started),
            Err(e) => classify_transport_error(e, started),
        }
    }

    async fn probe(&self) -> AdapterHealth {
        probe_url(&self.client, ChannelKind::Sms, &self.settings.api_url).await
    }
}
