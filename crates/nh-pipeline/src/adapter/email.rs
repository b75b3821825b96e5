//! SMTP email adapter backed by lettre.
//!
//! SMTP acceptance maps to `Sent` (the relay accepted the message, final
//! delivery is not confirmed). Permanent SMTP rejections and unparseable
//! addresses are permanent failures; transient relay errors are retryable.

use async_trait::async_trait;
use lettre::message::{Mailbox, MultiPart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use std::time::Instant;
use tracing::{debug, error};

use nh_common::{AdapterHealth, ChannelKind, Delivery, DeliveryOutcome, EmailSettings, Rendered};

use super::ChannelAdapter;

pub struct EmailAdapter {
    settings: EmailSettings,
    transport: Option<AsyncSmtpTransport<Tokio1Executor>>,
}

impl EmailAdapter {
    pub fn new(settings: EmailSettings) -> Self {
        let transport = match build_transport(&settings) {
            Ok(t) => Some(t),
            Err(e) => {
                error!(smtp_host = %settings.smtp_host, error = %e, "Invalid SMTP configuration");
                None
            }
        };
        Self {
            settings,
            transport,
        }
    }
}

fn build_transport(
    settings: &EmailSettings,
) -> Result<AsyncSmtpTransport<Tokio1Executor>, lettre::transport::smtp::Error> {
    let mut builder = if settings.use_tls {
        AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&settings.smtp_host)?
    } else {
        AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&settings.smtp_host)
    };
    builder = builder.port(settings.smtp_port);

    // Password lives in the environment; the settings row only carries the
    // variable name.
    let password = settings
        .password_ref
        .as_ref()
        .and_then(|r| std::env::var(r).ok());
    if let (Some(username), Some(password)) = (settings.username.clone(), password) {
        builder = builder.credentials(Credentials::new(username, password));
    }

    Ok(builder.build())
}

#[async_trait]
impl ChannelAdapter for EmailAdapter {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Email
    }

    async fn send(&self, delivery: &Delivery, content: &Rendered) -> DeliveryOutcome {
        let Some(transport) = &self.transport else {
            return DeliveryOutcome::permanent(None, 0, "smtp transport not configured");
        };

        let to: Mailbox = match delivery.recipient.parse() {
            Ok(m) => m,
            Err(e) => {
                return DeliveryOutcome::permanent(
                    None,
                    0,
                    format!("invalid recipient address '{}': {e}", delivery.recipient),
                )
            }
        };
        let from: Mailbox = match self.settings.from_address.parse() {
            Ok(m) => m,
            Err(e) => {
                return DeliveryOutcome::permanent(None, 0, format!("invalid from address: {e}"))
            }
        };

        let builder = Message::builder()
            .from(from)
            .to(to)
            .subject(&content.subject);

        let message = match &content.html {
            Some(html) => builder.multipart(MultiPart::alternative_plain_html(
                content.body.clone(),
                html.clone(),
            )),
            None => builder.body(content.body.clone()),
        };
        let message = match message {
            Ok(m) => m,
            Err(e) => {
                return DeliveryOutcome::permanent(None, 0, format!("message build failed: {e}"))
            }
        };

        debug!(delivery_id = %delivery.id, recipient = %delivery.recipient, "Sending email");

        let started = Instant::now();
        match transport.send(message).await {
            Ok(_) => DeliveryOutcome::sent(started.elapsed().as_millis() as u64),
            Err(e) => {
                let latency_ms = started.elapsed().as_millis() as u64;
                if e.is_permanent() {
                    DeliveryOutcome::permanent(None, latency_ms, format!("smtp rejected: {e}"))
                } else {
                    DeliveryOutcome::retryable(None, latency_ms, format!("smtp error: {e}"))
                }
            }
        }
    }

    async fn probe(&self) -> AdapterHealth {
        let Some(transport) = &self.transport else {
            return AdapterHealth {
                channel: ChannelKind::Email,
                healthy: false,
                detail: Some("smtp transport not configured".to_string()),
                latency_ms: None,
            };
        };

        let started = Instant::now();
        match transport.test_connection().await {
            Ok(true) => AdapterHealth {
                channel: ChannelKind::Email,
                healthy: true,
                detail: None,
                latency_ms: Some(started.elapsed().as_millis() as u64),
            },
            Ok(false) => AdapterHealth {
                channel: ChannelKind::Email,
                healthy: false,
                detail: Some("smtp connection test failed".to_string()),
                latency_ms: Some(started.elapsed().as_millis() as u64),
            },
            Err(e) => AdapterHealth {
                channel: ChannelKind::Email,
                healthy: false,
                detail: Some(e.to_string()),
                latency_ms: Some(started.elapsed().as_millis() as u64),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nh_common::{DeliveryStatus, OutcomeStatus};

    fn adapter() -> EmailAdapter {
        EmailAdapter::new(EmailSettings {
            smtp_host: "localhost".to_string(),
            smtp_port: 2525,
            username: None,
            password_ref: None,
            from_address: "notifyhub@example.com".to_string(),
            use_tls: false,
        })
    }

    #[tokio::test]
    async fn test_invalid_recipient_is_permanent() {
        let delivery = Delivery {
            id: "d-1".to_string(),
            notification_id: "n-1".to_string(),
            channel: ChannelKind::Email,
            recipient: "not an email".to_string(),
            status: DeliveryStatus::Pending,
            attempt_count: 0,
            last_error: None,
            provider_status: None,
            latency_ms: None,
            first_attempted_at: None,
            last_attempted_at: None,
            completed_at: None,
        };
        let outcome = adapter()
            .send(
                &delivery,
                &Rendered {
                    subject: "s".to_string(),
                    body: "b".to_string(),
                    html: None,
                },
            )
            .await;
        assert_eq!(outcome.status, OutcomeStatus::PermanentFailure);
        assert!(outcome.error.unwrap().contains("invalid recipient"));
    }
}
