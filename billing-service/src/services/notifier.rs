//! Operator notification side channel.
//!
//! Gateway and processing failures are pushed to the configured operator
//! address. Notification is fire-and-forget: a failed send is logged, never
//! propagated to the flow that triggered it.

use crate::config::OperatorConfig;
use async_trait::async_trait;
use lettre::{
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
    message::Mailbox,
    transport::smtp::authentication::Credentials,
};
use secrecy::ExposeSecret;

#[async_trait]
pub trait OperatorNotifier: Send + Sync {
    async fn notify(&self, subject: &str, message: &str);
}

/// SMTP-backed notifier; inert when disabled by configuration.
pub struct SmtpNotifier {
    config: OperatorConfig,
    transport: Option<AsyncSmtpTransport<Tokio1Executor>>,
}

impl SmtpNotifier {
    pub fn new(config: OperatorConfig) -> Result<Self, anyhow::Error> {
        if !config.enabled {
            return Ok(Self {
                config,
                transport: None,
            });
        }

        let creds = Credentials::new(
            config.smtp_user.clone(),
            config.smtp_password.expose_secret().clone(),
        );

        let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.smtp_host)
            .map_err(|e| anyhow::anyhow!("Failed to create SMTP relay: {}", e))?
            .port(config.smtp_port)
            .credentials(creds)
            .build();

        Ok(Self {
            config,
            transport: Some(transport),
        })
    }
}

#[async_trait]
impl OperatorNotifier for SmtpNotifier {
    async fn notify(&self, subject: &str, message: &str) {
        let Some(transport) = self.transport.as_ref() else {
            tracing::debug!(subject = subject, "Operator notification suppressed (disabled)");
            return;
        };

        let email = match build_message(
            &self.config.from_email,
            &self.config.operator_email,
            subject,
            message,
        ) {
            Ok(email) => email,
            Err(e) => {
                tracing::error!(error = %e, "Failed to build operator notification");
                return;
            }
        };

        if let Err(e) = transport.send(email).await {
            tracing::error!(
                error = %e,
                subject = subject,
                "Failed to send operator notification"
            );
        } else {
            tracing::info!(subject = subject, "Operator notified");
        }
    }
}

fn build_message(
    from: &str,
    to: &str,
    subject: &str,
    body: &str,
) -> Result<Message, anyhow::Error> {
    let from_mailbox: Mailbox = from
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid from address: {}", e))?;
    let to_mailbox: Mailbox = to
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid operator address: {}", e))?;

    Message::builder()
        .from(from_mailbox)
        .to(to_mailbox)
        .subject(subject)
        .body(body.to_string())
        .map_err(|e| anyhow::anyhow!("Failed to build email: {}", e))
}

/// Log-only notifier for environments without an SMTP relay.
pub struct NoopNotifier;

#[async_trait]
impl OperatorNotifier for NoopNotifier {
    async fn notify(&self, subject: &str, message: &str) {
        tracing::warn!(subject = subject, message = message, "Operator notification");
    }
}
