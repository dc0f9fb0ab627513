//! Document delivery collaborator.
//!
//! Rendering and delivering invoices and receipts is a black-box capability;
//! the engine only guarantees each delivery runs at most once per event key
//! (claimed through the store before calling in here).

use crate::config::DeliveryConfig;
use crate::models::{Bill, Customer, Payment};
use async_trait::async_trait;
use lettre::{
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
    message::Mailbox,
    transport::smtp::authentication::Credentials,
};
use secrecy::ExposeSecret;
use service_core::error::AppError;

#[async_trait]
pub trait DocumentDelivery: Send + Sync {
    /// Render and deliver the invoice for a bill with a fresh control number.
    async fn deliver_invoice(&self, bill: &Bill, customer: &Customer) -> Result<(), AppError>;

    /// Render and deliver the receipt for a settled payment.
    async fn deliver_receipt(
        &self,
        payment: &Payment,
        bill: &Bill,
        customer: &Customer,
    ) -> Result<(), AppError>;
}

/// Email-based delivery: a plain-text summary to the customer address.
pub struct EmailDelivery {
    config: DeliveryConfig,
    transport: Option<AsyncSmtpTransport<Tokio1Executor>>,
}

impl EmailDelivery {
    pub fn new(config: DeliveryConfig) -> Result<Self, anyhow::Error> {
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

    async fn send(&self, to: &str, subject: &str, body: String) -> Result<(), AppError> {
        let Some(transport) = self.transport.as_ref() else {
            tracing::debug!(to = to, subject = subject, "Document delivery suppressed (disabled)");
            return Ok(());
        };

        let from_mailbox: Mailbox = self
            .config
            .from_email
            .parse()
            .map_err(|e| AppError::InternalError(anyhow::anyhow!("Invalid from address: {}", e)))?;
        let to_mailbox: Mailbox = to
            .parse()
            .map_err(|e| AppError::BadRequest(anyhow::anyhow!("Invalid recipient: {}", e)))?;

        let email = Message::builder()
            .from(from_mailbox)
            .to(to_mailbox)
            .subject(subject)
            .body(body)
            .map_err(|e| AppError::InternalError(anyhow::anyhow!("Failed to build email: {}", e)))?;

        transport.send(email).await.map_err(|e| {
            AppError::InternalError(anyhow::anyhow!("Failed to send document email: {}", e))
        })?;

        Ok(())
    }
}

#[async_trait]
impl DocumentDelivery for EmailDelivery {
    async fn deliver_invoice(&self, bill: &Bill, customer: &Customer) -> Result<(), AppError> {
        let Some(email) = customer.email.as_deref() else {
            tracing::warn!(bill_id = %bill.bill_id, "No customer email; invoice not delivered");
            return Ok(());
        };

        let control_number = bill
            .control_number
            .map(|cn| cn.to_string())
            .unwrap_or_else(|| "-".to_string());

        let body = format!(
            "Dear {},\n\nYour bill {} has been issued.\n\nControl Number: {}\nAmount: {} {}\nExpires: {}\n\nPlease use the control number with any GePG payment channel.\n",
            customer.full_name(),
            bill.bill_id,
            control_number,
            bill.amount,
            bill.currency,
            bill.expiry_date.format("%Y-%m-%d"),
        );

        self.send(email, &format!("Invoice for bill {}", bill.bill_id), body)
            .await
    }

    async fn deliver_receipt(
        &self,
        payment: &Payment,
        bill: &Bill,
        customer: &Customer,
    ) -> Result<(), AppError> {
        let Some(email) = customer.email.as_deref() else {
            tracing::warn!(bill_id = %bill.bill_id, "No customer email; receipt not delivered");
            return Ok(());
        };

        let body = format!(
            "Dear {},\n\nPayment received for bill {}.\n\nReceipt: {}\nPaid: {} {}\nChannel: {}\nTransaction date: {}\n\nThank you.\n",
            customer.full_name(),
            bill.bill_id,
            payment.payref_id,
            payment.paid_amount,
            payment.currency,
            payment.pay_channel,
            payment.trx_date.format("%Y-%m-%d %H:%M:%S"),
        );

        self.send(
            email,
            &format!("Receipt for bill {}", bill.bill_id),
            body,
        )
        .await
    }
}

/// Log-only delivery for tests and unconfigured deployments.
pub struct NoopDelivery;

#[async_trait]
impl DocumentDelivery for NoopDelivery {
    async fn deliver_invoice(&self, bill: &Bill, _customer: &Customer) -> Result<(), AppError> {
        tracing::info!(bill_id = %bill.bill_id, "Invoice delivery (noop)");
        Ok(())
    }

    async fn deliver_receipt(
        &self,
        payment: &Payment,
        bill: &Bill,
        _customer: &Customer,
    ) -> Result<(), AppError> {
        tracing::info!(
            bill_id = %bill.bill_id,
            payref_id = %payment.payref_id,
            "Receipt delivery (noop)"
        );
        Ok(())
    }
}
