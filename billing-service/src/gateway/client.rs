//! HTTP client for the GePG gateway and for origin-system callbacks.

use crate::config::GepgConfig;
use service_core::error::AppError;
use service_core::retry::{HttpCallError, RetryConfig, retry_http_call};
use std::time::Duration;

/// Client for outbound gateway requests.
///
/// One call is one attempt: retry policy lives with the job that issues the
/// request, so the ledger can record RETRYING between attempts.
#[derive(Clone)]
pub struct GatewayClient {
    client: reqwest::Client,
    config: GepgConfig,
}

impl GatewayClient {
    pub fn new(config: GepgConfig) -> Result<Self, AppError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| {
                AppError::InternalError(anyhow::anyhow!("Failed to build HTTP client: {}", e))
            })?;
        Ok(Self { client, config })
    }

    async fn post_xml(&self, url: &str, payload: &str) -> Result<String, HttpCallError> {
        let response = self
            .client
            .post(url)
            .header("Content-Type", "application/xml")
            .header("Gepg-Com", &self.config.com)
            .header("Gepg-Code", &self.config.code)
            .header("Gepg-Alg", &self.config.alg)
            .body(payload.to_string())
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        tracing::debug!(url = url, status = %status, body = %body, "Gateway response");

        if status.is_success() {
            Ok(body)
        } else {
            Err(HttpCallError::Status { status, body })
        }
    }

    /// POST a signed bill control-number request; returns the raw ack body.
    pub async fn send_bill_submission(&self, payload: &str) -> Result<String, HttpCallError> {
        self.post_xml(&self.config.submission_url, payload).await
    }

    /// POST a signed reconciliation request; returns the raw ack body.
    pub async fn send_reconciliation_request(
        &self,
        payload: &str,
    ) -> Result<String, HttpCallError> {
        self.post_xml(&self.config.reconciliation_url, payload).await
    }

    /// POST a signed bill cancellation request; returns the raw ack body.
    pub async fn send_cancellation_request(&self, payload: &str) -> Result<String, HttpCallError> {
        self.post_xml(&self.config.cancellation_url, payload).await
    }
}

/// Best-effort JSON forwarder for origin-system callbacks.
///
/// Forwarding failures only affect the ledger row of the triggering request,
/// never the bill or payment state, so a short retry budget is enough.
#[derive(Clone)]
pub struct CallbackForwarder {
    client: reqwest::Client,
    retry: RetryConfig,
}

impl CallbackForwarder {
    pub fn new(request_timeout_secs: u64) -> Result<Self, AppError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(request_timeout_secs))
            .build()
            .map_err(|e| {
                AppError::InternalError(anyhow::anyhow!("Failed to build HTTP client: {}", e))
            })?;
        Ok(Self {
            client,
            retry: RetryConfig::with_max_retries(2),
        })
    }

    /// POST a JSON payload to a registered callback URL.
    pub async fn forward(
        &self,
        url: &str,
        payload: &serde_json::Value,
    ) -> Result<(), HttpCallError> {
        retry_http_call(&self.retry, "forward_callback", || async {
            let response = self.client.post(url).json(payload).send().await?;
            let status = response.status();
            if status.is_success() {
                Ok(())
            } else {
                let body = response.text().await.unwrap_or_default();
                Err(HttpCallError::Status { status, body })
            }
        })
        .await
    }
}
