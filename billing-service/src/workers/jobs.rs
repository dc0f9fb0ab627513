//! Job definitions and processors.
//!
//! Each job body is idempotent: at-least-once execution plus the store's
//! conditional operations give the correctness the protocol needs. Failure
//! classification: transport problems are transient (retried with backoff up
//! to the configured cap), protocol rejections and data errors are recorded
//! against the ledger, the operator is notified, and the job completes.

use crate::config::GepgConfig;
use crate::gateway::client::{CallbackForwarder, GatewayClient};
use crate::gateway::payload::{
    self, ControlNumberResponse, PaymentNotification,
};
use crate::gateway::signer::PayloadSigner;
use crate::models::{
    CancelStatus, LogStatus, PaymentGatewayLog, RequestType, RunStatus,
};
use crate::reconciliation;
use crate::services::delivery::DocumentDelivery;
use crate::services::notifier::OperatorNotifier;
use crate::services::store::{BillingStore, ControlNumberOutcome, PaymentOutcome};
use crate::workers::orchestrator::JobQueue;
use backoff::ExponentialBackoff;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use service_core::error::AppError;
use service_core::retry::{HttpCallError, is_retryable};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

const GATEWAY_ERROR_SUBJECT: &str = "Payment Gateway API Error";

#[derive(Debug, Clone)]
pub enum Job {
    SendControlNumberRequest { req_id: String, bill_id: String },
    SendCancellationRequest { req_id: String, bill_id: String },
    SendReconciliationRequest { req_id: String, trx_date: NaiveDate },
    ProcessControlNumberResponse { raw: String },
    ProcessCancellationResponse { raw: String },
    ProcessPaymentNotification { raw: String },
    ProcessReconciliationResponse { raw: String },
    AutoRepairRun { run_req_id: String },
    DeliverInvoice { bill_id: String, event_key: String },
    DeliverReceipt { bill_id: String, event_key: String },
}

impl Job {
    pub fn label(&self) -> &'static str {
        match self {
            Self::SendControlNumberRequest { .. } => "send_control_number_request",
            Self::SendCancellationRequest { .. } => "send_cancellation_request",
            Self::SendReconciliationRequest { .. } => "send_reconciliation_request",
            Self::ProcessControlNumberResponse { .. } => "process_control_number_response",
            Self::ProcessCancellationResponse { .. } => "process_cancellation_response",
            Self::ProcessPaymentNotification { .. } => "process_payment_notification",
            Self::ProcessReconciliationResponse { .. } => "process_reconciliation_response",
            Self::AutoRepairRun { .. } => "auto_repair_run",
            Self::DeliverInvoice { .. } => "deliver_invoice",
            Self::DeliverReceipt { .. } => "deliver_receipt",
        }
    }

    /// Retry policy per job family. Outbound gateway sends follow the
    /// configured base delay and attempt cap; local processing and delivery
    /// jobs retry briefly for infrastructure blips.
    pub fn retry_policy(&self, ctx: &JobContext) -> ExponentialBackoff {
        match self {
            Self::SendControlNumberRequest { .. }
            | Self::SendCancellationRequest { .. }
            | Self::SendReconciliationRequest { .. } => {
                let base = Duration::from_millis(ctx.gepg.retry_base_delay_ms.max(1));
                ExponentialBackoff {
                    initial_interval: base,
                    max_interval: base.saturating_mul(8),
                    multiplier: 2.0,
                    // Roughly max_retries attempts: 1 + 2 + 4 + ... intervals.
                    max_elapsed_time: Some(
                        base.saturating_mul(2u32.saturating_pow(ctx.gepg.max_retries)),
                    ),
                    ..Default::default()
                }
            }
            _ => ExponentialBackoff {
                initial_interval: Duration::from_millis(250),
                max_interval: Duration::from_secs(5),
                max_elapsed_time: Some(Duration::from_secs(30)),
                ..Default::default()
            },
        }
    }
}

#[derive(Debug)]
pub enum JobError {
    Transient(AppError),
    Permanent(AppError),
}

/// Database errors are treated as transient infrastructure blips.
fn db(e: AppError) -> JobError {
    JobError::Transient(e)
}

/// Everything a job body needs, cloned per worker.
#[derive(Clone)]
pub struct JobContext {
    pub store: Arc<dyn BillingStore>,
    pub gateway: GatewayClient,
    pub forwarder: CallbackForwarder,
    pub signer: Arc<dyn PayloadSigner>,
    pub notifier: Arc<dyn OperatorNotifier>,
    pub delivery: Arc<dyn DocumentDelivery>,
    pub gepg: GepgConfig,
    pub public_url: String,
    pub queue: JobQueue,
}

impl JobContext {
    pub async fn run(&self, job: &Job) -> Result<(), JobError> {
        match job {
            Job::SendControlNumberRequest { req_id, bill_id } => {
                self.send_control_number_request(req_id, bill_id).await
            }
            Job::SendCancellationRequest { req_id, bill_id } => {
                self.send_cancellation_request(req_id, bill_id).await
            }
            Job::SendReconciliationRequest { req_id, trx_date } => {
                self.send_reconciliation_request(req_id, *trx_date).await
            }
            Job::ProcessControlNumberResponse { raw } => {
                self.process_control_number_response(raw).await
            }
            Job::ProcessCancellationResponse { raw } => {
                self.process_cancellation_response(raw).await
            }
            Job::ProcessPaymentNotification { raw } => {
                self.process_payment_notification(raw).await
            }
            Job::ProcessReconciliationResponse { raw } => {
                self.process_reconciliation_response(raw).await
            }
            Job::AutoRepairRun { run_req_id } => self.auto_repair_run(run_req_id).await,
            Job::DeliverInvoice { bill_id, event_key } => {
                self.deliver_invoice(bill_id, event_key).await
            }
            Job::DeliverReceipt { bill_id, event_key } => {
                self.deliver_receipt(bill_id, event_key).await
            }
        }
    }

    /// Terminal bookkeeping once a job's retry budget is spent.
    pub async fn on_exhausted(&self, job: &Job, error: &AppError) {
        match job {
            Job::SendControlNumberRequest { req_id, bill_id } => {
                let desc = format!("Error sending bill control number request: {}", error);
                let _ = self
                    .store
                    .update_log_status(req_id, RequestType::ControlNumberRequest, LogStatus::Error, &desc)
                    .await;
                self.notifier
                    .notify(
                        GATEWAY_ERROR_SUBJECT,
                        &format!(
                            "Error sending bill control number request for request ID: {}, bill ID: {} - {}",
                            req_id, bill_id, error
                        ),
                    )
                    .await;
            }
            Job::SendCancellationRequest { req_id, bill_id } => {
                let desc = format!("Error sending bill cancellation request: {}", error);
                let _ = self
                    .store
                    .update_log_status(req_id, RequestType::CancellationRequest, LogStatus::Error, &desc)
                    .await;
                let _ = self
                    .store
                    .set_cancelled_status(bill_id, CancelStatus::Failed)
                    .await;
                self.notifier.notify(GATEWAY_ERROR_SUBJECT, &desc).await;
            }
            Job::SendReconciliationRequest { req_id, .. } => {
                let desc = format!("Error sending bill reconciliation request: {}", error);
                let _ = self
                    .store
                    .update_log_status(req_id, RequestType::ReconciliationRequest, LogStatus::Error, &desc)
                    .await;
                let _ = self
                    .store
                    .transition_run(
                        req_id,
                        &[RunStatus::Requested, RunStatus::Acked, RunStatus::Received],
                        RunStatus::Error,
                        Some(&desc),
                    )
                    .await;
                self.notifier.notify(GATEWAY_ERROR_SUBJECT, &desc).await;
            }
            _ => {
                self.notifier
                    .notify(
                        GATEWAY_ERROR_SUBJECT,
                        &format!("Job {} failed after retries: {}", job.label(), error),
                    )
                    .await;
            }
        }
    }

    async fn ledger_error_and_notify(
        &self,
        req_id: &str,
        req_type: RequestType,
        desc: &str,
    ) {
        if let Err(e) = self
            .store
            .update_log_status(req_id, req_type, LogStatus::Error, desc)
            .await
        {
            tracing::error!(error = %e, req_id = req_id, "Failed to update ledger row");
        }
        self.notifier.notify(GATEWAY_ERROR_SUBJECT, desc).await;
    }

    // ------------------------------------------------------------------
    // Outbound sends
    // ------------------------------------------------------------------

    async fn send_control_number_request(
        &self,
        req_id: &str,
        bill_id: &str,
    ) -> Result<(), JobError> {
        let bill = self
            .store
            .get_bill(bill_id)
            .await
            .map_err(db)?
            .ok_or_else(|| {
                JobError::Permanent(AppError::NotFound(anyhow::anyhow!(
                    "bill {} not found",
                    bill_id
                )))
            })?;
        let customer = self
            .store
            .get_customer(bill.customer_id)
            .await
            .map_err(db)?
            .ok_or_else(|| {
                JobError::Permanent(AppError::NotFound(anyhow::anyhow!(
                    "customer for bill {} not found",
                    bill_id
                )))
            })?;
        let dept = self
            .store
            .get_department(bill.dept_id)
            .await
            .map_err(db)?
            .ok_or_else(|| {
                JobError::Permanent(AppError::NotFound(anyhow::anyhow!(
                    "department for bill {} not found",
                    bill_id
                )))
            })?;
        let items = self.store.get_bill_items(bill_id).await.map_err(db)?;

        let request = payload::compose_bill_submission_request(
            req_id,
            &bill,
            &items,
            &customer,
            &dept.code,
            &self.gepg.provider_codes(),
            self.signer.as_ref(),
        )
        .map_err(JobError::Permanent)?;

        let mut log = PaymentGatewayLog::new(req_id, RequestType::ControlNumberRequest, Some(bill_id));
        log.req_data = Some(request.clone());
        let (_, created) = self.store.get_or_create_log(log).await.map_err(db)?;
        if !created {
            tracing::info!(
                req_id = req_id,
                "Ledger row for control number request already exists; skipping creation"
            );
        }

        tracing::info!(req_id = req_id, bill_id = bill_id, "Sending bill control number request");

        match self.gateway.send_bill_submission(&request).await {
            Ok(raw_ack) => {
                self.store
                    .set_log_req_ack(req_id, RequestType::ControlNumberRequest, &raw_ack)
                    .await
                    .map_err(db)?;

                let ack = match payload::parse_request_acknowledgement(&raw_ack) {
                    Ok(ack) => ack,
                    Err(e) => {
                        let desc = format!("Error processing acknowledgement response: {}", e);
                        self.ledger_error_and_notify(
                            req_id,
                            RequestType::ControlNumberRequest,
                            &desc,
                        )
                        .await;
                        return Ok(());
                    }
                };

                if ack.is_success() {
                    self.store
                        .update_log_status(
                            req_id,
                            RequestType::ControlNumberRequest,
                            LogStatus::Pending,
                            &format!(
                                "Bill control number request acknowledged: {}",
                                ack.ack_sts_desc
                            ),
                        )
                        .await
                        .map_err(db)?;
                    tracing::info!(
                        req_id = req_id,
                        ack_id = %ack.ack_id,
                        "Bill control number request acknowledged"
                    );
                    Ok(())
                } else {
                    self.ledger_error_and_notify(
                        req_id,
                        RequestType::ControlNumberRequest,
                        &format!(
                            "Bill control number request rejected: {} - {}",
                            ack.ack_sts_code, ack.ack_sts_desc
                        ),
                    )
                    .await;
                    Ok(())
                }
            }
            Err(e) => self
                .handle_send_failure(req_id, RequestType::ControlNumberRequest, e)
                .await,
        }
    }

    async fn send_reconciliation_request(
        &self,
        req_id: &str,
        trx_date: NaiveDate,
    ) -> Result<(), JobError> {
        let request = payload::compose_reconciliation_request(
            req_id,
            trx_date,
            &self.gepg.provider_codes(),
            self.signer.as_ref(),
        )
        .map_err(JobError::Permanent)?;

        let mut log = PaymentGatewayLog::new(req_id, RequestType::ReconciliationRequest, None);
        log.req_data = Some(request.clone());
        let (_, created) = self.store.get_or_create_log(log).await.map_err(db)?;
        if !created {
            tracing::info!(
                req_id = req_id,
                "Ledger row for reconciliation request already exists; skipping creation"
            );
        }

        tracing::info!(req_id = req_id, trx_date = %trx_date, "Sending reconciliation request");

        match self.gateway.send_reconciliation_request(&request).await {
            Ok(raw_ack) => {
                self.store
                    .set_log_req_ack(req_id, RequestType::ReconciliationRequest, &raw_ack)
                    .await
                    .map_err(db)?;

                let ack = match payload::parse_request_acknowledgement(&raw_ack) {
                    Ok(ack) => ack,
                    Err(e) => {
                        let desc =
                            format!("Error processing reconciliation request acknowledgement: {}", e);
                        self.store
                            .transition_run(
                                req_id,
                                &[RunStatus::Requested],
                                RunStatus::Error,
                                Some(&desc),
                            )
                            .await
                            .map_err(db)?;
                        self.ledger_error_and_notify(
                            req_id,
                            RequestType::ReconciliationRequest,
                            &desc,
                        )
                        .await;
                        return Ok(());
                    }
                };

                if ack.is_success() {
                    self.store
                        .update_log_status(
                            req_id,
                            RequestType::ReconciliationRequest,
                            LogStatus::Pending,
                            &ack.ack_sts_desc,
                        )
                        .await
                        .map_err(db)?;
                    self.store
                        .transition_run(
                            req_id,
                            &[RunStatus::Requested],
                            RunStatus::Acked,
                            Some(&ack.ack_sts_desc),
                        )
                        .await
                        .map_err(db)?;
                    tracing::info!(req_id = req_id, ack_id = %ack.ack_id, "Reconciliation request acknowledged");
                    Ok(())
                } else {
                    let desc = format!(
                        "Reconciliation request rejected: {} - {}",
                        ack.ack_sts_code, ack.ack_sts_desc
                    );
                    self.store
                        .transition_run(
                            req_id,
                            &[RunStatus::Requested],
                            RunStatus::Error,
                            Some(&desc),
                        )
                        .await
                        .map_err(db)?;
                    self.ledger_error_and_notify(req_id, RequestType::ReconciliationRequest, &desc)
                        .await;
                    Ok(())
                }
            }
            Err(e) => self
                .handle_send_failure(req_id, RequestType::ReconciliationRequest, e)
                .await,
        }
    }

    async fn send_cancellation_request(&self, req_id: &str, bill_id: &str) -> Result<(), JobError> {
        let cancelled = self
            .store
            .get_cancelled_bill(bill_id)
            .await
            .map_err(db)?
            .ok_or_else(|| {
                JobError::Permanent(AppError::NotFound(anyhow::anyhow!(
                    "cancellation record for bill {} not found",
                    bill_id
                )))
            })?;
        let bill = self
            .store
            .get_bill(bill_id)
            .await
            .map_err(db)?
            .ok_or_else(|| {
                JobError::Permanent(AppError::NotFound(anyhow::anyhow!(
                    "bill {} not found",
                    bill_id
                )))
            })?;

        let request = payload::compose_cancellation_request(
            req_id,
            &cancelled,
            &bill.group_bill_id,
            &self.gepg.provider_codes(),
            self.signer.as_ref(),
        )
        .map_err(JobError::Permanent)?;

        let mut log = PaymentGatewayLog::new(req_id, RequestType::CancellationRequest, Some(bill_id));
        log.req_data = Some(request.clone());
        self.store.get_or_create_log(log).await.map_err(db)?;

        match self.gateway.send_cancellation_request(&request).await {
            Ok(raw_ack) => {
                self.store
                    .set_log_req_ack(req_id, RequestType::CancellationRequest, &raw_ack)
                    .await
                    .map_err(db)?;

                let ack = match payload::parse_request_acknowledgement(&raw_ack) {
                    Ok(ack) => ack,
                    Err(e) => {
                        let desc = format!("Error processing cancellation acknowledgement: {}", e);
                        self.store
                            .set_cancelled_status(bill_id, CancelStatus::Failed)
                            .await
                            .map_err(db)?;
                        self.ledger_error_and_notify(req_id, RequestType::CancellationRequest, &desc)
                            .await;
                        return Ok(());
                    }
                };

                if ack.is_success() {
                    self.store
                        .update_log_status(
                            req_id,
                            RequestType::CancellationRequest,
                            LogStatus::Pending,
                            &format!("Bill cancellation request acknowledged: {}", ack.ack_sts_desc),
                        )
                        .await
                        .map_err(db)?;
                    Ok(())
                } else {
                    self.store
                        .set_cancelled_status(bill_id, CancelStatus::Failed)
                        .await
                        .map_err(db)?;
                    self.ledger_error_and_notify(
                        req_id,
                        RequestType::CancellationRequest,
                        &format!(
                            "Bill cancellation request rejected: {} - {}",
                            ack.ack_sts_code, ack.ack_sts_desc
                        ),
                    )
                    .await;
                    Ok(())
                }
            }
            Err(e) => self
                .handle_send_failure(req_id, RequestType::CancellationRequest, e)
                .await,
        }
    }

    /// Transport failures are marked RETRYING and bubbled as transient so
    /// the worker retries; permanent HTTP rejections are recorded as ERROR.
    async fn handle_send_failure(
        &self,
        req_id: &str,
        req_type: RequestType,
        error: HttpCallError,
    ) -> Result<(), JobError> {
        let desc = format!("Error sending {}: {}", req_type.description(), error);
        if is_retryable(&error) {
            self.store
                .update_log_status(req_id, req_type, LogStatus::Retrying, &desc)
                .await
                .map_err(db)?;
            tracing::warn!(req_id = req_id, error = %error, "Gateway send failed; will retry");
            Err(JobError::Transient(AppError::BadGateway(error.to_string())))
        } else {
            self.ledger_error_and_notify(req_id, req_type, &desc).await;
            Ok(())
        }
    }

    // ------------------------------------------------------------------
    // Inbound response processing
    // ------------------------------------------------------------------

    async fn process_control_number_response(&self, raw: &str) -> Result<(), JobError> {
        let response = match payload::parse_control_number_response(raw) {
            Ok(r) => r,
            Err(e) => {
                self.notifier
                    .notify(
                        GATEWAY_ERROR_SUBJECT,
                        &format!("Error parsing control number response: {}", e),
                    )
                    .await;
                return Err(JobError::Permanent(e));
            }
        };

        self.store
            .set_log_res_data(&response.req_id, RequestType::ControlNumberRequest, raw)
            .await
            .map_err(db)?;

        if response.res_sts_code != payload::ACK_SUCCESS_CODE {
            self.ledger_error_and_notify(
                &response.req_id,
                RequestType::ControlNumberRequest,
                &format!(
                    "Error processing control number request final response: {} - {}",
                    response.bill_sts_code, response.bill_sts_desc
                ),
            )
            .await;
            return Ok(());
        }

        self.assign_control_number(&response).await
    }

    async fn assign_control_number(
        &self,
        response: &ControlNumberResponse,
    ) -> Result<(), JobError> {
        let req_id = &response.req_id;

        let bill = match self
            .store
            .get_bill_by_group_id(&response.grp_bill_id)
            .await
            .map_err(db)?
        {
            Some(bill) => bill,
            None => {
                self.ledger_error_and_notify(
                    req_id,
                    RequestType::ControlNumberRequest,
                    &format!("Bill {} not found for control number response", response.grp_bill_id),
                )
                .await;
                return Ok(());
            }
        };

        let control_number: i64 = match response.cust_cntr_num.trim().parse() {
            Ok(cn) => cn,
            Err(_) => {
                self.ledger_error_and_notify(
                    req_id,
                    RequestType::ControlNumberRequest,
                    &format!("Malformed control number '{}'", response.cust_cntr_num),
                )
                .await;
                return Ok(());
            }
        };

        match self
            .store
            .set_control_number_if_unset(&bill.bill_id, control_number)
            .await
        {
            Ok(ControlNumberOutcome::Assigned) => {
                self.store
                    .update_log_status(
                        req_id,
                        RequestType::ControlNumberRequest,
                        LogStatus::Success,
                        &format!(
                            "Bill control number request processed successfully. Control Number: {}",
                            control_number
                        ),
                    )
                    .await
                    .map_err(db)?;
                tracing::info!(
                    bill_id = %bill.bill_id,
                    control_number = control_number,
                    "Control number assigned"
                );
            }
            Ok(ControlNumberOutcome::AlreadySet(existing)) => {
                // Duplicate delivery: a marker, never a state change.
                if existing == control_number {
                    tracing::warn!(
                        bill_id = %bill.bill_id,
                        control_number = control_number,
                        "Duplicate control number response ignored"
                    );
                } else {
                    tracing::warn!(
                        bill_id = %bill.bill_id,
                        existing = existing,
                        received = control_number,
                        "Conflicting control number response ignored"
                    );
                }
                return Ok(());
            }
            Err(AppError::Conflict(e)) => {
                self.ledger_error_and_notify(
                    req_id,
                    RequestType::ControlNumberRequest,
                    &format!("Control number conflict: {}", e),
                )
                .await;
                return Ok(());
            }
            Err(e) => return Err(db(e)),
        }

        // Invoice delivery, at most once per control number.
        let event_key = format!("auto:invoice_cn:{}", control_number);
        if self
            .store
            .claim_delivery_event(&event_key, "invoice", None)
            .await
            .map_err(db)?
        {
            if let Err(e) = self.queue.enqueue(Job::DeliverInvoice {
                bill_id: bill.bill_id.clone(),
                event_key: event_key.clone(),
            }) {
                tracing::error!(error = %e, event_key = %event_key, "Failed to enqueue invoice delivery");
            }
        }

        // Forward the control number to the origin system, best effort.
        if let Some(sys_id) = bill.sys_info_id {
            if let Some(sys) = self.store.get_system_info(sys_id).await.map_err(db)? {
                let body = serde_json::json!({
                    "req_id": req_id,
                    "bill_id": bill.bill_id,
                    "cntr_num": control_number,
                    "bill_print_url": format!("{}/bills/{}/print", self.public_url, bill.bill_id),
                });
                match self.forwarder.forward(&sys.cntrnum_response_callback, &body).await {
                    Ok(()) => {
                        self.store
                            .update_log_status(
                                req_id,
                                RequestType::ControlNumberRequest,
                                LogStatus::Success,
                                &format!("Control number {} sent to {}", control_number, sys.name),
                            )
                            .await
                            .map_err(db)?;
                    }
                    Err(e) => {
                        // Forwarding failure only degrades the ledger row.
                        tracing::error!(error = %e, system = %sys.name, "Control number forwarding failed");
                        self.store
                            .update_log_status(
                                req_id,
                                RequestType::ControlNumberRequest,
                                LogStatus::Error,
                                &format!(
                                    "Error sending control number {} to {}",
                                    control_number, sys.name
                                ),
                            )
                            .await
                            .map_err(db)?;
                    }
                }
            }
        }

        Ok(())
    }

    async fn process_cancellation_response(&self, raw: &str) -> Result<(), JobError> {
        let response = match payload::parse_cancellation_response(raw) {
            Ok(r) => r,
            Err(e) => {
                self.notifier
                    .notify(
                        GATEWAY_ERROR_SUBJECT,
                        &format!("Error parsing cancellation response: {}", e),
                    )
                    .await;
                return Err(JobError::Permanent(e));
            }
        };

        self.store
            .set_log_res_data(&response.req_id, RequestType::CancellationRequest, raw)
            .await
            .map_err(db)?;

        let bill = self
            .store
            .get_bill_by_group_id(&response.grp_bill_id)
            .await
            .map_err(db)?;
        let Some(bill) = bill else {
            self.ledger_error_and_notify(
                &response.req_id,
                RequestType::CancellationRequest,
                &format!("Bill {} not found for cancellation response", response.grp_bill_id),
            )
            .await;
            return Ok(());
        };

        if response.cancl_sts_code == payload::ACK_SUCCESS_CODE {
            self.store
                .set_cancelled_status(&bill.bill_id, CancelStatus::Cancelled)
                .await
                .map_err(db)?;
            self.store
                .update_log_status(
                    &response.req_id,
                    RequestType::CancellationRequest,
                    LogStatus::Success,
                    &format!("Bill {} cancelled: {}", bill.bill_id, response.cancl_sts_desc),
                )
                .await
                .map_err(db)?;
        } else {
            self.store
                .set_cancelled_status(&bill.bill_id, CancelStatus::Failed)
                .await
                .map_err(db)?;
            self.ledger_error_and_notify(
                &response.req_id,
                RequestType::CancellationRequest,
                &format!(
                    "Bill cancellation failed: {} - {}",
                    response.cancl_sts_code, response.cancl_sts_desc
                ),
            )
            .await;
        }

        Ok(())
    }

    async fn process_payment_notification(&self, raw: &str) -> Result<(), JobError> {
        let notification = match payload::parse_payment_notification(raw) {
            Ok(n) => n,
            Err(e) => {
                self.notifier
                    .notify(
                        GATEWAY_ERROR_SUBJECT,
                        &format!("Error parsing payment notification: {}", e),
                    )
                    .await;
                return Err(JobError::Permanent(e));
            }
        };

        let req_id = notification.req_id.clone();
        let req_type = RequestType::PaymentNotification;

        // Unsolicited inbound request: the callback handler already created
        // the ledger row; make sure the raw payload is attached.
        self.store
            .set_log_res_data(&req_id, req_type, raw)
            .await
            .map_err(db)?;

        let bill = match self
            .store
            .get_bill_by_group_id(&notification.grp_bill_id)
            .await
            .map_err(db)?
        {
            Some(bill) => bill,
            None => {
                self.ledger_error_and_notify(
                    &req_id,
                    req_type,
                    &format!("Bill {} not found for payment notification", notification.grp_bill_id),
                )
                .await;
                return Ok(());
            }
        };

        let payment = match build_payment(&bill.bill_id, &notification) {
            Ok(p) => p,
            Err(e) => {
                self.ledger_error_and_notify(
                    &req_id,
                    req_type,
                    &format!("Error processing payment response: {}", e),
                )
                .await;
                return Ok(());
            }
        };

        let payment = match self
            .store
            .create_payment_if_absent(payment)
            .await
            .map_err(db)?
        {
            PaymentOutcome::Created(payment) => payment,
            PaymentOutcome::AlreadyExists(existing) => {
                tracing::warn!(
                    bill_id = %bill.bill_id,
                    cust_cntr_num = existing.cust_cntr_num,
                    "Duplicate payment detected for control number: {}. Skipping processing...",
                    notification.cust_cntr_num
                );
                self.store
                    .update_log_status(
                        &req_id,
                        req_type,
                        LogStatus::Success,
                        "Duplicate payment notification ignored",
                    )
                    .await
                    .map_err(db)?;
                return Ok(());
            }
        };

        // Receipt delivery, at most once per gateway receipt.
        let event_key = format!("auto:receipt_payref:{}", payment.payref_id);
        if self
            .store
            .claim_delivery_event(&event_key, "receipt", None)
            .await
            .map_err(db)?
        {
            if let Err(e) = self.queue.enqueue(Job::DeliverReceipt {
                bill_id: bill.bill_id.clone(),
                event_key: event_key.clone(),
            }) {
                tracing::error!(error = %e, event_key = %event_key, "Failed to enqueue receipt delivery");
            }
        }

        // Forward payment details to the origin system.
        if let Some(sys_id) = bill.sys_info_id {
            if let Some(sys) = self.store.get_system_info(sys_id).await.map_err(db)? {
                let body = serde_json::json!({
                    "bill_id": bill.bill_id,
                    "cntr_num": payment.cust_cntr_num,
                    "psp_code": payment.psp_code,
                    "psp_name": payment.psp_name,
                    "trx_id": payment.trx_id,
                    "payref_id": payment.payref_id,
                    "bill_amt": payment.bill_amount.to_string(),
                    "paid_amt": payment.paid_amount.to_string(),
                    "paid_ccy": payment.currency,
                    "coll_acc_num": payment.coll_acc_num,
                    "trx_date": payment.trx_date.to_rfc3339(),
                    "pay_channel": payment.pay_channel,
                    "pyr_cell_num": payment.pyr_cell_num,
                    "bill_receipt_url":
                        format!("{}/bills/{}/receipt", self.public_url, bill.bill_id),
                });
                match self
                    .forwarder
                    .forward(&sys.pay_notification_callback, &body)
                    .await
                {
                    Ok(()) => {
                        self.store
                            .update_log_status(
                                &req_id,
                                req_type,
                                LogStatus::Success,
                                &format!("Payment notification sent to {}", sys.name),
                            )
                            .await
                            .map_err(db)?;
                    }
                    Err(e) => {
                        tracing::error!(error = %e, system = %sys.name, "Payment forwarding failed");
                        self.store
                            .update_log_status(
                                &req_id,
                                req_type,
                                LogStatus::Error,
                                &format!("Error sending payment notification to {}", sys.name),
                            )
                            .await
                            .map_err(db)?;
                    }
                }
                return Ok(());
            }
        }

        self.store
            .update_log_status(
                &req_id,
                req_type,
                LogStatus::Success,
                "Payment notification processed successfully",
            )
            .await
            .map_err(db)?;

        tracing::info!(
            req_id = %req_id,
            bill_id = %bill.bill_id,
            payref_id = %payment.payref_id,
            "Payment recorded"
        );
        Ok(())
    }

    async fn process_reconciliation_response(&self, raw: &str) -> Result<(), JobError> {
        let response = match payload::parse_reconciliation_response(raw) {
            Ok(r) => r,
            Err(e) => {
                self.notifier
                    .notify(
                        GATEWAY_ERROR_SUBJECT,
                        &format!("Error parsing reconciliation response: {}", e),
                    )
                    .await;
                return Err(JobError::Permanent(e));
            }
        };

        let req_id = response.req_id.clone();
        let req_type = RequestType::ReconciliationRequest;

        self.store
            .set_log_res_data(&req_id, req_type, raw)
            .await
            .map_err(db)?;

        match reconciliation::process_response(self.store.as_ref(), &response).await {
            Ok(outcome) if outcome.discarded => {
                // Late arrival after close: a warning, never an error.
                tracing::warn!(
                    req_id = %req_id,
                    "Late reconciliation response for closed run discarded"
                );
                Ok(())
            }
            Ok(outcome) => {
                self.store
                    .update_log_status(
                        &req_id,
                        req_type,
                        LogStatus::Success,
                        &format!(
                            "Bill reconciliation response processed successfully. {} reconciliation records.",
                            outcome.processed
                        ),
                    )
                    .await
                    .map_err(db)?;

                if let Err(e) = self.queue.enqueue(Job::AutoRepairRun {
                    run_req_id: req_id.clone(),
                }) {
                    tracing::error!(error = %e, req_id = %req_id, "Failed to enqueue auto-repair");
                }
                Ok(())
            }
            Err(e) => {
                let desc = format!("Error processing bill reconciliation response: {}", e);
                self.store
                    .transition_run(
                        &req_id,
                        &[RunStatus::Requested, RunStatus::Acked, RunStatus::Received],
                        RunStatus::Error,
                        Some(&desc),
                    )
                    .await
                    .map_err(db)?;
                self.ledger_error_and_notify(&req_id, req_type, &desc).await;
                Ok(())
            }
        }
    }

    async fn auto_repair_run(&self, run_req_id: &str) -> Result<(), JobError> {
        match reconciliation::auto_repair(self.store.as_ref(), run_req_id).await {
            Ok(outcome) => {
                if outcome.repaired > 0 {
                    tracing::info!(
                        run_req_id = run_req_id,
                        repaired = outcome.repaired,
                        rematched = outcome.rematched,
                        "Auto-repair completed"
                    );
                }
                Ok(())
            }
            // Terminal notification happens in on_exhausted.
            Err(e) => Err(JobError::Permanent(e)),
        }
    }

    // ------------------------------------------------------------------
    // Document deliveries (event key already claimed by the enqueuer)
    // ------------------------------------------------------------------

    async fn deliver_invoice(&self, bill_id: &str, event_key: &str) -> Result<(), JobError> {
        let bill = self
            .store
            .get_bill(bill_id)
            .await
            .map_err(db)?
            .ok_or_else(|| {
                JobError::Permanent(AppError::NotFound(anyhow::anyhow!(
                    "bill {} not found",
                    bill_id
                )))
            })?;
        let customer = self
            .store
            .get_customer(bill.customer_id)
            .await
            .map_err(db)?
            .ok_or_else(|| {
                JobError::Permanent(AppError::NotFound(anyhow::anyhow!(
                    "customer for bill {} not found",
                    bill_id
                )))
            })?;

        self.delivery
            .deliver_invoice(&bill, &customer)
            .await
            .map_err(JobError::Transient)?;

        tracing::info!(bill_id = bill_id, event_key = event_key, "Invoice delivered");
        Ok(())
    }

    async fn deliver_receipt(&self, bill_id: &str, event_key: &str) -> Result<(), JobError> {
        let bill = self
            .store
            .get_bill(bill_id)
            .await
            .map_err(db)?
            .ok_or_else(|| {
                JobError::Permanent(AppError::NotFound(anyhow::anyhow!(
                    "bill {} not found",
                    bill_id
                )))
            })?;
        let customer = self
            .store
            .get_customer(bill.customer_id)
            .await
            .map_err(db)?
            .ok_or_else(|| {
                JobError::Permanent(AppError::NotFound(anyhow::anyhow!(
                    "customer for bill {} not found",
                    bill_id
                )))
            })?;
        let payment = self
            .store
            .get_payment_for_bill(bill_id)
            .await
            .map_err(db)?
            .ok_or_else(|| {
                JobError::Permanent(AppError::NotFound(anyhow::anyhow!(
                    "payment for bill {} not found",
                    bill_id
                )))
            })?;

        self.delivery
            .deliver_receipt(&payment, &bill, &customer)
            .await
            .map_err(JobError::Transient)?;

        tracing::info!(bill_id = bill_id, event_key = event_key, "Receipt delivered");
        Ok(())
    }
}

/// Build an internal payment row from a parsed notification. Amount or date
/// parse failures are data errors surfaced to the ledger by the caller.
fn build_payment(
    bill_id: &str,
    notification: &PaymentNotification,
) -> Result<crate::models::Payment, anyhow::Error> {
    let cust_cntr_num: i64 = notification
        .cust_cntr_num
        .trim()
        .parse()
        .map_err(|_| anyhow::anyhow!("malformed control number '{}'", notification.cust_cntr_num))?;
    let bill_amount = Decimal::from_str(notification.bill_amt.trim())
        .map_err(|_| anyhow::anyhow!("malformed bill amount '{}'", notification.bill_amt))?;
    let paid_amount = Decimal::from_str(notification.paid_amt.trim())
        .map_err(|_| anyhow::anyhow!("malformed paid amount '{}'", notification.paid_amt))?;
    let trx_date = parse_trx_datetime(&notification.trx_dt_tm)
        .ok_or_else(|| anyhow::anyhow!("malformed transaction date '{}'", notification.trx_dt_tm))?;

    Ok(crate::models::Payment {
        payment_id: uuid::Uuid::new_v4(),
        bill_id: bill_id.to_string(),
        cust_cntr_num,
        psp_code: notification.psp_code.clone(),
        psp_name: notification.psp_name.clone(),
        trx_id: notification.trx_id.clone(),
        payref_id: notification.payref_id.clone(),
        bill_amount,
        paid_amount,
        currency: notification.ccy.clone(),
        coll_acc_num: notification.coll_acc_num.clone(),
        trx_date,
        pay_channel: notification.usd_pay_chnl.clone(),
        trdpty_trx_id: notification.trdpty_trx_id.clone(),
        pyr_name: none_if_empty(&notification.pyr_name),
        pyr_cell_num: none_if_empty(&notification.pyr_cell_num),
        pyr_email: none_if_empty(&notification.pyr_email),
        created_utc: Utc::now(),
    })
}

fn none_if_empty(s: &str) -> Option<String> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Gateway timestamps come as ISO-8601 with or without an offset.
pub fn parse_trx_datetime(s: &str) -> Option<DateTime<Utc>> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_trx_datetime_accepts_both_forms() {
        assert!(parse_trx_datetime("2024-03-15T10:30:00").is_some());
        assert!(parse_trx_datetime("2024-03-15T10:30:00+03:00").is_some());
        assert!(parse_trx_datetime("").is_none());
        assert!(parse_trx_datetime("not-a-date").is_none());
    }

    #[test]
    fn build_payment_rejects_malformed_amounts() {
        let notification = PaymentNotification {
            req_id: "R1".to_string(),
            grp_bill_id: "B1".to_string(),
            cust_cntr_num: "991234567890".to_string(),
            psp_code: "PSP".to_string(),
            psp_name: "Bank".to_string(),
            trx_id: "T1".to_string(),
            payref_id: "P1".to_string(),
            bill_amt: "not-money".to_string(),
            paid_amt: "100.00".to_string(),
            ccy: "TZS".to_string(),
            coll_acc_num: "123".to_string(),
            trx_dt_tm: "2024-03-15T10:30:00".to_string(),
            usd_pay_chnl: "MOBILE".to_string(),
            trdpty_trx_id: "TP1".to_string(),
            pyr_cell_num: "".to_string(),
            pyr_email: "".to_string(),
            pyr_name: "Payer".to_string(),
        };
        assert!(build_payment("B1", &notification).is_err());
    }
}
