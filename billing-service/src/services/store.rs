//! Persistence seam for the billing service.
//!
//! Every state-dependent mutation is exposed as a conditional operation
//! (assign-if-unset, create-if-absent, transition-from) so that racing
//! callback deliveries and retried jobs cannot read-modify-write past each
//! other. Two backends implement the trait: Postgres for deployments and an
//! in-memory store for tests and local runs.

use crate::models::{
    Bill, BillItem, BillingDepartment, CancelStatus, CancelledBill, Customer, IdempotencyRecord,
    LogStatus, MatchStatus, Payment, PaymentGatewayLog, PaymentReconciliation, ReconciliationRun,
    RequestType, RunStatus, SystemInfo,
};
use async_trait::async_trait;
use chrono::NaiveDate;
use service_core::error::AppError;
use uuid::Uuid;

/// Outcome of a conditional control-number assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlNumberOutcome {
    /// The control number was written to the bill.
    Assigned,
    /// The bill already carries this (or another) control number; the value
    /// is the one currently stored.
    AlreadySet(i64),
}

/// Outcome of a conditional payment creation.
#[derive(Debug, Clone)]
pub enum PaymentOutcome {
    Created(Payment),
    /// A payment for this `(bill, cust_cntr_num)` already exists; the second
    /// writer receives the existing row rather than a constraint error.
    AlreadyExists(Payment),
}

/// Outcome of recording an idempotent API submission.
#[derive(Debug, Clone)]
pub enum IdempotencyOutcome {
    Recorded,
    Existing(IdempotencyRecord),
}

#[async_trait]
pub trait BillingStore: Send + Sync {
    // ---- reference data ----
    async fn insert_department(&self, dept: BillingDepartment) -> Result<(), AppError>;
    async fn get_department(&self, dept_id: Uuid) -> Result<Option<BillingDepartment>, AppError>;
    async fn get_department_by_name(
        &self,
        name: &str,
    ) -> Result<Option<BillingDepartment>, AppError>;
    async fn insert_system_info(&self, info: SystemInfo) -> Result<(), AppError>;
    async fn get_system_info(&self, system_id: Uuid) -> Result<Option<SystemInfo>, AppError>;
    async fn get_system_info_by_code(&self, code: &str) -> Result<Option<SystemInfo>, AppError>;
    /// Get-or-create a customer by email, updating contact fields on match.
    async fn upsert_customer_by_email(&self, customer: Customer) -> Result<Customer, AppError>;
    async fn get_customer(&self, customer_id: Uuid) -> Result<Option<Customer>, AppError>;

    // ---- bills ----
    async fn insert_bill(&self, bill: Bill, items: Vec<BillItem>) -> Result<(), AppError>;
    /// Replace a bill's amounts and line items (edit / re-submission flow).
    async fn update_bill(&self, bill: Bill, items: Vec<BillItem>) -> Result<(), AppError>;
    async fn get_bill(&self, bill_id: &str) -> Result<Option<Bill>, AppError>;
    async fn get_bill_by_group_id(&self, group_bill_id: &str) -> Result<Option<Bill>, AppError>;
    async fn get_bill_items(&self, bill_id: &str) -> Result<Vec<BillItem>, AppError>;
    /// Write the control number exactly once. Globally unique: assigning a
    /// number already held by another bill is a conflict error.
    async fn set_control_number_if_unset(
        &self,
        bill_id: &str,
        control_number: i64,
    ) -> Result<ControlNumberOutcome, AppError>;
    /// Drop the control number ahead of requesting a fresh one (edit flow).
    async fn clear_control_number(&self, bill_id: &str) -> Result<(), AppError>;

    // ---- payments ----
    async fn create_payment_if_absent(&self, payment: Payment) -> Result<PaymentOutcome, AppError>;
    async fn get_payment_for_bill(&self, bill_id: &str) -> Result<Option<Payment>, AppError>;

    // ---- request ledger ----
    /// Create the ledger row for `(req_id, req_type)` unless it already
    /// exists. Returns the row and whether it was created by this call.
    async fn get_or_create_log(
        &self,
        log: PaymentGatewayLog,
    ) -> Result<(PaymentGatewayLog, bool), AppError>;
    async fn get_log(
        &self,
        req_id: &str,
        req_type: RequestType,
    ) -> Result<Option<PaymentGatewayLog>, AppError>;
    async fn update_log_status(
        &self,
        req_id: &str,
        req_type: RequestType,
        status: LogStatus,
        status_desc: &str,
    ) -> Result<(), AppError>;
    async fn set_log_req_ack(
        &self,
        req_id: &str,
        req_type: RequestType,
        raw: &str,
    ) -> Result<(), AppError>;
    async fn set_log_res_data(
        &self,
        req_id: &str,
        req_type: RequestType,
        raw: &str,
    ) -> Result<(), AppError>;
    async fn set_log_res_ack(
        &self,
        req_id: &str,
        req_type: RequestType,
        raw: &str,
    ) -> Result<(), AppError>;
    async fn latest_log_for_bill(
        &self,
        bill_id: &str,
    ) -> Result<Option<PaymentGatewayLog>, AppError>;
    async fn logs_with_status(&self, status: LogStatus)
        -> Result<Vec<PaymentGatewayLog>, AppError>;

    // ---- cancellations ----
    async fn upsert_cancelled_bill(&self, cancelled: CancelledBill) -> Result<(), AppError>;
    async fn get_cancelled_bill(&self, bill_id: &str) -> Result<Option<CancelledBill>, AppError>;
    async fn set_cancelled_status(
        &self,
        bill_id: &str,
        status: CancelStatus,
    ) -> Result<(), AppError>;

    // ---- reconciliation ----
    async fn insert_run(&self, run: ReconciliationRun) -> Result<(), AppError>;
    async fn get_run(&self, req_id: &str) -> Result<Option<ReconciliationRun>, AppError>;
    async fn latest_run_for_date(
        &self,
        trx_date: NaiveDate,
    ) -> Result<Option<ReconciliationRun>, AppError>;
    /// Whether the date already has a run that is not in ERROR state.
    async fn date_has_active_run(&self, trx_date: NaiveDate) -> Result<bool, AppError>;
    /// Atomically move a run from one of `from` to `to`. Returns false when
    /// the run is missing or not in an accepted source state (notably when
    /// it is already CLOSED).
    async fn transition_run(
        &self,
        req_id: &str,
        from: &[RunStatus],
        to: RunStatus,
        status_desc: Option<&str>,
    ) -> Result<bool, AppError>;
    /// Store aggregate totals; silently skipped when the run is CLOSED.
    async fn set_run_totals(
        &self,
        req_id: &str,
        reported_totals: &str,
        internal_totals: &str,
        totals_match: bool,
    ) -> Result<(), AppError>;
    /// Close a run. Without `force` only a PROCESSED run closes. Returns
    /// false when the precondition fails; true when closed (idempotently).
    async fn close_run(&self, req_id: &str, force: bool) -> Result<bool, AppError>;
    /// Upsert a settlement record by `payref_id`; skipped when the owning
    /// run is CLOSED.
    async fn upsert_reconciliation_record(
        &self,
        record: PaymentReconciliation,
    ) -> Result<(), AppError>;
    async fn get_reconciliation_record(
        &self,
        payref_id: &str,
    ) -> Result<Option<PaymentReconciliation>, AppError>;
    async fn records_for_run(
        &self,
        run_req_id: &str,
    ) -> Result<Vec<PaymentReconciliation>, AppError>;
    async fn records_with_match_status(
        &self,
        run_req_id: &str,
        status: MatchStatus,
    ) -> Result<Vec<PaymentReconciliation>, AppError>;
    /// Update match outcome; skipped when the owning run is CLOSED.
    async fn update_record_match(
        &self,
        payref_id: &str,
        status: MatchStatus,
        reasons: Option<&str>,
        resolved_bill_id: Option<&str>,
        resolved_payment_id: Option<Uuid>,
    ) -> Result<(), AppError>;

    // ---- delivery / idempotency ----
    /// Claim an event key ahead of a document delivery. Returns true only
    /// for the first claim; later claims mean the delivery already ran.
    async fn claim_delivery_event(
        &self,
        event_key: &str,
        kind: &str,
        recipient: Option<&str>,
    ) -> Result<bool, AppError>;
    async fn delivery_exists(&self, event_key: &str) -> Result<bool, AppError>;
    async fn get_idempotency_record(
        &self,
        body_hash: &str,
    ) -> Result<Option<IdempotencyRecord>, AppError>;
    async fn record_idempotency(
        &self,
        record: IdempotencyRecord,
    ) -> Result<IdempotencyOutcome, AppError>;

    async fn health_check(&self) -> Result<(), AppError>;
}
