//! In-memory store backend.
//!
//! Backs tests and `DATABASE_BACKEND=memory` runs. A single mutex over all
//! tables makes every check-then-write in the trait atomic, mirroring the
//! transactional guarantees of the Postgres backend.

use crate::models::{
    Bill, BillItem, BillingDepartment, CancelStatus, CancelledBill, Customer, DeliveryLog,
    IdempotencyRecord, LogStatus, MatchStatus, Payment, PaymentGatewayLog, PaymentReconciliation,
    ReconciliationRun, RequestType, RunStatus, SystemInfo,
};
use crate::services::store::{
    BillingStore, ControlNumberOutcome, IdempotencyOutcome, PaymentOutcome,
};
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use service_core::error::AppError;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

#[derive(Default)]
struct Inner {
    departments: HashMap<Uuid, BillingDepartment>,
    customers: HashMap<Uuid, Customer>,
    system_infos: HashMap<Uuid, SystemInfo>,
    bills: HashMap<String, Bill>,
    bill_items: HashMap<String, Vec<BillItem>>,
    payments: Vec<Payment>,
    logs: Vec<PaymentGatewayLog>,
    cancelled: HashMap<String, CancelledBill>,
    runs: HashMap<String, ReconciliationRun>,
    recon_records: HashMap<String, PaymentReconciliation>,
    deliveries: HashMap<String, DeliveryLog>,
    idempotency: HashMap<String, IdempotencyRecord>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Recover from a poisoned lock rather than propagating the panic.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn run_is_closed(inner: &Inner, run_req_id: &str) -> bool {
    inner
        .runs
        .get(run_req_id)
        .map(|r| r.is_closed())
        .unwrap_or(false)
}

#[async_trait]
impl BillingStore for MemoryStore {
    async fn insert_department(&self, dept: BillingDepartment) -> Result<(), AppError> {
        self.lock().departments.insert(dept.dept_id, dept);
        Ok(())
    }

    async fn get_department(&self, dept_id: Uuid) -> Result<Option<BillingDepartment>, AppError> {
        Ok(self.lock().departments.get(&dept_id).cloned())
    }

    async fn get_department_by_name(
        &self,
        name: &str,
    ) -> Result<Option<BillingDepartment>, AppError> {
        Ok(self
            .lock()
            .departments
            .values()
            .find(|d| d.name == name)
            .cloned())
    }

    async fn insert_system_info(&self, info: SystemInfo) -> Result<(), AppError> {
        self.lock().system_infos.insert(info.system_id, info);
        Ok(())
    }

    async fn get_system_info(&self, system_id: Uuid) -> Result<Option<SystemInfo>, AppError> {
        Ok(self.lock().system_infos.get(&system_id).cloned())
    }

    async fn get_system_info_by_code(&self, code: &str) -> Result<Option<SystemInfo>, AppError> {
        Ok(self
            .lock()
            .system_infos
            .values()
            .find(|s| s.code == code)
            .cloned())
    }

    async fn upsert_customer_by_email(&self, customer: Customer) -> Result<Customer, AppError> {
        let mut inner = self.lock();
        if let Some(email) = customer.email.as_deref() {
            if let Some(existing) = inner
                .customers
                .values_mut()
                .find(|c| c.email.as_deref() == Some(email))
            {
                existing.first_name = customer.first_name;
                existing.middle_name = customer.middle_name;
                existing.last_name = customer.last_name;
                existing.cell_num = customer.cell_num;
                existing.updated_utc = Utc::now();
                return Ok(existing.clone());
            }
        }
        inner.customers.insert(customer.customer_id, customer.clone());
        Ok(customer)
    }

    async fn get_customer(&self, customer_id: Uuid) -> Result<Option<Customer>, AppError> {
        Ok(self.lock().customers.get(&customer_id).cloned())
    }

    async fn insert_bill(&self, bill: Bill, items: Vec<BillItem>) -> Result<(), AppError> {
        let mut inner = self.lock();
        if inner.bills.contains_key(&bill.bill_id) {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "bill {} already exists",
                bill.bill_id
            )));
        }
        inner.bill_items.insert(bill.bill_id.clone(), items);
        inner.bills.insert(bill.bill_id.clone(), bill);
        Ok(())
    }

    async fn update_bill(&self, bill: Bill, items: Vec<BillItem>) -> Result<(), AppError> {
        let mut inner = self.lock();
        if !inner.bills.contains_key(&bill.bill_id) {
            return Err(AppError::NotFound(anyhow::anyhow!(
                "bill {} not found",
                bill.bill_id
            )));
        }
        inner.bill_items.insert(bill.bill_id.clone(), items);
        inner.bills.insert(bill.bill_id.clone(), bill);
        Ok(())
    }

    async fn get_bill(&self, bill_id: &str) -> Result<Option<Bill>, AppError> {
        Ok(self.lock().bills.get(bill_id).cloned())
    }

    async fn get_bill_by_group_id(&self, group_bill_id: &str) -> Result<Option<Bill>, AppError> {
        Ok(self
            .lock()
            .bills
            .values()
            .find(|b| b.group_bill_id == group_bill_id)
            .cloned())
    }

    async fn get_bill_items(&self, bill_id: &str) -> Result<Vec<BillItem>, AppError> {
        Ok(self.lock().bill_items.get(bill_id).cloned().unwrap_or_default())
    }

    async fn set_control_number_if_unset(
        &self,
        bill_id: &str,
        control_number: i64,
    ) -> Result<ControlNumberOutcome, AppError> {
        let mut inner = self.lock();

        let taken_elsewhere = inner
            .bills
            .values()
            .any(|b| b.bill_id != bill_id && b.control_number == Some(control_number));
        if taken_elsewhere {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "control number {} already assigned to another bill",
                control_number
            )));
        }

        let bill = inner.bills.get_mut(bill_id).ok_or_else(|| {
            AppError::NotFound(anyhow::anyhow!("bill {} not found", bill_id))
        })?;

        match bill.control_number {
            Some(existing) => Ok(ControlNumberOutcome::AlreadySet(existing)),
            None => {
                bill.control_number = Some(control_number);
                bill.updated_utc = Utc::now();
                Ok(ControlNumberOutcome::Assigned)
            }
        }
    }

    async fn clear_control_number(&self, bill_id: &str) -> Result<(), AppError> {
        let mut inner = self.lock();
        if let Some(bill) = inner.bills.get_mut(bill_id) {
            bill.control_number = None;
            bill.updated_utc = Utc::now();
        }
        Ok(())
    }

    async fn create_payment_if_absent(&self, payment: Payment) -> Result<PaymentOutcome, AppError> {
        let mut inner = self.lock();
        if let Some(existing) = inner
            .payments
            .iter()
            .find(|p| p.bill_id == payment.bill_id && p.cust_cntr_num == payment.cust_cntr_num)
        {
            return Ok(PaymentOutcome::AlreadyExists(existing.clone()));
        }
        if let Some(existing) = inner.payments.iter().find(|p| p.bill_id == payment.bill_id) {
            // One payment per bill even when the reported control number differs.
            return Ok(PaymentOutcome::AlreadyExists(existing.clone()));
        }
        inner.payments.push(payment.clone());
        Ok(PaymentOutcome::Created(payment))
    }

    async fn get_payment_for_bill(&self, bill_id: &str) -> Result<Option<Payment>, AppError> {
        Ok(self
            .lock()
            .payments
            .iter()
            .find(|p| p.bill_id == bill_id)
            .cloned())
    }

    async fn get_or_create_log(
        &self,
        log: PaymentGatewayLog,
    ) -> Result<(PaymentGatewayLog, bool), AppError> {
        let mut inner = self.lock();
        if let Some(existing) = inner
            .logs
            .iter()
            .find(|l| l.req_id == log.req_id && l.req_type == log.req_type)
        {
            return Ok((existing.clone(), false));
        }
        inner.logs.push(log.clone());
        Ok((log, true))
    }

    async fn get_log(
        &self,
        req_id: &str,
        req_type: RequestType,
    ) -> Result<Option<PaymentGatewayLog>, AppError> {
        Ok(self
            .lock()
            .logs
            .iter()
            .find(|l| l.req_id == req_id && l.req_type == req_type.as_str())
            .cloned())
    }

    async fn update_log_status(
        &self,
        req_id: &str,
        req_type: RequestType,
        status: LogStatus,
        status_desc: &str,
    ) -> Result<(), AppError> {
        let mut inner = self.lock();
        if let Some(log) = inner
            .logs
            .iter_mut()
            .find(|l| l.req_id == req_id && l.req_type == req_type.as_str())
        {
            log.status = status.as_str().to_string();
            log.status_desc = status_desc.to_string();
            log.updated_utc = Utc::now();
        }
        Ok(())
    }

    async fn set_log_req_ack(
        &self,
        req_id: &str,
        req_type: RequestType,
        raw: &str,
    ) -> Result<(), AppError> {
        let mut inner = self.lock();
        if let Some(log) = inner
            .logs
            .iter_mut()
            .find(|l| l.req_id == req_id && l.req_type == req_type.as_str())
        {
            log.req_ack = Some(raw.to_string());
            log.updated_utc = Utc::now();
        }
        Ok(())
    }

    async fn set_log_res_data(
        &self,
        req_id: &str,
        req_type: RequestType,
        raw: &str,
    ) -> Result<(), AppError> {
        let mut inner = self.lock();
        if let Some(log) = inner
            .logs
            .iter_mut()
            .find(|l| l.req_id == req_id && l.req_type == req_type.as_str())
        {
            log.res_data = Some(raw.to_string());
            log.updated_utc = Utc::now();
        }
        Ok(())
    }

    async fn set_log_res_ack(
        &self,
        req_id: &str,
        req_type: RequestType,
        raw: &str,
    ) -> Result<(), AppError> {
        let mut inner = self.lock();
        if let Some(log) = inner
            .logs
            .iter_mut()
            .find(|l| l.req_id == req_id && l.req_type == req_type.as_str())
        {
            log.res_ack = Some(raw.to_string());
            log.updated_utc = Utc::now();
        }
        Ok(())
    }

    async fn latest_log_for_bill(
        &self,
        bill_id: &str,
    ) -> Result<Option<PaymentGatewayLog>, AppError> {
        Ok(self
            .lock()
            .logs
            .iter()
            .filter(|l| l.bill_id.as_deref() == Some(bill_id))
            .max_by_key(|l| l.created_utc)
            .cloned())
    }

    async fn logs_with_status(
        &self,
        status: LogStatus,
    ) -> Result<Vec<PaymentGatewayLog>, AppError> {
        Ok(self
            .lock()
            .logs
            .iter()
            .filter(|l| l.status == status.as_str())
            .cloned()
            .collect())
    }

    async fn upsert_cancelled_bill(&self, cancelled: CancelledBill) -> Result<(), AppError> {
        self.lock()
            .cancelled
            .insert(cancelled.bill_id.clone(), cancelled);
        Ok(())
    }

    async fn get_cancelled_bill(&self, bill_id: &str) -> Result<Option<CancelledBill>, AppError> {
        Ok(self.lock().cancelled.get(bill_id).cloned())
    }

    async fn set_cancelled_status(
        &self,
        bill_id: &str,
        status: CancelStatus,
    ) -> Result<(), AppError> {
        let mut inner = self.lock();
        if let Some(cancelled) = inner.cancelled.get_mut(bill_id) {
            cancelled.status = status.as_str().to_string();
            cancelled.updated_utc = Utc::now();
        }
        Ok(())
    }

    async fn insert_run(&self, run: ReconciliationRun) -> Result<(), AppError> {
        let mut inner = self.lock();
        if inner.runs.contains_key(&run.req_id) {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "reconciliation run {} already exists",
                run.req_id
            )));
        }
        inner.runs.insert(run.req_id.clone(), run);
        Ok(())
    }

    async fn get_run(&self, req_id: &str) -> Result<Option<ReconciliationRun>, AppError> {
        Ok(self.lock().runs.get(req_id).cloned())
    }

    async fn latest_run_for_date(
        &self,
        trx_date: NaiveDate,
    ) -> Result<Option<ReconciliationRun>, AppError> {
        Ok(self
            .lock()
            .runs
            .values()
            .filter(|r| r.trx_date == trx_date)
            .max_by_key(|r| r.created_utc)
            .cloned())
    }

    async fn date_has_active_run(&self, trx_date: NaiveDate) -> Result<bool, AppError> {
        Ok(self
            .lock()
            .runs
            .values()
            .any(|r| r.trx_date == trx_date && r.status_enum() != RunStatus::Error))
    }

    async fn transition_run(
        &self,
        req_id: &str,
        from: &[RunStatus],
        to: RunStatus,
        status_desc: Option<&str>,
    ) -> Result<bool, AppError> {
        let mut inner = self.lock();
        let Some(run) = inner.runs.get_mut(req_id) else {
            return Ok(false);
        };
        if !from.contains(&run.status_enum()) {
            return Ok(false);
        }
        run.status = to.as_str().to_string();
        if let Some(desc) = status_desc {
            run.status_desc = Some(desc.to_string());
        }
        run.updated_utc = Utc::now();
        Ok(true)
    }

    async fn set_run_totals(
        &self,
        req_id: &str,
        reported_totals: &str,
        internal_totals: &str,
        totals_match: bool,
    ) -> Result<(), AppError> {
        let mut inner = self.lock();
        if let Some(run) = inner.runs.get_mut(req_id) {
            if run.is_closed() {
                return Ok(());
            }
            run.reported_totals = Some(reported_totals.to_string());
            run.internal_totals = Some(internal_totals.to_string());
            run.totals_match = Some(totals_match);
            run.updated_utc = Utc::now();
        }
        Ok(())
    }

    async fn close_run(&self, req_id: &str, force: bool) -> Result<bool, AppError> {
        let mut inner = self.lock();
        let Some(run) = inner.runs.get_mut(req_id) else {
            return Ok(false);
        };
        match run.status_enum() {
            RunStatus::Closed => Ok(true),
            RunStatus::Processed => {
                run.status = RunStatus::Closed.as_str().to_string();
                run.closed_utc = Some(Utc::now());
                run.updated_utc = Utc::now();
                Ok(true)
            }
            _ if force => {
                run.status = RunStatus::Closed.as_str().to_string();
                run.closed_utc = Some(Utc::now());
                run.updated_utc = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn upsert_reconciliation_record(
        &self,
        record: PaymentReconciliation,
    ) -> Result<(), AppError> {
        let mut inner = self.lock();
        if run_is_closed(&inner, &record.run_req_id) {
            return Ok(());
        }
        match inner.recon_records.get_mut(&record.payref_id) {
            Some(existing) => {
                let recon_id = existing.recon_id;
                let created_utc = existing.created_utc;
                let match_status = existing.match_status.clone();
                let mismatch_reasons = existing.mismatch_reasons.clone();
                let resolved_bill_id = existing.resolved_bill_id.clone();
                let resolved_payment_id = existing.resolved_payment_id;
                *existing = PaymentReconciliation {
                    recon_id,
                    created_utc,
                    // Match outcome survives the upsert; re-matching is a
                    // separate explicit update.
                    match_status,
                    mismatch_reasons,
                    resolved_bill_id,
                    resolved_payment_id,
                    updated_utc: Utc::now(),
                    ..record
                };
            }
            None => {
                inner
                    .recon_records
                    .insert(record.payref_id.clone(), record);
            }
        }
        Ok(())
    }

    async fn get_reconciliation_record(
        &self,
        payref_id: &str,
    ) -> Result<Option<PaymentReconciliation>, AppError> {
        Ok(self.lock().recon_records.get(payref_id).cloned())
    }

    async fn records_for_run(
        &self,
        run_req_id: &str,
    ) -> Result<Vec<PaymentReconciliation>, AppError> {
        let mut records: Vec<_> = self
            .lock()
            .recon_records
            .values()
            .filter(|r| r.run_req_id == run_req_id)
            .cloned()
            .collect();
        records.sort_by(|a, b| a.payref_id.cmp(&b.payref_id));
        Ok(records)
    }

    async fn records_with_match_status(
        &self,
        run_req_id: &str,
        status: MatchStatus,
    ) -> Result<Vec<PaymentReconciliation>, AppError> {
        let mut records: Vec<_> = self
            .lock()
            .recon_records
            .values()
            .filter(|r| r.run_req_id == run_req_id && r.match_status == status.as_str())
            .cloned()
            .collect();
        records.sort_by(|a, b| a.payref_id.cmp(&b.payref_id));
        Ok(records)
    }

    async fn update_record_match(
        &self,
        payref_id: &str,
        status: MatchStatus,
        reasons: Option<&str>,
        resolved_bill_id: Option<&str>,
        resolved_payment_id: Option<Uuid>,
    ) -> Result<(), AppError> {
        let mut inner = self.lock();
        let closed = inner
            .recon_records
            .get(payref_id)
            .map(|r| run_is_closed(&inner, &r.run_req_id))
            .unwrap_or(false);
        if closed {
            return Ok(());
        }
        if let Some(record) = inner.recon_records.get_mut(payref_id) {
            record.match_status = status.as_str().to_string();
            record.mismatch_reasons = reasons.map(|r| r.to_string());
            record.resolved_bill_id = resolved_bill_id.map(|b| b.to_string());
            record.resolved_payment_id = resolved_payment_id;
            record.updated_utc = Utc::now();
        }
        Ok(())
    }

    async fn claim_delivery_event(
        &self,
        event_key: &str,
        kind: &str,
        recipient: Option<&str>,
    ) -> Result<bool, AppError> {
        let mut inner = self.lock();
        if inner.deliveries.contains_key(event_key) {
            return Ok(false);
        }
        inner.deliveries.insert(
            event_key.to_string(),
            DeliveryLog {
                event_key: event_key.to_string(),
                kind: kind.to_string(),
                recipient: recipient.map(|r| r.to_string()),
                created_utc: Utc::now(),
            },
        );
        Ok(true)
    }

    async fn delivery_exists(&self, event_key: &str) -> Result<bool, AppError> {
        Ok(self.lock().deliveries.contains_key(event_key))
    }

    async fn get_idempotency_record(
        &self,
        body_hash: &str,
    ) -> Result<Option<IdempotencyRecord>, AppError> {
        Ok(self.lock().idempotency.get(body_hash).cloned())
    }

    async fn record_idempotency(
        &self,
        record: IdempotencyRecord,
    ) -> Result<IdempotencyOutcome, AppError> {
        let mut inner = self.lock();
        if let Some(existing) = inner.idempotency.get(&record.body_hash) {
            return Ok(IdempotencyOutcome::Existing(existing.clone()));
        }
        inner
            .idempotency
            .insert(record.body_hash.clone(), record);
        Ok(IdempotencyOutcome::Recorded)
    }

    async fn health_check(&self) -> Result<(), AppError> {
        Ok(())
    }
}
