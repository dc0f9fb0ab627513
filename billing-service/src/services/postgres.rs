//! Postgres store backend.
//!
//! All conditional operations are expressed as guarded SQL (conditional
//! UPDATE, `ON CONFLICT`) or short transactions so concurrent callback
//! deliveries cannot interleave between check and write.

use crate::models::{
    Bill, BillItem, BillingDepartment, CancelStatus, CancelledBill, Customer, IdempotencyRecord,
    LogStatus, MatchStatus, Payment, PaymentGatewayLog, PaymentReconciliation, ReconciliationRun,
    RequestType, RunStatus, SystemInfo,
};
use crate::services::store::{
    BillingStore, ControlNumberOutcome, IdempotencyOutcome, PaymentOutcome,
};
use async_trait::async_trait;
use chrono::NaiveDate;
use service_core::error::AppError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::{info, instrument};
use uuid::Uuid;

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
}

impl PgStore {
    /// Create a connection pool and run pending migrations.
    #[instrument(skip(database_url), fields(service = "billing-service"))]
    pub async fn connect(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl BillingStore for PgStore {
    async fn insert_department(&self, dept: BillingDepartment) -> Result<(), AppError> {
        sqlx::query(
            "INSERT INTO billing_department \
             (dept_id, name, code, description, account_num, created_utc, updated_utc) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(dept.dept_id)
        .bind(&dept.name)
        .bind(&dept.code)
        .bind(&dept.description)
        .bind(&dept.account_num)
        .bind(dept.created_utc)
        .bind(dept.updated_utc)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_department(&self, dept_id: Uuid) -> Result<Option<BillingDepartment>, AppError> {
        let dept = sqlx::query_as::<_, BillingDepartment>(
            "SELECT * FROM billing_department WHERE dept_id = $1",
        )
        .bind(dept_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(dept)
    }

    async fn get_department_by_name(
        &self,
        name: &str,
    ) -> Result<Option<BillingDepartment>, AppError> {
        let dept = sqlx::query_as::<_, BillingDepartment>(
            "SELECT * FROM billing_department WHERE name = $1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(dept)
    }

    async fn insert_system_info(&self, info: SystemInfo) -> Result<(), AppError> {
        sqlx::query(
            "INSERT INTO system_info \
             (system_id, code, name, cntrnum_response_callback, pay_notification_callback, \
              is_active, created_utc, updated_utc) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(info.system_id)
        .bind(&info.code)
        .bind(&info.name)
        .bind(&info.cntrnum_response_callback)
        .bind(&info.pay_notification_callback)
        .bind(info.is_active)
        .bind(info.created_utc)
        .bind(info.updated_utc)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_system_info(&self, system_id: Uuid) -> Result<Option<SystemInfo>, AppError> {
        let info =
            sqlx::query_as::<_, SystemInfo>("SELECT * FROM system_info WHERE system_id = $1")
                .bind(system_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(info)
    }

    async fn get_system_info_by_code(&self, code: &str) -> Result<Option<SystemInfo>, AppError> {
        let info = sqlx::query_as::<_, SystemInfo>("SELECT * FROM system_info WHERE code = $1")
            .bind(code)
            .fetch_optional(&self.pool)
            .await?;
        Ok(info)
    }

    async fn upsert_customer_by_email(&self, customer: Customer) -> Result<Customer, AppError> {
        if customer.email.is_none() {
            sqlx::query(
                "INSERT INTO customer \
                 (customer_id, first_name, middle_name, last_name, tin, id_num, id_type, \
                  account_num, cell_num, email, created_utc, updated_utc) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
            )
            .bind(customer.customer_id)
            .bind(&customer.first_name)
            .bind(&customer.middle_name)
            .bind(&customer.last_name)
            .bind(&customer.tin)
            .bind(&customer.id_num)
            .bind(&customer.id_type)
            .bind(&customer.account_num)
            .bind(&customer.cell_num)
            .bind(&customer.email)
            .bind(customer.created_utc)
            .bind(customer.updated_utc)
            .execute(&self.pool)
            .await?;
            return Ok(customer);
        }

        let customer = sqlx::query_as::<_, Customer>(
            "INSERT INTO customer \
             (customer_id, first_name, middle_name, last_name, tin, id_num, id_type, \
              account_num, cell_num, email, created_utc, updated_utc) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12) \
             ON CONFLICT (email) DO UPDATE SET \
                 first_name = EXCLUDED.first_name, \
                 middle_name = EXCLUDED.middle_name, \
                 last_name = EXCLUDED.last_name, \
                 cell_num = EXCLUDED.cell_num, \
                 updated_utc = NOW() \
             RETURNING *",
        )
        .bind(customer.customer_id)
        .bind(&customer.first_name)
        .bind(&customer.middle_name)
        .bind(&customer.last_name)
        .bind(&customer.tin)
        .bind(&customer.id_num)
        .bind(&customer.id_type)
        .bind(&customer.account_num)
        .bind(&customer.cell_num)
        .bind(&customer.email)
        .bind(customer.created_utc)
        .bind(customer.updated_utc)
        .fetch_one(&self.pool)
        .await?;
        Ok(customer)
    }

    async fn get_customer(&self, customer_id: Uuid) -> Result<Option<Customer>, AppError> {
        let customer =
            sqlx::query_as::<_, Customer>("SELECT * FROM customer WHERE customer_id = $1")
                .bind(customer_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(customer)
    }

    async fn insert_bill(&self, bill: Bill, items: Vec<BillItem>) -> Result<(), AppError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO bill \
             (bill_id, group_bill_id, dept_id, customer_id, sys_info_id, description, \
              amount, eqv_amount, min_amount, max_amount, currency, exchange_rate, \
              bill_type, pay_type, pay_opt, pay_plan, pay_lim_type, gen_date, expiry_date, \
              gen_by, appr_by, control_number, created_utc, updated_utc) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, \
                     $16, $17, $18, $19, $20, $21, $22, $23, $24)",
        )
        .bind(&bill.bill_id)
        .bind(&bill.group_bill_id)
        .bind(bill.dept_id)
        .bind(bill.customer_id)
        .bind(bill.sys_info_id)
        .bind(&bill.description)
        .bind(bill.amount)
        .bind(bill.eqv_amount)
        .bind(bill.min_amount)
        .bind(bill.max_amount)
        .bind(&bill.currency)
        .bind(bill.exchange_rate)
        .bind(bill.bill_type)
        .bind(bill.pay_type)
        .bind(bill.pay_opt)
        .bind(bill.pay_plan)
        .bind(bill.pay_lim_type)
        .bind(bill.gen_date)
        .bind(bill.expiry_date)
        .bind(&bill.gen_by)
        .bind(&bill.appr_by)
        .bind(bill.control_number)
        .bind(bill.created_utc)
        .bind(bill.updated_utc)
        .execute(&mut *tx)
        .await?;

        for item in &items {
            sqlx::query(
                "INSERT INTO bill_item \
                 (item_id, bill_id, dept_id, source_name, gfs_code, description, ref_on_pay, \
                  qty, amount, eqv_amount, misc_amount, created_utc) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
            )
            .bind(item.item_id)
            .bind(&item.bill_id)
            .bind(item.dept_id)
            .bind(&item.source_name)
            .bind(&item.gfs_code)
            .bind(&item.description)
            .bind(&item.ref_on_pay)
            .bind(item.qty)
            .bind(item.amount)
            .bind(item.eqv_amount)
            .bind(item.misc_amount)
            .bind(item.created_utc)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn update_bill(&self, bill: Bill, items: Vec<BillItem>) -> Result<(), AppError> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            "UPDATE bill SET description = $2, amount = $3, eqv_amount = $4, min_amount = $5, \
             max_amount = $6, currency = $7, updated_utc = NOW() WHERE bill_id = $1",
        )
        .bind(&bill.bill_id)
        .bind(&bill.description)
        .bind(bill.amount)
        .bind(bill.eqv_amount)
        .bind(bill.min_amount)
        .bind(bill.max_amount)
        .bind(&bill.currency)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(anyhow::anyhow!(
                "bill {} not found",
                bill.bill_id
            )));
        }

        sqlx::query("DELETE FROM bill_item WHERE bill_id = $1")
            .bind(&bill.bill_id)
            .execute(&mut *tx)
            .await?;

        for item in &items {
            sqlx::query(
                "INSERT INTO bill_item \
                 (item_id, bill_id, dept_id, source_name, gfs_code, description, ref_on_pay, \
                  qty, amount, eqv_amount, misc_amount, created_utc) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
            )
            .bind(item.item_id)
            .bind(&item.bill_id)
            .bind(item.dept_id)
            .bind(&item.source_name)
            .bind(&item.gfs_code)
            .bind(&item.description)
            .bind(&item.ref_on_pay)
            .bind(item.qty)
            .bind(item.amount)
            .bind(item.eqv_amount)
            .bind(item.misc_amount)
            .bind(item.created_utc)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_bill(&self, bill_id: &str) -> Result<Option<Bill>, AppError> {
        let bill = sqlx::query_as::<_, Bill>("SELECT * FROM bill WHERE bill_id = $1")
            .bind(bill_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(bill)
    }

    async fn get_bill_by_group_id(&self, group_bill_id: &str) -> Result<Option<Bill>, AppError> {
        let bill = sqlx::query_as::<_, Bill>("SELECT * FROM bill WHERE group_bill_id = $1")
            .bind(group_bill_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(bill)
    }

    async fn get_bill_items(&self, bill_id: &str) -> Result<Vec<BillItem>, AppError> {
        let items = sqlx::query_as::<_, BillItem>(
            "SELECT * FROM bill_item WHERE bill_id = $1 ORDER BY created_utc",
        )
        .bind(bill_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(items)
    }

    async fn set_control_number_if_unset(
        &self,
        bill_id: &str,
        control_number: i64,
    ) -> Result<ControlNumberOutcome, AppError> {
        let result = sqlx::query(
            "UPDATE bill SET control_number = $2, updated_utc = NOW() \
             WHERE bill_id = $1 AND control_number IS NULL",
        )
        .bind(bill_id)
        .bind(control_number)
        .execute(&self.pool)
        .await;

        match result {
            Ok(r) if r.rows_affected() == 1 => Ok(ControlNumberOutcome::Assigned),
            Ok(_) => {
                let existing: Option<(Option<i64>,)> =
                    sqlx::query_as("SELECT control_number FROM bill WHERE bill_id = $1")
                        .bind(bill_id)
                        .fetch_optional(&self.pool)
                        .await?;
                match existing {
                    Some((Some(cn),)) => Ok(ControlNumberOutcome::AlreadySet(cn)),
                    Some((None,)) => Err(AppError::Conflict(anyhow::anyhow!(
                        "control number assignment raced for bill {}",
                        bill_id
                    ))),
                    None => Err(AppError::NotFound(anyhow::anyhow!(
                        "bill {} not found",
                        bill_id
                    ))),
                }
            }
            Err(e) if is_unique_violation(&e) => Err(AppError::Conflict(anyhow::anyhow!(
                "control number {} already assigned to another bill",
                control_number
            ))),
            Err(e) => Err(e.into()),
        }
    }

    async fn clear_control_number(&self, bill_id: &str) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE bill SET control_number = NULL, updated_utc = NOW() WHERE bill_id = $1",
        )
        .bind(bill_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn create_payment_if_absent(&self, payment: Payment) -> Result<PaymentOutcome, AppError> {
        let result = sqlx::query(
            "INSERT INTO payment \
             (payment_id, bill_id, cust_cntr_num, psp_code, psp_name, trx_id, payref_id, \
              bill_amount, paid_amount, currency, coll_acc_num, trx_date, pay_channel, \
              trdpty_trx_id, pyr_name, pyr_cell_num, pyr_email, created_utc) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, \
                     $17, $18) \
             ON CONFLICT DO NOTHING",
        )
        .bind(payment.payment_id)
        .bind(&payment.bill_id)
        .bind(payment.cust_cntr_num)
        .bind(&payment.psp_code)
        .bind(&payment.psp_name)
        .bind(&payment.trx_id)
        .bind(&payment.payref_id)
        .bind(payment.bill_amount)
        .bind(payment.paid_amount)
        .bind(&payment.currency)
        .bind(&payment.coll_acc_num)
        .bind(payment.trx_date)
        .bind(&payment.pay_channel)
        .bind(&payment.trdpty_trx_id)
        .bind(&payment.pyr_name)
        .bind(&payment.pyr_cell_num)
        .bind(&payment.pyr_email)
        .bind(payment.created_utc)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(PaymentOutcome::Created(payment));
        }

        let existing = sqlx::query_as::<_, Payment>("SELECT * FROM payment WHERE bill_id = $1")
            .bind(&payment.bill_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(PaymentOutcome::AlreadyExists(existing))
    }

    async fn get_payment_for_bill(&self, bill_id: &str) -> Result<Option<Payment>, AppError> {
        let payment = sqlx::query_as::<_, Payment>("SELECT * FROM payment WHERE bill_id = $1")
            .bind(bill_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(payment)
    }

    async fn get_or_create_log(
        &self,
        log: PaymentGatewayLog,
    ) -> Result<(PaymentGatewayLog, bool), AppError> {
        let result = sqlx::query(
            "INSERT INTO payment_gateway_log \
             (log_id, req_id, req_type, bill_id, status, status_desc, req_data, req_ack, \
              res_data, res_ack, created_utc, updated_utc) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12) \
             ON CONFLICT (req_id, req_type) DO NOTHING",
        )
        .bind(log.log_id)
        .bind(&log.req_id)
        .bind(&log.req_type)
        .bind(&log.bill_id)
        .bind(&log.status)
        .bind(&log.status_desc)
        .bind(&log.req_data)
        .bind(&log.req_ack)
        .bind(&log.res_data)
        .bind(&log.res_ack)
        .bind(log.created_utc)
        .bind(log.updated_utc)
        .execute(&self.pool)
        .await?;

        let created = result.rows_affected() == 1;
        let row = sqlx::query_as::<_, PaymentGatewayLog>(
            "SELECT * FROM payment_gateway_log WHERE req_id = $1 AND req_type = $2",
        )
        .bind(&log.req_id)
        .bind(&log.req_type)
        .fetch_one(&self.pool)
        .await?;
        Ok((row, created))
    }

    async fn get_log(
        &self,
        req_id: &str,
        req_type: RequestType,
    ) -> Result<Option<PaymentGatewayLog>, AppError> {
        let log = sqlx::query_as::<_, PaymentGatewayLog>(
            "SELECT * FROM payment_gateway_log WHERE req_id = $1 AND req_type = $2",
        )
        .bind(req_id)
        .bind(req_type.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(log)
    }

    async fn update_log_status(
        &self,
        req_id: &str,
        req_type: RequestType,
        status: LogStatus,
        status_desc: &str,
    ) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE payment_gateway_log SET status = $3, status_desc = $4, updated_utc = NOW() \
             WHERE req_id = $1 AND req_type = $2",
        )
        .bind(req_id)
        .bind(req_type.as_str())
        .bind(status.as_str())
        .bind(status_desc)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_log_req_ack(
        &self,
        req_id: &str,
        req_type: RequestType,
        raw: &str,
    ) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE payment_gateway_log SET req_ack = $3, updated_utc = NOW() \
             WHERE req_id = $1 AND req_type = $2",
        )
        .bind(req_id)
        .bind(req_type.as_str())
        .bind(raw)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_log_res_data(
        &self,
        req_id: &str,
        req_type: RequestType,
        raw: &str,
    ) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE payment_gateway_log SET res_data = $3, updated_utc = NOW() \
             WHERE req_id = $1 AND req_type = $2",
        )
        .bind(req_id)
        .bind(req_type.as_str())
        .bind(raw)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_log_res_ack(
        &self,
        req_id: &str,
        req_type: RequestType,
        raw: &str,
    ) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE payment_gateway_log SET res_ack = $3, updated_utc = NOW() \
             WHERE req_id = $1 AND req_type = $2",
        )
        .bind(req_id)
        .bind(req_type.as_str())
        .bind(raw)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn latest_log_for_bill(
        &self,
        bill_id: &str,
    ) -> Result<Option<PaymentGatewayLog>, AppError> {
        let log = sqlx::query_as::<_, PaymentGatewayLog>(
            "SELECT * FROM payment_gateway_log WHERE bill_id = $1 \
             ORDER BY created_utc DESC LIMIT 1",
        )
        .bind(bill_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(log)
    }

    async fn logs_with_status(
        &self,
        status: LogStatus,
    ) -> Result<Vec<PaymentGatewayLog>, AppError> {
        let logs = sqlx::query_as::<_, PaymentGatewayLog>(
            "SELECT * FROM payment_gateway_log WHERE status = $1 ORDER BY created_utc DESC",
        )
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(logs)
    }

    async fn upsert_cancelled_bill(&self, cancelled: CancelledBill) -> Result<(), AppError> {
        sqlx::query(
            "INSERT INTO cancelled_bill \
             (bill_id, reason, gen_by, appr_by, status, created_utc, updated_utc) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             ON CONFLICT (bill_id) DO UPDATE SET \
                 reason = EXCLUDED.reason, \
                 gen_by = EXCLUDED.gen_by, \
                 appr_by = EXCLUDED.appr_by, \
                 status = EXCLUDED.status, \
                 updated_utc = NOW()",
        )
        .bind(&cancelled.bill_id)
        .bind(&cancelled.reason)
        .bind(&cancelled.gen_by)
        .bind(&cancelled.appr_by)
        .bind(&cancelled.status)
        .bind(cancelled.created_utc)
        .bind(cancelled.updated_utc)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_cancelled_bill(&self, bill_id: &str) -> Result<Option<CancelledBill>, AppError> {
        let cancelled =
            sqlx::query_as::<_, CancelledBill>("SELECT * FROM cancelled_bill WHERE bill_id = $1")
                .bind(bill_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(cancelled)
    }

    async fn set_cancelled_status(
        &self,
        bill_id: &str,
        status: CancelStatus,
    ) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE cancelled_bill SET status = $2, updated_utc = NOW() WHERE bill_id = $1",
        )
        .bind(bill_id)
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_run(&self, run: ReconciliationRun) -> Result<(), AppError> {
        let result = sqlx::query(
            "INSERT INTO reconciliation_run \
             (req_id, trx_date, status, status_desc, reported_totals, internal_totals, \
              totals_match, closed_utc, created_utc, updated_utc) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(&run.req_id)
        .bind(run.trx_date)
        .bind(&run.status)
        .bind(&run.status_desc)
        .bind(&run.reported_totals)
        .bind(&run.internal_totals)
        .bind(run.totals_match)
        .bind(run.closed_utc)
        .bind(run.created_utc)
        .bind(run.updated_utc)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(AppError::Conflict(anyhow::anyhow!(
                "reconciliation run {} already exists",
                run.req_id
            ))),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_run(&self, req_id: &str) -> Result<Option<ReconciliationRun>, AppError> {
        let run = sqlx::query_as::<_, ReconciliationRun>(
            "SELECT * FROM reconciliation_run WHERE req_id = $1",
        )
        .bind(req_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(run)
    }

    async fn latest_run_for_date(
        &self,
        trx_date: NaiveDate,
    ) -> Result<Option<ReconciliationRun>, AppError> {
        let run = sqlx::query_as::<_, ReconciliationRun>(
            "SELECT * FROM reconciliation_run WHERE trx_date = $1 \
             ORDER BY created_utc DESC LIMIT 1",
        )
        .bind(trx_date)
        .fetch_optional(&self.pool)
        .await?;
        Ok(run)
    }

    async fn date_has_active_run(&self, trx_date: NaiveDate) -> Result<bool, AppError> {
        let row = sqlx::query(
            "SELECT 1 FROM reconciliation_run WHERE trx_date = $1 AND status <> 'ERROR' LIMIT 1",
        )
        .bind(trx_date)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    async fn transition_run(
        &self,
        req_id: &str,
        from: &[RunStatus],
        to: RunStatus,
        status_desc: Option<&str>,
    ) -> Result<bool, AppError> {
        let from_states: Vec<String> = from.iter().map(|s| s.as_str().to_string()).collect();
        let result = sqlx::query(
            "UPDATE reconciliation_run \
             SET status = $2, status_desc = COALESCE($3, status_desc), updated_utc = NOW() \
             WHERE req_id = $1 AND status = ANY($4)",
        )
        .bind(req_id)
        .bind(to.as_str())
        .bind(status_desc)
        .bind(&from_states)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn set_run_totals(
        &self,
        req_id: &str,
        reported_totals: &str,
        internal_totals: &str,
        totals_match: bool,
    ) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE reconciliation_run \
             SET reported_totals = $2, internal_totals = $3, totals_match = $4, \
                 updated_utc = NOW() \
             WHERE req_id = $1 AND status <> 'CLOSED'",
        )
        .bind(req_id)
        .bind(reported_totals)
        .bind(internal_totals)
        .bind(totals_match)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn close_run(&self, req_id: &str, force: bool) -> Result<bool, AppError> {
        let result = sqlx::query(
            "UPDATE reconciliation_run \
             SET status = 'CLOSED', closed_utc = NOW(), updated_utc = NOW() \
             WHERE req_id = $1 AND status <> 'CLOSED' AND (status = 'PROCESSED' OR $2)",
        )
        .bind(req_id)
        .bind(force)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }

        // Closing an already-closed run is an idempotent success.
        let row: Option<(String,)> =
            sqlx::query_as("SELECT status FROM reconciliation_run WHERE req_id = $1")
                .bind(req_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(matches!(row, Some((status,)) if status == RunStatus::Closed.as_str()))
    }

    async fn upsert_reconciliation_record(
        &self,
        record: PaymentReconciliation,
    ) -> Result<(), AppError> {
        let mut tx = self.pool.begin().await?;

        let status: Option<(String,)> = sqlx::query_as(
            "SELECT status FROM reconciliation_run WHERE req_id = $1 FOR UPDATE",
        )
        .bind(&record.run_req_id)
        .fetch_optional(&mut *tx)
        .await?;

        if matches!(status, Some((ref s,)) if s == RunStatus::Closed.as_str()) {
            return Ok(());
        }

        sqlx::query(
            "INSERT INTO payment_reconciliation \
             (recon_id, run_req_id, payref_id, bill_id, grp_bill_id, cust_cntr_num, psp_code, \
              psp_name, trx_id, bill_amount, paid_amount, currency, coll_acc_num, trx_date, \
              pay_channel, trdpty_trx_id, qt_ref_id, pyr_name, pyr_cell_num, pyr_email, \
              match_status, mismatch_reasons, resolved_bill_id, resolved_payment_id, \
              created_utc, updated_utc) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, \
                     $17, $18, $19, $20, $21, $22, $23, $24, $25, $26) \
             ON CONFLICT (payref_id) DO UPDATE SET \
                 run_req_id = EXCLUDED.run_req_id, \
                 bill_id = EXCLUDED.bill_id, \
                 grp_bill_id = EXCLUDED.grp_bill_id, \
                 cust_cntr_num = EXCLUDED.cust_cntr_num, \
                 psp_code = EXCLUDED.psp_code, \
                 psp_name = EXCLUDED.psp_name, \
                 trx_id = EXCLUDED.trx_id, \
                 bill_amount = EXCLUDED.bill_amount, \
                 paid_amount = EXCLUDED.paid_amount, \
                 currency = EXCLUDED.currency, \
                 coll_acc_num = EXCLUDED.coll_acc_num, \
                 trx_date = EXCLUDED.trx_date, \
                 pay_channel = EXCLUDED.pay_channel, \
                 trdpty_trx_id = EXCLUDED.trdpty_trx_id, \
                 qt_ref_id = EXCLUDED.qt_ref_id, \
                 pyr_name = EXCLUDED.pyr_name, \
                 pyr_cell_num = EXCLUDED.pyr_cell_num, \
                 pyr_email = EXCLUDED.pyr_email, \
                 updated_utc = NOW()",
        )
        .bind(record.recon_id)
        .bind(&record.run_req_id)
        .bind(&record.payref_id)
        .bind(&record.bill_id)
        .bind(&record.grp_bill_id)
        .bind(&record.cust_cntr_num)
        .bind(&record.psp_code)
        .bind(&record.psp_name)
        .bind(&record.trx_id)
        .bind(record.bill_amount)
        .bind(record.paid_amount)
        .bind(&record.currency)
        .bind(&record.coll_acc_num)
        .bind(record.trx_date)
        .bind(&record.pay_channel)
        .bind(&record.trdpty_trx_id)
        .bind(&record.qt_ref_id)
        .bind(&record.pyr_name)
        .bind(&record.pyr_cell_num)
        .bind(&record.pyr_email)
        .bind(&record.match_status)
        .bind(&record.mismatch_reasons)
        .bind(&record.resolved_bill_id)
        .bind(record.resolved_payment_id)
        .bind(record.created_utc)
        .bind(record.updated_utc)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get_reconciliation_record(
        &self,
        payref_id: &str,
    ) -> Result<Option<PaymentReconciliation>, AppError> {
        let record = sqlx::query_as::<_, PaymentReconciliation>(
            "SELECT * FROM payment_reconciliation WHERE payref_id = $1",
        )
        .bind(payref_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    async fn records_for_run(
        &self,
        run_req_id: &str,
    ) -> Result<Vec<PaymentReconciliation>, AppError> {
        let records = sqlx::query_as::<_, PaymentReconciliation>(
            "SELECT * FROM payment_reconciliation WHERE run_req_id = $1 ORDER BY payref_id",
        )
        .bind(run_req_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    async fn records_with_match_status(
        &self,
        run_req_id: &str,
        status: MatchStatus,
    ) -> Result<Vec<PaymentReconciliation>, AppError> {
        let records = sqlx::query_as::<_, PaymentReconciliation>(
            "SELECT * FROM payment_reconciliation \
             WHERE run_req_id = $1 AND match_status = $2 ORDER BY payref_id",
        )
        .bind(run_req_id)
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;
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
        sqlx::query(
            "UPDATE payment_reconciliation pr \
             SET match_status = $2, mismatch_reasons = $3, resolved_bill_id = $4, \
                 resolved_payment_id = $5, updated_utc = NOW() \
             FROM reconciliation_run r \
             WHERE pr.payref_id = $1 AND r.req_id = pr.run_req_id AND r.status <> 'CLOSED'",
        )
        .bind(payref_id)
        .bind(status.as_str())
        .bind(reasons)
        .bind(resolved_bill_id)
        .bind(resolved_payment_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn claim_delivery_event(
        &self,
        event_key: &str,
        kind: &str,
        recipient: Option<&str>,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            "INSERT INTO delivery_log (event_key, kind, recipient, created_utc) \
             VALUES ($1, $2, $3, NOW()) ON CONFLICT (event_key) DO NOTHING",
        )
        .bind(event_key)
        .bind(kind)
        .bind(recipient)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn delivery_exists(&self, event_key: &str) -> Result<bool, AppError> {
        let row = sqlx::query("SELECT 1 FROM delivery_log WHERE event_key = $1")
            .bind(event_key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn get_idempotency_record(
        &self,
        body_hash: &str,
    ) -> Result<Option<IdempotencyRecord>, AppError> {
        let record = sqlx::query_as::<_, IdempotencyRecord>(
            "SELECT * FROM api_idempotency WHERE body_hash = $1",
        )
        .bind(body_hash)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    async fn record_idempotency(
        &self,
        record: IdempotencyRecord,
    ) -> Result<IdempotencyOutcome, AppError> {
        let result = sqlx::query(
            "INSERT INTO api_idempotency (body_hash, req_id, bill_id, created_utc) \
             VALUES ($1, $2, $3, $4) ON CONFLICT (body_hash) DO NOTHING",
        )
        .bind(&record.body_hash)
        .bind(&record.req_id)
        .bind(&record.bill_id)
        .bind(record.created_utc)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(IdempotencyOutcome::Recorded);
        }

        let existing = sqlx::query_as::<_, IdempotencyRecord>(
            "SELECT * FROM api_idempotency WHERE body_hash = $1",
        )
        .bind(&record.body_hash)
        .fetch_one(&self.pool)
        .await?;
        Ok(IdempotencyOutcome::Existing(existing))
    }

    async fn health_check(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Health check failed: {}", e)))?;
        Ok(())
    }
}
