//! Payment and idempotency-support models.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Settlement details for a paid bill. A bill has at most one payment,
/// enforced by a unique constraint on `(bill_id, cust_cntr_num)` and on
/// `bill_id` itself.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Payment {
    pub payment_id: Uuid,
    pub bill_id: String,
    pub cust_cntr_num: i64,
    pub psp_code: String,
    pub psp_name: String,
    pub trx_id: String,
    pub payref_id: String,
    pub bill_amount: Decimal,
    pub paid_amount: Decimal,
    pub currency: String,
    pub coll_acc_num: String,
    pub trx_date: DateTime<Utc>,
    pub pay_channel: String,
    pub trdpty_trx_id: String,
    pub pyr_name: Option<String>,
    pub pyr_cell_num: Option<String>,
    pub pyr_email: Option<String>,
    pub created_utc: DateTime<Utc>,
}

/// At-most-once guard for document deliveries (invoices, receipts).
///
/// The `event_key` (e.g. `auto:invoice_cn:{control_number}`) is claimed
/// before sending; a repeat claim means the delivery already happened.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct DeliveryLog {
    pub event_key: String,
    pub kind: String,
    pub recipient: Option<String>,
    pub created_utc: DateTime<Utc>,
}

/// Stored response for the idempotent bill-submission API: an identical
/// payload hash replays the recorded `(req_id, bill_id)` pair.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub body_hash: String,
    pub req_id: String,
    pub bill_id: String,
    pub created_utc: DateTime<Utc>,
}
