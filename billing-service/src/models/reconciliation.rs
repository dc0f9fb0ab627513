//! Reconciliation run and settlement record models.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Per-date reconciliation run lifecycle.
///
/// `Closed` is terminal: a closed run (and its records) must never change,
/// which is the cut-off control against late gateway responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Requested,
    Acked,
    Received,
    Processed,
    Closed,
    Error,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Requested => "REQUESTED",
            Self::Acked => "ACKED",
            Self::Received => "RECEIVED",
            Self::Processed => "PROCESSED",
            Self::Closed => "CLOSED",
            Self::Error => "ERROR",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "ACKED" => Self::Acked,
            "RECEIVED" => Self::Received,
            "PROCESSED" => Self::Processed,
            "CLOSED" => Self::Closed,
            "ERROR" => Self::Error,
            _ => Self::Requested,
        }
    }
}

/// Aggregate totals for one currency within a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrencyTotal {
    pub amount: Decimal,
    pub count: i64,
}

/// Currency → totals map; `BTreeMap` so equality and serialization are
/// order-independent.
pub type CurrencyTotals = BTreeMap<String, CurrencyTotal>;

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ReconciliationRun {
    pub req_id: String,
    pub trx_date: NaiveDate,
    pub status: String,
    pub status_desc: Option<String>,
    /// JSON-encoded `CurrencyTotals` of gateway-reported settlements.
    pub reported_totals: Option<String>,
    /// JSON-encoded `CurrencyTotals` of records with a resolved internal payment.
    pub internal_totals: Option<String>,
    pub totals_match: Option<bool>,
    pub closed_utc: Option<DateTime<Utc>>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl ReconciliationRun {
    pub fn new(req_id: &str, trx_date: NaiveDate) -> Self {
        let now = Utc::now();
        Self {
            req_id: req_id.to_string(),
            trx_date,
            status: RunStatus::Requested.as_str().to_string(),
            status_desc: None,
            reported_totals: None,
            internal_totals: None,
            totals_match: None,
            closed_utc: None,
            created_utc: now,
            updated_utc: now,
        }
    }

    pub fn status_enum(&self) -> RunStatus {
        RunStatus::from_str(&self.status)
    }

    pub fn is_closed(&self) -> bool {
        self.status_enum() == RunStatus::Closed
    }
}

/// Match outcome for one reported settlement record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchStatus {
    Matched,
    Mismatch,
    BillNotFound,
    MissingInternalPayment,
    AutoCreated,
}

impl MatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Matched => "MATCHED",
            Self::Mismatch => "MISMATCH",
            Self::BillNotFound => "BILL_NOT_FOUND",
            Self::MissingInternalPayment => "MISSING_INTERNAL_PAYMENT",
            Self::AutoCreated => "AUTO_CREATED",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "MATCHED" => Self::Matched,
            "BILL_NOT_FOUND" => Self::BillNotFound,
            "MISSING_INTERNAL_PAYMENT" => Self::MissingInternalPayment,
            "AUTO_CREATED" => Self::AutoCreated,
            _ => Self::Mismatch,
        }
    }
}

/// One gateway-reported settlement record within a run, unique by
/// `payref_id` so re-processing the same response is an upsert.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct PaymentReconciliation {
    pub recon_id: Uuid,
    pub run_req_id: String,
    pub payref_id: String,
    pub bill_id: String,
    pub grp_bill_id: String,
    pub cust_cntr_num: String,
    pub psp_code: String,
    pub psp_name: String,
    pub trx_id: String,
    pub bill_amount: Decimal,
    pub paid_amount: Decimal,
    pub currency: String,
    pub coll_acc_num: String,
    pub trx_date: Option<DateTime<Utc>>,
    pub pay_channel: String,
    pub trdpty_trx_id: String,
    pub qt_ref_id: Option<String>,
    pub pyr_name: Option<String>,
    pub pyr_cell_num: Option<String>,
    pub pyr_email: Option<String>,
    pub match_status: String,
    /// Comma-joined mismatch reason codes, empty when not mismatched.
    pub mismatch_reasons: Option<String>,
    pub resolved_bill_id: Option<String>,
    pub resolved_payment_id: Option<Uuid>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    #[test]
    fn run_status_round_trip() {
        for status in [
            RunStatus::Requested,
            RunStatus::Acked,
            RunStatus::Received,
            RunStatus::Processed,
            RunStatus::Closed,
            RunStatus::Error,
        ] {
            assert_eq!(RunStatus::from_str(status.as_str()), status);
        }
    }

    #[test]
    fn currency_totals_equality_is_order_independent() {
        let mut a = CurrencyTotals::new();
        a.insert(
            "TZS".to_string(),
            CurrencyTotal {
                amount: Decimal::new(500, 2),
                count: 1,
            },
        );
        a.insert(
            "USD".to_string(),
            CurrencyTotal {
                amount: Decimal::new(100, 2),
                count: 1,
            },
        );

        let mut b = CurrencyTotals::new();
        b.insert(
            "USD".to_string(),
            CurrencyTotal {
                amount: Decimal::new(100, 2),
                count: 1,
            },
        );
        b.insert(
            "TZS".to_string(),
            CurrencyTotal {
                amount: Decimal::new(500, 2),
                count: 1,
            },
        );

        assert_eq!(a, b);

        // A currency present on one side only is a mismatch.
        b.remove("USD");
        assert_ne!(a, b);
    }
}
