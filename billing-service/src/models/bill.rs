//! Bill, customer and department models.
//!
//! Bill status is never stored: it is derived on read from the presence of
//! related records (control number, payment, cancellation) so it cannot drift
//! from the audit trail.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Identification reference types accepted for billed customers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CustomerIdType {
    NationalId,
    DriversLicense,
    TaxpayerId,
    WalletPayNumber,
}

impl CustomerIdType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NationalId => "1",
            Self::DriversLicense => "2",
            Self::TaxpayerId => "3",
            Self::WalletPayNumber => "4",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "2" => Self::DriversLicense,
            "3" => Self::TaxpayerId,
            "4" => Self::WalletPayNumber,
            _ => Self::NationalId,
        }
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Customer {
    pub customer_id: Uuid,
    pub first_name: String,
    pub middle_name: Option<String>,
    pub last_name: String,
    pub tin: Option<String>,
    pub id_num: String,
    pub id_type: String,
    pub account_num: Option<String>,
    pub cell_num: Option<String>,
    pub email: Option<String>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl Customer {
    pub fn full_name(&self) -> String {
        match &self.middle_name {
            Some(middle) => format!("{} {} {}", self.first_name, middle, self.last_name),
            None => format!("{} {}", self.first_name, self.last_name),
        }
    }
}

/// Billing department collection center.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct BillingDepartment {
    pub dept_id: Uuid,
    pub name: String,
    pub code: String,
    pub description: Option<String>,
    pub account_num: String,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

/// Registered integrating system, with callback URLs for forwarding
/// control numbers and payment notifications back to the origin.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct SystemInfo {
    pub system_id: Uuid,
    pub code: String,
    pub name: String,
    pub cntrnum_response_callback: String,
    pub pay_notification_callback: String,
    pub is_active: bool,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

/// Derived bill lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BillStatus {
    Created,
    CnRequested,
    CnIssued,
    Paid,
    Cancelled,
}

impl BillStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::CnRequested => "CN_REQUESTED",
            Self::CnIssued => "CN_ISSUED",
            Self::Paid => "PAID",
            Self::Cancelled => "CANCELLED",
        }
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Bill {
    pub bill_id: String,
    pub group_bill_id: String,
    pub dept_id: Uuid,
    pub customer_id: Uuid,
    pub sys_info_id: Option<Uuid>,
    pub description: Option<String>,
    pub amount: Decimal,
    pub eqv_amount: Decimal,
    pub min_amount: Decimal,
    pub max_amount: Decimal,
    pub currency: String,
    pub exchange_rate: Decimal,
    pub bill_type: i16,
    pub pay_type: i16,
    pub pay_opt: i16,
    pub pay_plan: i16,
    pub pay_lim_type: i16,
    pub gen_date: DateTime<Utc>,
    pub expiry_date: DateTime<Utc>,
    pub gen_by: Option<String>,
    pub appr_by: Option<String>,
    pub control_number: Option<i64>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl Bill {
    /// Bills expire 30 days after generation.
    pub const EXPIRY_DAYS: i64 = 30;

    /// Build a new bill for a department. The bill id is derived from the
    /// department code and the generation timestamp; the group bill id equals
    /// the bill id for normal (non-combined) bills.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        dept: &BillingDepartment,
        customer_id: Uuid,
        sys_info_id: Option<Uuid>,
        description: Option<String>,
        currency: String,
        gen_by: Option<String>,
        appr_by: Option<String>,
        gen_date: DateTime<Utc>,
    ) -> Self {
        let bill_id = format!("{}{}", dept.code, gen_date.format("%Y%m%d%H%M%S%3f"));
        Self {
            group_bill_id: bill_id.clone(),
            bill_id,
            dept_id: dept.dept_id,
            customer_id,
            sys_info_id,
            description,
            amount: Decimal::ZERO,
            eqv_amount: Decimal::ZERO,
            min_amount: Decimal::ZERO,
            max_amount: Decimal::ZERO,
            currency,
            exchange_rate: Decimal::ONE,
            bill_type: 1,
            pay_type: 2,
            pay_opt: 3,
            pay_plan: 1,
            pay_lim_type: 1,
            gen_date,
            expiry_date: gen_date + Duration::days(Self::EXPIRY_DAYS),
            gen_by,
            appr_by,
            control_number: None,
            created_utc: gen_date,
            updated_utc: gen_date,
        }
    }

    /// Set the bill totals from its line items: the amount is the item sum
    /// and the equivalent/min/max amounts follow it for exact-payment bills.
    pub fn apply_item_totals(&mut self, items: &[BillItem]) {
        let total: Decimal = items.iter().map(|i| i.amount).sum();
        self.amount = total;
        self.eqv_amount = total;
        self.min_amount = total;
        self.max_amount = total;
    }

    /// Derive the lifecycle state from related records.
    pub fn derived_status(
        &self,
        has_pending_request: bool,
        has_payment: bool,
        cancellation: Option<&CancelledBill>,
    ) -> BillStatus {
        if let Some(cancelled) = cancellation {
            if cancelled.status == CancelStatus::Cancelled.as_str() {
                return BillStatus::Cancelled;
            }
        }
        if has_payment {
            return BillStatus::Paid;
        }
        if self.control_number.is_some() {
            return BillStatus::CnIssued;
        }
        if has_pending_request {
            return BillStatus::CnRequested;
        }
        BillStatus::Created
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct BillItem {
    pub item_id: Uuid,
    pub bill_id: String,
    pub dept_id: Uuid,
    pub source_name: String,
    pub gfs_code: String,
    pub description: String,
    pub ref_on_pay: String,
    pub qty: i32,
    pub amount: Decimal,
    pub eqv_amount: Decimal,
    pub misc_amount: Decimal,
    pub created_utc: DateTime<Utc>,
}

impl BillItem {
    /// Build a line item; amounts are the quantity times the unit amount.
    pub fn new(
        bill_id: &str,
        dept_id: Uuid,
        source_name: &str,
        gfs_code: &str,
        description: &str,
        qty: i32,
        unit_amount: Decimal,
        now: DateTime<Utc>,
    ) -> Self {
        let amount = unit_amount * Decimal::from(qty);
        Self {
            item_id: Uuid::new_v4(),
            bill_id: bill_id.to_string(),
            dept_id,
            source_name: source_name.to_string(),
            gfs_code: gfs_code.to_string(),
            description: description.to_string(),
            ref_on_pay: "N".to_string(),
            qty,
            amount,
            eqv_amount: amount,
            misc_amount: amount,
            created_utc: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelStatus {
    Pending,
    Cancelled,
    Failed,
    Recreated,
}

impl CancelStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Cancelled => "CANCELLED",
            Self::Failed => "FAILED",
            Self::Recreated => "RECREATED",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "CANCELLED" => Self::Cancelled,
            "FAILED" => Self::Failed,
            "RECREATED" => Self::Recreated,
            _ => Self::Pending,
        }
    }
}

/// Cancellation record, one-to-one with a bill.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct CancelledBill {
    pub bill_id: String,
    pub reason: String,
    pub gen_by: Option<String>,
    pub appr_by: Option<String>,
    pub status: String,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dept() -> BillingDepartment {
        let now = Utc::now();
        BillingDepartment {
            dept_id: Uuid::new_v4(),
            name: "Headquarters".to_string(),
            code: "HQ01".to_string(),
            description: None,
            account_num: "0150211612345".to_string(),
            created_utc: now,
            updated_utc: now,
        }
    }

    #[test]
    fn bill_id_carries_department_code() {
        let d = dept();
        let bill = Bill::new(
            &d,
            Uuid::new_v4(),
            None,
            None,
            "TZS".to_string(),
            None,
            None,
            Utc::now(),
        );
        assert!(bill.bill_id.starts_with("HQ01"));
        assert_eq!(bill.bill_id, bill.group_bill_id);
        assert_eq!(bill.expiry_date - bill.gen_date, Duration::days(30));
    }

    #[test]
    fn item_totals_roll_up() {
        let d = dept();
        let mut bill = Bill::new(
            &d,
            Uuid::new_v4(),
            None,
            None,
            "TZS".to_string(),
            None,
            None,
            Utc::now(),
        );
        let items = vec![
            BillItem::new(
                &bill.bill_id,
                d.dept_id,
                "Research Fees",
                "140101",
                "Ethics review",
                2,
                Decimal::new(50_000, 0),
                Utc::now(),
            ),
            BillItem::new(
                &bill.bill_id,
                d.dept_id,
                "Research Fees",
                "140102",
                "Material transfer",
                1,
                Decimal::new(25_000, 0),
                Utc::now(),
            ),
        ];
        bill.apply_item_totals(&items);
        assert_eq!(bill.amount, Decimal::new(125_000, 0));
        assert_eq!(bill.min_amount, bill.amount);
    }

    #[test]
    fn status_derivation_prefers_cancellation_then_payment() {
        let d = dept();
        let mut bill = Bill::new(
            &d,
            Uuid::new_v4(),
            None,
            None,
            "TZS".to_string(),
            None,
            None,
            Utc::now(),
        );
        assert_eq!(bill.derived_status(false, false, None), BillStatus::Created);
        assert_eq!(
            bill.derived_status(true, false, None),
            BillStatus::CnRequested
        );

        bill.control_number = Some(991234567890);
        assert_eq!(bill.derived_status(true, false, None), BillStatus::CnIssued);
        assert_eq!(bill.derived_status(true, true, None), BillStatus::Paid);

        let cancelled = CancelledBill {
            bill_id: bill.bill_id.clone(),
            reason: "duplicate".to_string(),
            gen_by: None,
            appr_by: None,
            status: CancelStatus::Cancelled.as_str().to_string(),
            created_utc: Utc::now(),
            updated_utc: Utc::now(),
        };
        assert_eq!(
            bill.derived_status(true, true, Some(&cancelled)),
            BillStatus::Cancelled
        );

        // A pending or recreated cancellation does not hide the paid state.
        let recreated = CancelledBill {
            status: CancelStatus::Recreated.as_str().to_string(),
            ..cancelled
        };
        assert_eq!(
            bill.derived_status(true, true, Some(&recreated)),
            BillStatus::Paid
        );
    }
}
