//! Settlement matching rules.
//!
//! A reported settlement record is compared against the internal bill and
//! payment on currency, paid amount, bill amount and control number. The
//! control number comparison is numeric, falling back to a dedicated format
//! error reason when the reported value does not parse.

use crate::models::{Bill, CurrencyTotal, CurrencyTotals, MatchStatus, Payment,
    PaymentReconciliation};
use rust_decimal::Decimal;
use uuid::Uuid;

pub const REASON_CURRENCY_MISMATCH: &str = "currency_mismatch";
pub const REASON_PAID_AMOUNT_MISMATCH: &str = "paid_amount_mismatch";
pub const REASON_BILL_AMOUNT_MISMATCH: &str = "bill_amount_mismatch";
pub const REASON_CONTROL_NUMBER_MISMATCH: &str = "control_number_mismatch";
pub const REASON_CONTROL_NUMBER_FORMAT_ERROR: &str = "control_number_format_error";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchResult {
    pub status: MatchStatus,
    pub reasons: Option<String>,
    pub resolved_bill_id: Option<String>,
    pub resolved_payment_id: Option<Uuid>,
}

/// Match one reported record against the resolved internal state.
pub fn match_settlement(
    record: &PaymentReconciliation,
    bill: Option<&Bill>,
    payment: Option<&Payment>,
) -> MatchResult {
    let Some(bill) = bill else {
        return MatchResult {
            status: MatchStatus::BillNotFound,
            reasons: None,
            resolved_bill_id: None,
            resolved_payment_id: None,
        };
    };

    let Some(payment) = payment else {
        return MatchResult {
            status: MatchStatus::MissingInternalPayment,
            reasons: None,
            resolved_bill_id: Some(bill.bill_id.clone()),
            resolved_payment_id: None,
        };
    };

    let mut reasons: Vec<&str> = Vec::new();

    if record.currency != payment.currency {
        reasons.push(REASON_CURRENCY_MISMATCH);
    }
    if record.paid_amount != payment.paid_amount {
        reasons.push(REASON_PAID_AMOUNT_MISMATCH);
    }
    if record.bill_amount != bill.amount {
        reasons.push(REASON_BILL_AMOUNT_MISMATCH);
    }

    match record.cust_cntr_num.trim().parse::<i64>() {
        Ok(reported_cn) => {
            if bill.control_number != Some(reported_cn) {
                reasons.push(REASON_CONTROL_NUMBER_MISMATCH);
            }
        }
        Err(_) => reasons.push(REASON_CONTROL_NUMBER_FORMAT_ERROR),
    }

    if reasons.is_empty() {
        MatchResult {
            status: MatchStatus::Matched,
            reasons: None,
            resolved_bill_id: Some(bill.bill_id.clone()),
            resolved_payment_id: Some(payment.payment_id),
        }
    } else {
        MatchResult {
            status: MatchStatus::Mismatch,
            reasons: Some(reasons.join(",")),
            resolved_bill_id: Some(bill.bill_id.clone()),
            resolved_payment_id: Some(payment.payment_id),
        }
    }
}

/// Sum amounts and counts per currency.
pub fn currency_totals<I>(entries: I) -> CurrencyTotals
where
    I: IntoIterator<Item = (String, Decimal)>,
{
    let mut totals = CurrencyTotals::new();
    for (currency, amount) in entries {
        let entry = totals.entry(currency).or_insert(CurrencyTotal {
            amount: Decimal::ZERO,
            count: 0,
        });
        entry.amount += amount;
        entry.count += 1;
    }
    totals
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal::Decimal;

    fn record(currency: &str, paid: Decimal, bill_amt: Decimal, cn: &str) -> PaymentReconciliation {
        let now = Utc::now();
        PaymentReconciliation {
            recon_id: Uuid::new_v4(),
            run_req_id: "RUN1".to_string(),
            payref_id: "P1".to_string(),
            bill_id: "B1".to_string(),
            grp_bill_id: "B1".to_string(),
            cust_cntr_num: cn.to_string(),
            psp_code: "PSP".to_string(),
            psp_name: "Bank".to_string(),
            trx_id: "T1".to_string(),
            bill_amount: bill_amt,
            paid_amount: paid,
            currency: currency.to_string(),
            coll_acc_num: "123".to_string(),
            trx_date: None,
            pay_channel: "MOBILE".to_string(),
            trdpty_trx_id: "TP1".to_string(),
            qt_ref_id: None,
            pyr_name: None,
            pyr_cell_num: None,
            pyr_email: None,
            match_status: MatchStatus::MissingInternalPayment.as_str().to_string(),
            mismatch_reasons: None,
            resolved_bill_id: None,
            resolved_payment_id: None,
            created_utc: now,
            updated_utc: now,
        }
    }

    fn bill(amount: Decimal, cn: Option<i64>) -> Bill {
        let now = Utc::now();
        Bill {
            bill_id: "B1".to_string(),
            group_bill_id: "B1".to_string(),
            dept_id: Uuid::new_v4(),
            customer_id: Uuid::new_v4(),
            sys_info_id: None,
            description: None,
            amount,
            eqv_amount: amount,
            min_amount: amount,
            max_amount: amount,
            currency: "TZS".to_string(),
            exchange_rate: Decimal::ONE,
            bill_type: 1,
            pay_type: 2,
            pay_opt: 3,
            pay_plan: 1,
            pay_lim_type: 1,
            gen_date: now,
            expiry_date: now,
            gen_by: None,
            appr_by: None,
            control_number: cn,
            created_utc: now,
            updated_utc: now,
        }
    }

    fn payment(currency: &str, paid: Decimal, cn: i64) -> Payment {
        Payment {
            payment_id: Uuid::new_v4(),
            bill_id: "B1".to_string(),
            cust_cntr_num: cn,
            psp_code: "PSP".to_string(),
            psp_name: "Bank".to_string(),
            trx_id: "T1".to_string(),
            payref_id: "P1".to_string(),
            bill_amount: paid,
            paid_amount: paid,
            currency: currency.to_string(),
            coll_acc_num: "123".to_string(),
            trx_date: Utc::now(),
            pay_channel: "MOBILE".to_string(),
            trdpty_trx_id: "TP1".to_string(),
            pyr_name: None,
            pyr_cell_num: None,
            pyr_email: None,
            created_utc: Utc::now(),
        }
    }

    #[test]
    fn all_fields_agree_is_matched() {
        let amount = Decimal::new(10_000, 2);
        let result = match_settlement(
            &record("TZS", amount, amount, "991234567890"),
            Some(&bill(amount, Some(991234567890))),
            Some(&payment("TZS", amount, 991234567890)),
        );
        assert_eq!(result.status, MatchStatus::Matched);
        assert!(result.reasons.is_none());
        assert!(result.resolved_payment_id.is_some());
    }

    #[test]
    fn currency_disagreement_is_mismatch_with_reason() {
        let amount = Decimal::new(10_000, 2);
        let result = match_settlement(
            &record("USD", amount, amount, "991234567890"),
            Some(&bill(amount, Some(991234567890))),
            Some(&payment("TZS", amount, 991234567890)),
        );
        assert_eq!(result.status, MatchStatus::Mismatch);
        assert_eq!(result.reasons.as_deref(), Some(REASON_CURRENCY_MISMATCH));
    }

    #[test]
    fn several_disagreements_join_reasons() {
        let result = match_settlement(
            &record(
                "USD",
                Decimal::new(5_000, 2),
                Decimal::new(20_000, 2),
                "111111111111",
            ),
            Some(&bill(Decimal::new(10_000, 2), Some(991234567890))),
            Some(&payment("TZS", Decimal::new(10_000, 2), 991234567890)),
        );
        assert_eq!(result.status, MatchStatus::Mismatch);
        let reasons = result.reasons.unwrap();
        assert_eq!(
            reasons,
            format!(
                "{},{},{},{}",
                REASON_CURRENCY_MISMATCH,
                REASON_PAID_AMOUNT_MISMATCH,
                REASON_BILL_AMOUNT_MISMATCH,
                REASON_CONTROL_NUMBER_MISMATCH
            )
        );
    }

    #[test]
    fn unparseable_control_number_is_format_error() {
        let amount = Decimal::new(10_000, 2);
        let result = match_settlement(
            &record("TZS", amount, amount, "99-12-3456"),
            Some(&bill(amount, Some(991234567890))),
            Some(&payment("TZS", amount, 991234567890)),
        );
        assert_eq!(result.status, MatchStatus::Mismatch);
        assert_eq!(
            result.reasons.as_deref(),
            Some(REASON_CONTROL_NUMBER_FORMAT_ERROR)
        );
    }

    #[test]
    fn missing_bill_and_missing_payment_statuses() {
        let amount = Decimal::new(10_000, 2);
        let r = record("TZS", amount, amount, "991234567890");
        assert_eq!(
            match_settlement(&r, None, None).status,
            MatchStatus::BillNotFound
        );
        let b = bill(amount, Some(991234567890));
        let result = match_settlement(&r, Some(&b), None);
        assert_eq!(result.status, MatchStatus::MissingInternalPayment);
        assert_eq!(result.resolved_bill_id.as_deref(), Some("B1"));
    }

    #[test]
    fn totals_accumulate_per_currency() {
        let totals = currency_totals(vec![
            ("TZS".to_string(), Decimal::new(10_000, 2)),
            ("TZS".to_string(), Decimal::new(5_000, 2)),
            ("USD".to_string(), Decimal::new(100, 2)),
        ]);
        assert_eq!(totals["TZS"].amount, Decimal::new(15_000, 2));
        assert_eq!(totals["TZS"].count, 2);
        assert_eq!(totals["USD"].count, 1);
    }
}
