//! Reconciliation engine.
//!
//! Drives the per-date run state machine (REQUESTED → ACKED → RECEIVED →
//! PROCESSED → CLOSED, ERROR from any non-closed state), ingests reported
//! settlement records, matches them against internal payments and repairs
//! missing internal records. A CLOSED run is immutable: every write in here
//! goes through store operations that refuse to touch closed runs.

pub mod matching;

use crate::gateway::payload::{PmtTrxDtl, ReconciliationResponse};
use crate::models::{MatchStatus, Payment, PaymentReconciliation, RunStatus};
use crate::services::store::{BillingStore, PaymentOutcome};
use crate::workers::jobs::parse_trx_datetime;
use chrono::Utc;
use rust_decimal::Decimal;
use service_core::error::AppError;
use std::str::FromStr;
use uuid::Uuid;

pub use matching::{MatchResult, currency_totals, match_settlement};

#[derive(Debug, Default)]
pub struct ProcessOutcome {
    pub processed: usize,
    /// True when the response arrived for an already-closed run and was
    /// discarded without touching any state.
    pub discarded: bool,
}

#[derive(Debug, Default)]
pub struct AutoRepairOutcome {
    pub repaired: usize,
    pub rematched: usize,
}

fn settlement_row(run_req_id: &str, dtl: &PmtTrxDtl) -> PaymentReconciliation {
    let now = Utc::now();
    PaymentReconciliation {
        recon_id: Uuid::new_v4(),
        run_req_id: run_req_id.to_string(),
        payref_id: dtl.payref_id.clone(),
        bill_id: dtl.bill_id.trim().to_string(),
        grp_bill_id: dtl.grp_bill_id.trim().to_string(),
        cust_cntr_num: dtl.cust_cntr_num.trim().to_string(),
        psp_code: dtl.psp_code.trim().to_string(),
        psp_name: dtl.psp_name.trim().to_string(),
        trx_id: dtl.trx_id.trim().to_string(),
        bill_amount: Decimal::from_str(dtl.bill_amt.trim()).unwrap_or(Decimal::ZERO),
        paid_amount: Decimal::from_str(dtl.paid_amt.trim()).unwrap_or(Decimal::ZERO),
        currency: dtl.ccy.trim().to_string(),
        coll_acc_num: dtl.coll_acc_num.trim().to_string(),
        trx_date: parse_trx_datetime(&dtl.trx_dt_tm),
        pay_channel: dtl.usd_pay_chnl.trim().to_string(),
        trdpty_trx_id: dtl.trdpty_trx_id.trim().to_string(),
        qt_ref_id: non_empty(&dtl.qt_ref_id),
        pyr_name: non_empty(&dtl.pyr_name),
        pyr_cell_num: non_empty(&dtl.pyr_cell_num),
        pyr_email: non_empty(&dtl.pyr_email),
        match_status: MatchStatus::MissingInternalPayment.as_str().to_string(),
        mismatch_reasons: None,
        resolved_bill_id: None,
        resolved_payment_id: None,
        created_utc: now,
        updated_utc: now,
    }
}

fn non_empty(s: &str) -> Option<String> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

async fn resolve_bill(
    store: &dyn BillingStore,
    record: &PaymentReconciliation,
) -> Result<Option<crate::models::Bill>, AppError> {
    if let Some(bill) = store.get_bill(&record.bill_id).await? {
        return Ok(Some(bill));
    }
    store.get_bill_by_group_id(&record.grp_bill_id).await
}

/// Ingest a reconciliation response for an open run: upsert each reported
/// record by `payref_id`, match it, recompute per-currency totals and move
/// the run to PROCESSED. Re-processing the identical response is a no-op
/// beyond refreshed timestamps.
pub async fn process_response(
    store: &dyn BillingStore,
    response: &ReconciliationResponse,
) -> Result<ProcessOutcome, AppError> {
    let req_id = &response.req_id;

    let run = store
        .get_run(req_id)
        .await?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("unknown reconciliation run {}", req_id)))?;

    if run.is_closed() {
        return Ok(ProcessOutcome {
            processed: 0,
            discarded: true,
        });
    }

    store
        .transition_run(
            req_id,
            &[
                RunStatus::Requested,
                RunStatus::Acked,
                RunStatus::Received,
                RunStatus::Processed,
            ],
            RunStatus::Received,
            Some(&format!(
                "Reconciliation response received: {}",
                response.pay_sts_desc
            )),
        )
        .await?;

    for dtl in &response.details.records {
        if dtl.payref_id.trim().is_empty() {
            tracing::warn!(req_id = %req_id, "Skipping settlement record without payref id");
            continue;
        }

        let row = settlement_row(req_id, dtl);
        store.upsert_reconciliation_record(row.clone()).await?;

        let Some(current) = store.get_reconciliation_record(&row.payref_id).await? else {
            // Run closed between the guard and the upsert.
            continue;
        };

        // An auto-created record keeps its status; the repair already
        // reconciled it and re-matching would erase that audit marker.
        if current.match_status == MatchStatus::AutoCreated.as_str() {
            continue;
        }

        let bill = resolve_bill(store, &current).await?;
        let payment = match &bill {
            Some(bill) => store.get_payment_for_bill(&bill.bill_id).await?,
            None => None,
        };

        let result = match_settlement(&current, bill.as_ref(), payment.as_ref());
        store
            .update_record_match(
                &current.payref_id,
                result.status,
                result.reasons.as_deref(),
                result.resolved_bill_id.as_deref(),
                result.resolved_payment_id,
            )
            .await?;
    }

    let processed = response.details.records.len();
    refresh_totals(store, req_id).await?;

    store
        .transition_run(
            req_id,
            &[RunStatus::Received],
            RunStatus::Processed,
            Some(&format!("{} settlement records processed", processed)),
        )
        .await?;

    Ok(ProcessOutcome {
        processed,
        discarded: false,
    })
}

/// Recompute aggregate totals for a run: reported totals over every record,
/// internal totals over the records whose internal payment resolved. A
/// currency present on only one side makes the maps unequal, which is the
/// intended mismatch semantics.
pub async fn refresh_totals(store: &dyn BillingStore, req_id: &str) -> Result<bool, AppError> {
    let records = store.records_for_run(req_id).await?;

    let reported = currency_totals(
        records
            .iter()
            .map(|r| (r.currency.clone(), r.paid_amount)),
    );

    let mut internal_entries = Vec::new();
    for record in &records {
        let Some(bill_id) = record.resolved_bill_id.as_deref() else {
            continue;
        };
        if let Some(payment) = store.get_payment_for_bill(bill_id).await? {
            internal_entries.push((payment.currency.clone(), payment.paid_amount));
        }
    }
    let internal = currency_totals(internal_entries);

    let totals_match = reported == internal;

    let reported_json = serde_json::to_string(&reported)
        .map_err(|e| AppError::InternalError(anyhow::anyhow!("totals encoding failed: {}", e)))?;
    let internal_json = serde_json::to_string(&internal)
        .map_err(|e| AppError::InternalError(anyhow::anyhow!("totals encoding failed: {}", e)))?;

    store
        .set_run_totals(req_id, &reported_json, &internal_json, totals_match)
        .await?;

    Ok(totals_match)
}

/// Create missing internal payments from reported settlement records.
///
/// Runs after processing; aborts as soon as the run is found closed. A
/// concurrent writer winning the unique constraint is handled by re-matching
/// instead of failing.
pub async fn auto_repair(
    store: &dyn BillingStore,
    run_req_id: &str,
) -> Result<AutoRepairOutcome, AppError> {
    let run = store.get_run(run_req_id).await?.ok_or_else(|| {
        AppError::NotFound(anyhow::anyhow!("unknown reconciliation run {}", run_req_id))
    })?;

    if run.is_closed() {
        tracing::warn!(run_req_id = run_req_id, "Auto-repair skipped: run is closed");
        return Ok(AutoRepairOutcome::default());
    }

    let missing = store
        .records_with_match_status(run_req_id, MatchStatus::MissingInternalPayment)
        .await?;

    let mut outcome = AutoRepairOutcome::default();

    for record in missing {
        // Cut-off may land while repairing; abort rather than mutate.
        let still_open = store
            .get_run(run_req_id)
            .await?
            .map(|r| !r.is_closed())
            .unwrap_or(false);
        if !still_open {
            tracing::warn!(run_req_id = run_req_id, "Auto-repair aborted: run closed mid-pass");
            break;
        }

        let Some(bill_id) = record.resolved_bill_id.clone() else {
            continue;
        };
        let Some(bill) = store.get_bill(&bill_id).await? else {
            continue;
        };

        let cust_cntr_num = match record.cust_cntr_num.trim().parse::<i64>() {
            Ok(cn) => cn,
            Err(_) => match bill.control_number {
                Some(cn) => cn,
                None => {
                    tracing::warn!(
                        payref_id = %record.payref_id,
                        "Cannot repair payment without a usable control number"
                    );
                    continue;
                }
            },
        };

        let payment = Payment {
            payment_id: Uuid::new_v4(),
            bill_id: bill.bill_id.clone(),
            cust_cntr_num,
            psp_code: record.psp_code.clone(),
            psp_name: record.psp_name.clone(),
            trx_id: record.trx_id.clone(),
            payref_id: record.payref_id.clone(),
            bill_amount: record.bill_amount,
            paid_amount: record.paid_amount,
            currency: record.currency.clone(),
            coll_acc_num: record.coll_acc_num.clone(),
            trx_date: record.trx_date.unwrap_or_else(Utc::now),
            pay_channel: record.pay_channel.clone(),
            trdpty_trx_id: record.trdpty_trx_id.clone(),
            pyr_name: record.pyr_name.clone(),
            pyr_cell_num: record.pyr_cell_num.clone(),
            pyr_email: record.pyr_email.clone(),
            created_utc: Utc::now(),
        };

        match store.create_payment_if_absent(payment).await? {
            PaymentOutcome::Created(payment) => {
                store
                    .update_record_match(
                        &record.payref_id,
                        MatchStatus::AutoCreated,
                        None,
                        Some(&bill.bill_id),
                        Some(payment.payment_id),
                    )
                    .await?;
                outcome.repaired += 1;
                tracing::info!(
                    payref_id = %record.payref_id,
                    bill_id = %bill.bill_id,
                    "Missing internal payment auto-created"
                );
            }
            PaymentOutcome::AlreadyExists(existing) => {
                // Lost the race: recompute the match against the winner.
                let result = match_settlement(&record, Some(&bill), Some(&existing));
                store
                    .update_record_match(
                        &record.payref_id,
                        result.status,
                        result.reasons.as_deref(),
                        result.resolved_bill_id.as_deref(),
                        result.resolved_payment_id,
                    )
                    .await?;
                outcome.rematched += 1;
            }
        }
    }

    if outcome.repaired > 0 {
        refresh_totals(store, run_req_id).await?;
    }

    Ok(outcome)
}
