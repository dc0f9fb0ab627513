//! Bill submission and lifecycle endpoints for integrating systems.

use crate::models::{
    Bill, BillItem, CancelStatus, CancelledBill, Customer, CustomerIdType, IdempotencyRecord,
    LogStatus,
};
use crate::services::store::{BillingStore, IdempotencyOutcome};
use crate::startup::AppState;
use crate::workers::Job;
use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use sha2::{Digest, Sha256};
use uuid::Uuid;
use validator::Validate;

#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct CustomerPayload {
    #[validate(length(min = 1, max = 66))]
    pub first_name: String,
    pub middle_name: Option<String>,
    #[validate(length(min = 1, max = 66))]
    pub last_name: String,
    pub tin: Option<String>,
    pub id_num: Option<String>,
    pub id_type: Option<String>,
    #[validate(length(equal = 12))]
    pub cell_num: Option<String>,
    #[validate(email)]
    pub email: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct BillItemPayload {
    #[validate(length(min = 1))]
    pub source_name: String,
    #[validate(length(min = 1, max = 20))]
    pub gfs_code: String,
    #[validate(length(min = 1, max = 255))]
    pub description: String,
    #[serde(default = "default_qty")]
    pub qty: i32,
    pub unit_amount: Decimal,
}

fn default_qty() -> i32 {
    1
}

#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct SubmitBillRequest {
    /// Integrating system code; omitted for bills raised internally.
    pub sys_code: Option<String>,
    /// Billing department (collection center) name.
    #[validate(length(min = 1))]
    pub dept: String,
    pub description: Option<String>,
    #[serde(default = "default_currency")]
    pub currency: String,
    #[validate(nested)]
    pub customer: CustomerPayload,
    #[validate(length(min = 1), nested)]
    pub items: Vec<BillItemPayload>,
}

fn default_currency() -> String {
    "TZS".to_string()
}

#[derive(Debug, Serialize)]
pub struct SubmitBillResponse {
    pub req_id: String,
    pub bill_id: String,
}

fn body_hash(payload: &SubmitBillRequest) -> Result<String, AppError> {
    let canonical = serde_json::to_string(payload)
        .map_err(|e| AppError::InternalError(anyhow::anyhow!("payload hashing failed: {}", e)))?;
    Ok(hex_digest(&canonical))
}

fn hex_digest(s: &str) -> String {
    let digest = Sha256::digest(s.as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Submit a bill and request a control number.
///
/// Idempotent on the payload body: re-submitting the identical payload
/// replays the original `(req_id, bill_id)` pair without creating a second
/// bill or gateway request.
pub async fn submit_bill(
    State(state): State<AppState>,
    Json(payload): Json<SubmitBillRequest>,
) -> Result<(StatusCode, Json<SubmitBillResponse>), AppError> {
    payload.validate()?;

    let hash = body_hash(&payload)?;
    if let Some(existing) = state.store.get_idempotency_record(&hash).await? {
        tracing::info!(
            req_id = %existing.req_id,
            bill_id = %existing.bill_id,
            "Idempotent bill submission replayed"
        );
        return Ok((
            StatusCode::OK,
            Json(SubmitBillResponse {
                req_id: existing.req_id,
                bill_id: existing.bill_id,
            }),
        ));
    }

    let dept = state
        .store
        .get_department_by_name(&payload.dept)
        .await?
        .ok_or_else(|| {
            AppError::BadRequest(anyhow::anyhow!("unknown billing department '{}'", payload.dept))
        })?;

    let sys_info = match payload.sys_code.as_deref() {
        Some(code) => Some(
            state
                .store
                .get_system_info_by_code(code)
                .await?
                .filter(|s| s.is_active)
                .ok_or_else(|| {
                    AppError::BadRequest(anyhow::anyhow!("unknown integrating system '{}'", code))
                })?,
        ),
        None => None,
    };

    let now = Utc::now();
    let customer = state
        .store
        .upsert_customer_by_email(Customer {
            customer_id: Uuid::new_v4(),
            first_name: payload.customer.first_name.clone(),
            middle_name: payload.customer.middle_name.clone(),
            last_name: payload.customer.last_name.clone(),
            tin: payload.customer.tin.clone(),
            id_num: payload
                .customer
                .id_num
                .clone()
                .unwrap_or_else(|| "19000715-00001-00001-01".to_string()),
            id_type: payload
                .customer
                .id_type
                .clone()
                .unwrap_or_else(|| CustomerIdType::NationalId.as_str().to_string()),
            account_num: None,
            cell_num: payload.customer.cell_num.clone(),
            email: payload.customer.email.clone(),
            created_utc: now,
            updated_utc: now,
        })
        .await?;

    let gen_by = customer.full_name();
    let mut bill = Bill::new(
        &dept,
        customer.customer_id,
        sys_info.as_ref().map(|s| s.system_id),
        payload.description.clone(),
        payload.currency.clone(),
        Some(gen_by.clone()),
        Some(gen_by),
        now,
    );

    let items: Vec<BillItem> = payload
        .items
        .iter()
        .map(|item| {
            BillItem::new(
                &bill.bill_id,
                dept.dept_id,
                &item.source_name,
                &item.gfs_code,
                &item.description,
                item.qty.max(1),
                item.unit_amount,
                now,
            )
        })
        .collect();
    bill.apply_item_totals(&items);

    let bill_id = bill.bill_id.clone();
    state.store.insert_bill(bill, items).await?;

    let req_id = Uuid::new_v4().to_string();
    match state
        .store
        .record_idempotency(IdempotencyRecord {
            body_hash: hash,
            req_id: req_id.clone(),
            bill_id: bill_id.clone(),
            created_utc: now,
        })
        .await?
    {
        IdempotencyOutcome::Recorded => {}
        IdempotencyOutcome::Existing(existing) => {
            // Lost a race against an identical concurrent submission;
            // answer with the winner's pair.
            tracing::warn!(
                bill_id = %bill_id,
                winner_bill_id = %existing.bill_id,
                "Concurrent duplicate submission; replaying winner"
            );
            return Ok((
                StatusCode::OK,
                Json(SubmitBillResponse {
                    req_id: existing.req_id,
                    bill_id: existing.bill_id,
                }),
            ));
        }
    }

    state.queue.enqueue(Job::SendControlNumberRequest {
        req_id: req_id.clone(),
        bill_id: bill_id.clone(),
    })?;

    tracing::info!(req_id = %req_id, bill_id = %bill_id, "Bill submitted");

    Ok((
        StatusCode::CREATED,
        Json(SubmitBillResponse { req_id, bill_id }),
    ))
}

#[derive(Debug, Deserialize, Validate)]
pub struct ResubmitBillRequest {
    pub description: Option<String>,
    #[validate(length(min = 1), nested)]
    pub items: Vec<BillItemPayload>,
}

/// Edit flow: update the bill's items and request a fresh control number.
/// An existing cancellation record flips to RECREATED.
pub async fn resubmit_bill(
    State(state): State<AppState>,
    Path(bill_id): Path<String>,
    Json(payload): Json<ResubmitBillRequest>,
) -> Result<(StatusCode, Json<SubmitBillResponse>), AppError> {
    payload.validate()?;

    let mut bill = state
        .store
        .get_bill(&bill_id)
        .await?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("bill {} not found", bill_id)))?;

    let now = Utc::now();
    let items: Vec<BillItem> = payload
        .items
        .iter()
        .map(|item| {
            BillItem::new(
                &bill.bill_id,
                bill.dept_id,
                &item.source_name,
                &item.gfs_code,
                &item.description,
                item.qty.max(1),
                item.unit_amount,
                now,
            )
        })
        .collect();

    if let Some(description) = payload.description.clone() {
        bill.description = Some(description);
    }
    bill.apply_item_totals(&items);
    state.store.update_bill(bill, items).await?;

    // A re-issued bill gets a new control number from scratch.
    state.store.clear_control_number(&bill_id).await?;

    if state.store.get_cancelled_bill(&bill_id).await?.is_some() {
        state
            .store
            .set_cancelled_status(&bill_id, CancelStatus::Recreated)
            .await?;
    }

    let req_id = Uuid::new_v4().to_string();
    state.queue.enqueue(Job::SendControlNumberRequest {
        req_id: req_id.clone(),
        bill_id: bill_id.clone(),
    })?;

    tracing::info!(req_id = %req_id, bill_id = %bill_id, "Bill re-submitted");

    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitBillResponse { req_id, bill_id }),
    ))
}

#[derive(Debug, Serialize)]
pub struct BillStatusResponse {
    pub bill_id: String,
    pub status: String,
    pub control_number: Option<i64>,
    pub amount: Decimal,
    pub currency: String,
    /// Latest gateway ledger status for the bill, verbatim.
    pub request_status: Option<String>,
    pub request_status_desc: Option<String>,
    pub req_id: Option<String>,
}

/// Status check: derived bill state plus the latest ledger row.
pub async fn bill_status(
    State(state): State<AppState>,
    Path(bill_id): Path<String>,
) -> Result<Json<BillStatusResponse>, AppError> {
    let bill = state
        .store
        .get_bill(&bill_id)
        .await?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("bill {} not found", bill_id)))?;

    let latest_log = state.store.latest_log_for_bill(&bill_id).await?;
    let payment = state.store.get_payment_for_bill(&bill_id).await?;
    let cancelled = state.store.get_cancelled_bill(&bill_id).await?;

    let has_pending_request = latest_log
        .as_ref()
        .map(|log| log.status != LogStatus::Error.as_str())
        .unwrap_or(false);

    let status = bill.derived_status(has_pending_request, payment.is_some(), cancelled.as_ref());

    Ok(Json(BillStatusResponse {
        bill_id: bill.bill_id.clone(),
        status: status.as_str().to_string(),
        control_number: bill.control_number,
        amount: bill.amount,
        currency: bill.currency.clone(),
        request_status: latest_log.as_ref().map(|l| l.status.clone()),
        request_status_desc: latest_log.as_ref().map(|l| l.status_desc.clone()),
        req_id: latest_log.as_ref().map(|l| l.req_id.clone()),
    }))
}

#[derive(Debug, Deserialize, Validate)]
pub struct CancelBillRequest {
    #[validate(length(min = 1, max = 255))]
    pub reason: String,
    pub gen_by: Option<String>,
    pub appr_by: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CancelBillResponse {
    pub req_id: String,
    pub bill_id: String,
    pub status: String,
}

/// Request cancellation of an issued bill at the gateway.
pub async fn cancel_bill(
    State(state): State<AppState>,
    Path(bill_id): Path<String>,
    Json(payload): Json<CancelBillRequest>,
) -> Result<(StatusCode, Json<CancelBillResponse>), AppError> {
    payload.validate()?;

    let bill = state
        .store
        .get_bill(&bill_id)
        .await?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("bill {} not found", bill_id)))?;

    if bill.control_number.is_none() {
        return Err(AppError::Conflict(anyhow::anyhow!(
            "bill {} has no control number to cancel",
            bill_id
        )));
    }

    let now = Utc::now();
    state
        .store
        .upsert_cancelled_bill(CancelledBill {
            bill_id: bill_id.clone(),
            reason: payload.reason.clone(),
            gen_by: payload.gen_by.clone(),
            appr_by: payload.appr_by.clone(),
            status: CancelStatus::Pending.as_str().to_string(),
            created_utc: now,
            updated_utc: now,
        })
        .await?;

    let req_id = Uuid::new_v4().to_string();
    state.queue.enqueue(Job::SendCancellationRequest {
        req_id: req_id.clone(),
        bill_id: bill_id.clone(),
    })?;

    tracing::info!(req_id = %req_id, bill_id = %bill_id, "Bill cancellation requested");

    Ok((
        StatusCode::ACCEPTED,
        Json(CancelBillResponse {
            req_id,
            bill_id,
            status: CancelStatus::Pending.as_str().to_string(),
        }),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_payloads_hash_identically() {
        let payload = SubmitBillRequest {
            sys_code: None,
            dept: "HQ".to_string(),
            description: Some("Research clearance".to_string()),
            currency: "TZS".to_string(),
            customer: CustomerPayload {
                first_name: "Amina".to_string(),
                middle_name: None,
                last_name: "Mushi".to_string(),
                tin: None,
                id_num: None,
                id_type: None,
                cell_num: None,
                email: Some("amina@example.org".to_string()),
            },
            items: vec![BillItemPayload {
                source_name: "Research Fees".to_string(),
                gfs_code: "140101".to_string(),
                description: "Ethics review".to_string(),
                qty: 1,
                unit_amount: Decimal::new(50_000, 0),
            }],
        };
        let other = serde_json::from_str::<SubmitBillRequest>(
            &serde_json::to_string(&payload).unwrap(),
        )
        .unwrap();
        assert_eq!(body_hash(&payload).unwrap(), body_hash(&other).unwrap());
    }
}
