//! Operator endpoints for reconciliation runs.

use crate::models::{PaymentReconciliation, ReconciliationRun};
use crate::services::store::BillingStore;
use crate::startup::AppState;
use axum::{
    Json,
    extract::{Path, State},
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use service_core::error::AppError;

#[derive(Debug, Default, Deserialize)]
pub struct CloseRunRequest {
    /// Close even when the run has not reached PROCESSED.
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Serialize)]
pub struct CloseRunResponse {
    pub req_id: String,
    pub trx_date: NaiveDate,
    pub status: String,
}

fn parse_date(raw: &str) -> Result<NaiveDate, AppError> {
    raw.parse().map_err(|_| {
        AppError::BadRequest(anyhow::anyhow!("invalid date '{}'; expected YYYY-MM-DD", raw))
    })
}

/// Close the latest run for a business date, enforcing the cut-off control.
pub async fn close_run(
    State(state): State<AppState>,
    Path(date): Path<String>,
    payload: Option<Json<CloseRunRequest>>,
) -> Result<Json<CloseRunResponse>, AppError> {
    let trx_date = parse_date(&date)?;
    let force = payload.map(|Json(p)| p.force).unwrap_or(false);

    let run = state
        .store
        .latest_run_for_date(trx_date)
        .await?
        .ok_or_else(|| {
            AppError::NotFound(anyhow::anyhow!("no reconciliation runs found for {}", trx_date))
        })?;

    if !state.store.close_run(&run.req_id, force).await? {
        return Err(AppError::Conflict(anyhow::anyhow!(
            "run {} status is {}; re-run reconciliation or use force to close",
            run.req_id,
            run.status
        )));
    }

    let closed = state
        .store
        .get_run(&run.req_id)
        .await?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("run {} disappeared", run.req_id)))?;

    tracing::info!(req_id = %closed.req_id, trx_date = %trx_date, "Reconciliation run closed");

    Ok(Json(CloseRunResponse {
        req_id: closed.req_id,
        trx_date,
        status: closed.status,
    }))
}

#[derive(Debug, Serialize)]
pub struct RunDetailResponse {
    #[serde(flatten)]
    pub run: ReconciliationRun,
    pub records: Vec<PaymentReconciliation>,
}

/// Operational view of the latest run for a date, with its records.
pub async fn run_detail(
    State(state): State<AppState>,
    Path(date): Path<String>,
) -> Result<Json<RunDetailResponse>, AppError> {
    let trx_date = parse_date(&date)?;

    let run = state
        .store
        .latest_run_for_date(trx_date)
        .await?
        .ok_or_else(|| {
            AppError::NotFound(anyhow::anyhow!("no reconciliation runs found for {}", trx_date))
        })?;

    let records = state.store.records_for_run(&run.req_id).await?;

    Ok(Json(RunDetailResponse { run, records }))
}
