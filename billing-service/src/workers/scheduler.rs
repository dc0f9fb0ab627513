//! Daily reconciliation trigger.
//!
//! Scans the previous business date plus a bounded backfill window and
//! requests reconciliation for any date lacking a non-ERROR run, so failed
//! dates are retried while completed dates are never re-requested.

use crate::config::ReconciliationConfig;
use crate::models::ReconciliationRun;
use crate::services::store::BillingStore;
use crate::workers::jobs::Job;
use crate::workers::orchestrator::JobQueue;
use chrono::{Duration, NaiveDate, Utc};
use service_core::error::AppError;
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Request reconciliation for every date in `(today - backfill_days, today)`
/// that has no active (non-ERROR) run. Returns the `(req_id, date)` pairs
/// that were enqueued.
pub async fn trigger_due_reconciliations(
    store: &dyn BillingStore,
    queue: &JobQueue,
    backfill_days: i64,
    today: NaiveDate,
) -> Result<Vec<(String, NaiveDate)>, AppError> {
    let mut triggered = Vec::new();

    for offset in 1..=backfill_days.max(1) {
        let trx_date = today - Duration::days(offset);

        if store.date_has_active_run(trx_date).await? {
            continue;
        }

        let req_id = Uuid::new_v4().to_string();
        match store
            .insert_run(ReconciliationRun::new(&req_id, trx_date))
            .await
        {
            Ok(()) => {}
            Err(AppError::Conflict(_)) => continue,
            Err(e) => return Err(e),
        }

        queue.enqueue(Job::SendReconciliationRequest {
            req_id: req_id.clone(),
            trx_date,
        })?;

        tracing::info!(req_id = %req_id, trx_date = %trx_date, "Reconciliation requested");
        triggered.push((req_id, trx_date));
    }

    Ok(triggered)
}

/// Spawn the periodic trigger loop.
pub fn spawn_reconciliation_trigger(
    config: ReconciliationConfig,
    store: Arc<dyn BillingStore>,
    queue: JobQueue,
    shutdown: CancellationToken,
) {
    if !config.trigger_enabled {
        tracing::info!("Reconciliation trigger disabled by configuration");
        return;
    }

    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(StdDuration::from_secs(config.trigger_interval_secs.max(1)));

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Reconciliation trigger shutting down");
                    break;
                }
                _ = interval.tick() => {
                    let today = Utc::now().date_naive();
                    match trigger_due_reconciliations(
                        store.as_ref(),
                        &queue,
                        config.backfill_days,
                        today,
                    )
                    .await
                    {
                        Ok(triggered) if !triggered.is_empty() => {
                            tracing::info!(count = triggered.len(), "Reconciliation dates triggered");
                        }
                        Ok(_) => {}
                        Err(e) => {
                            tracing::error!(error = %e, "Reconciliation trigger scan failed");
                        }
                    }
                }
            }
        }
    });
}
