//! Worker pool for gateway jobs.
//!
//! Jobs are fire-and-forget units dispatched round-robin to a fixed pool.
//! Each execution runs under an exponential-backoff retry loop; job bodies
//! classify failures as transient (retried) or permanent (recorded and
//! dropped). Delivery is at-least-once, so every job body is idempotent.

use crate::config::WorkerConfig;
use crate::workers::jobs::{Job, JobContext, JobError};
use backoff::ExponentialBackoff;
use backoff::future::retry;
use service_core::error::AppError;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Cloneable handle for enqueueing jobs from handlers and other jobs.
#[derive(Clone)]
pub struct JobQueue {
    tx: mpsc::Sender<Job>,
}

impl JobQueue {
    pub fn enqueue(&self, job: Job) -> Result<(), AppError> {
        self.tx
            .try_send(job)
            .map_err(|_| AppError::InternalError(anyhow::anyhow!("Job queue full")))
    }
}

pub struct WorkerOrchestrator {
    config: WorkerConfig,
    ctx: JobContext,
    job_rx: Option<mpsc::Receiver<Job>>,
    shutdown_token: CancellationToken,
}

impl WorkerOrchestrator {
    /// Create the queue channel and hand back the enqueue side.
    ///
    /// `make_ctx` receives the queue so job bodies can enqueue follow-up
    /// jobs (deliveries, auto-repair) through the same pool.
    pub fn new(
        config: WorkerConfig,
        make_ctx: impl FnOnce(JobQueue) -> JobContext,
    ) -> (Self, JobQueue) {
        let (tx, rx) = mpsc::channel(config.queue_size);
        let queue = JobQueue { tx };
        let ctx = make_ctx(queue.clone());

        let orchestrator = Self {
            config,
            ctx,
            job_rx: Some(rx),
            shutdown_token: CancellationToken::new(),
        };

        (orchestrator, queue)
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    pub async fn start(mut self) {
        if !self.config.enabled {
            tracing::info!("Worker pool disabled by configuration");
            return;
        }

        let mut job_rx = self.job_rx.take().expect("start() can only be called once");

        tracing::info!(
            worker_count = self.config.worker_count,
            "Starting worker pool"
        );

        let mut workers = Vec::new();
        for worker_id in 0..self.config.worker_count.max(1) {
            workers.push(Worker {
                id: worker_id,
                ctx: self.ctx.clone(),
            });
        }

        let shutdown = self.shutdown_token.clone();

        tokio::spawn(async move {
            let mut next_worker = 0;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::info!("Job distributor shutting down");
                        break;
                    }
                    job = job_rx.recv() => {
                        match job {
                            Some(job) => {
                                let worker = &workers[next_worker];
                                next_worker = (next_worker + 1) % workers.len();

                                tracing::debug!(
                                    worker_id = worker.id,
                                    job = %job.label(),
                                    "Dispatching job to worker"
                                );

                                let worker_clone = worker.clone();
                                tokio::spawn(async move {
                                    worker_clone.process_job(job).await;
                                });
                            }
                            None => {
                                tracing::info!("Channel closed, job distributor exiting");
                                break;
                            }
                        }
                    }
                }
            }
        });
    }

    pub async fn shutdown(&self) {
        tracing::info!("Initiating worker pool shutdown");
        self.shutdown_token.cancel();
    }
}

#[derive(Clone)]
struct Worker {
    id: usize,
    ctx: JobContext,
}

impl Worker {
    async fn process_job(&self, job: Job) {
        let label = job.label();
        let start = Instant::now();

        tracing::info!(worker_id = self.id, job = %label, "Processing job started");
        metrics::counter!("billing_jobs_total", "job" => label).increment(1);

        let backoff: ExponentialBackoff = job.retry_policy(&self.ctx);

        let result = retry(backoff, || async {
            self.ctx.run(&job).await.map_err(|e| match e {
                JobError::Transient(err) => backoff::Error::transient(err),
                JobError::Permanent(err) => backoff::Error::permanent(err),
            })
        })
        .await;

        match result {
            Ok(()) => {
                metrics::counter!("billing_jobs_succeeded", "job" => label).increment(1);
                metrics::histogram!("billing_job_duration_seconds", "job" => label)
                    .record(start.elapsed().as_secs_f64());
                tracing::info!(
                    worker_id = self.id,
                    job = %label,
                    duration_ms = start.elapsed().as_millis(),
                    "Job succeeded"
                );
            }
            Err(e) => {
                metrics::counter!("billing_jobs_failed", "job" => label).increment(1);
                tracing::error!(
                    worker_id = self.id,
                    job = %label,
                    error = %e,
                    "Job failed after retries"
                );
                // Terminal bookkeeping: ledger ERROR + operator notification.
                self.ctx.on_exhausted(&job, &e).await;
            }
        }
    }
}
