//! Application startup and lifecycle management.
//!
//! Wires the store backend, gateway client, signer, worker pool and
//! reconciliation trigger, and serves the HTTP surface: integrating-system
//! APIs, gateway callbacks, reconciliation operations and health/metrics.

use crate::config::{Config, DatabaseBackend};
use crate::gateway::client::{CallbackForwarder, GatewayClient};
use crate::gateway::signer::{HmacSigner, PayloadSigner};
use crate::handlers;
use crate::services::{
    BillingStore, EmailDelivery, MemoryStore, NoopNotifier, PgStore, SmtpNotifier, init_metrics,
};
use crate::workers::{JobContext, JobQueue, WorkerOrchestrator, spawn_reconciliation_trigger};
use axum::middleware::from_fn;
use axum::{
    Router,
    routing::{get, post, put},
};
use secrecy::ExposeSecret;
use service_core::error::AppError;
use service_core::middleware::tracing::request_id_middleware;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn BillingStore>,
    pub signer: Arc<dyn PayloadSigner>,
    pub queue: JobQueue,
    pub config: Config,
}

/// Application container for managing server lifecycle.
pub struct Application {
    port: u16,
    listener: TcpListener,
    state: AppState,
    orchestrator: WorkerOrchestrator,
    shutdown: CancellationToken,
}

impl Application {
    /// Build the application with the given configuration.
    pub async fn build(config: Config) -> Result<Self, AppError> {
        init_metrics();

        let store: Arc<dyn BillingStore> = match config.database.backend {
            DatabaseBackend::Postgres => Arc::new(
                PgStore::connect(
                    config.database.url.expose_secret(),
                    config.database.max_connections,
                    config.database.min_connections,
                )
                .await?,
            ),
            DatabaseBackend::Memory => {
                tracing::warn!("Using in-memory store; state will not survive a restart");
                Arc::new(MemoryStore::new())
            }
        };

        let signer: Arc<dyn PayloadSigner> =
            Arc::new(HmacSigner::new(config.gepg.signing_secret.clone()));
        let gateway = GatewayClient::new(config.gepg.clone())?;
        let forwarder = CallbackForwarder::new(config.gepg.request_timeout_secs)?;

        let notifier: Arc<dyn crate::services::OperatorNotifier> = if config.operator.enabled {
            Arc::new(
                SmtpNotifier::new(config.operator.clone())
                    .map_err(AppError::InternalError)?,
            )
        } else {
            Arc::new(NoopNotifier)
        };

        let delivery: Arc<dyn crate::services::DocumentDelivery> = Arc::new(
            EmailDelivery::new(config.delivery.clone()).map_err(AppError::InternalError)?,
        );

        let (orchestrator, queue) = WorkerOrchestrator::new(config.worker.clone(), |queue| {
            JobContext {
                store: store.clone(),
                gateway,
                forwarder,
                signer: signer.clone(),
                notifier,
                delivery,
                gepg: config.gepg.clone(),
                public_url: config.public_url.clone(),
                queue,
            }
        });

        let shutdown = orchestrator.shutdown_token();

        spawn_reconciliation_trigger(
            config.reconciliation.clone(),
            store.clone(),
            queue.clone(),
            shutdown.clone(),
        );

        let state = AppState {
            store,
            signer,
            queue,
            config: config.clone(),
        };

        // Port 0 binds a random free port, used by the test harness.
        let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            tracing::error!("Failed to bind listener to {}: {}", addr, e);
            AppError::from(e)
        })?;
        let port = listener.local_addr()?.port();

        tracing::info!("Billing service listening on port {}", port);

        Ok(Self {
            port,
            listener,
            state,
            orchestrator,
            shutdown,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Application state handle, shared with the test harness.
    pub fn state(&self) -> AppState {
        self.state.clone()
    }

    fn router(state: AppState) -> Router {
        Router::new()
            .route("/health", get(handlers::health::health_check))
            .route("/ready", get(handlers::health::readiness_check))
            .route("/metrics", get(handlers::health::metrics_endpoint))
            // Integrating-system API
            .route("/api/bills", post(handlers::bills::submit_bill))
            .route("/api/bills/:bill_id", put(handlers::bills::resubmit_bill))
            .route("/api/bills/:bill_id/status", get(handlers::bills::bill_status))
            .route("/api/bills/:bill_id/cancel", post(handlers::bills::cancel_bill))
            // Gateway callbacks
            .route(
                "/callbacks/control-number",
                post(handlers::callbacks::control_number_response),
            )
            .route(
                "/callbacks/payment",
                post(handlers::callbacks::payment_notification),
            )
            .route(
                "/callbacks/reconciliation",
                post(handlers::callbacks::reconciliation_response),
            )
            // Reconciliation operations
            .route(
                "/api/reconciliations/:date",
                get(handlers::reconciliation::run_detail),
            )
            .route(
                "/api/reconciliations/:date/close",
                post(handlers::reconciliation::close_run),
            )
            .layer(from_fn(request_id_middleware))
            .layer(
                TraceLayer::new_for_http().make_span_with(|request: &axum::http::Request<_>| {
                    let request_id = request
                        .headers()
                        .get("x-request-id")
                        .and_then(|value| value.to_str().ok())
                        .unwrap_or("-");

                    tracing::info_span!(
                        "http_request",
                        request_id = %request_id,
                        method = %request.method(),
                        uri = %request.uri(),
                    )
                }),
            )
            .with_state(state)
    }

    /// Run the application until stopped.
    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        let router = Self::router(self.state.clone());

        self.orchestrator.start().await;

        let shutdown = self.shutdown.clone();
        let result = axum::serve(self.listener, router)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await;

        if let Err(e) = result {
            tracing::error!("HTTP server error: {}", e);
            return Err(std::io::Error::other(format!("HTTP server error: {}", e)));
        }

        Ok(())
    }

    /// Stop the worker pool and the HTTP server.
    pub fn shutdown_handle(&self) -> CancellationToken {
        self.shutdown.clone()
    }
}
