//! API Server
//!
//! Serves the controller operations next to liveness, readiness and
//! Prometheus metrics for the controller process.

use super::rest::{self, ApiState};
use crate::controller::{ControllerMetrics, ControllerServer};
use crate::error::{Error, Result};
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Router,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

// =============================================================================
// Server Configuration
// =============================================================================

/// Configuration for the API server
#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    /// Bind address
    pub addr: SocketAddr,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
        }
    }
}

// =============================================================================
// Router
// =============================================================================

/// Health and metrics handler state
#[derive(Clone)]
pub struct AdminState {
    metrics: ControllerMetrics,
    ready: Arc<AtomicBool>,
}

impl AdminState {
    pub fn new(metrics: ControllerMetrics, ready: Arc<AtomicBool>) -> Self {
        Self { metrics, ready }
    }
}

/// Build the health and metrics router
pub fn admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Build the full router: controller operations plus health and metrics
pub fn router(admin: AdminState, api: ApiState) -> Router {
    rest::router(api)
        .merge(admin_router(admin))
        .layer(TraceLayer::new_for_http())
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn readyz(State(state): State<AdminState>) -> impl IntoResponse {
    if state.ready.load(Ordering::Acquire) {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready")
    }
}

async fn metrics(State(state): State<AdminState>) -> impl IntoResponse {
    match state.metrics.render() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)],
            body,
        )
            .into_response(),
        Err(e) => {
            error!("Failed to render metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

// =============================================================================
// API Server
// =============================================================================

/// API server with graceful shutdown
pub struct ApiServer {
    config: ApiServerConfig,
    admin: AdminState,
    api: ApiState,
    ready: Arc<AtomicBool>,
    shutdown_tx: watch::Sender<bool>,
    /// Parent of every request's cancellation token
    requests: CancellationToken,
}

impl ApiServer {
    /// Create a new API server; it reports not-ready until [`ApiServer::set_ready`]
    pub fn new(config: ApiServerConfig, controller: Arc<ControllerServer>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        let ready = Arc::new(AtomicBool::new(false));
        let requests = CancellationToken::new();

        Self {
            config,
            admin: AdminState::new(controller.metrics().clone(), ready.clone()),
            api: ApiState::new(controller, requests.clone()),
            ready,
            shutdown_tx,
            requests,
        }
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Release);
    }

    /// Serve until [`AdminServer::shutdown`] is called
    pub async fn run(&self) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(self.config.addr)
            .await
            .map_err(|e| Error::Internal(format!("Failed to bind API server: {}", e)))?;
        info!("API server listening on {}", self.config.addr);

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        axum::serve(listener, router(self.admin.clone(), self.api.clone()))
            .with_graceful_shutdown(async move {
                // A shutdown requested before serving started is still seen
                let _ = shutdown_rx.wait_for(|stop| *stop).await;
                info!("API server shutting down");
            })
            .await
            .map_err(|e| Error::Internal(format!("API server error: {}", e)))?;

        Ok(())
    }

    /// Trigger graceful shutdown; requests still draining see their context cancelled
    pub fn shutdown(&self) {
        self.set_ready(false);
        self.requests.cancel();
        self.shutdown_tx.send_replace(true);
    }
}
