//! Prometheus metrics endpoint.
//!
//! Serves `/metrics` (Prometheus text format) and `/health` for liveness
//! probes on a background task.

use axum::{Extension, Router, routing::get};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use snafu::prelude::*;
use std::net::SocketAddr;
use std::sync::OnceLock;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::error::{AlreadyInitializedSnafu, MetricsError, PrometheusInitSnafu};

/// Histogram buckets for duration metrics (in seconds). Runs take minutes.
const DURATION_BUCKETS: &[f64] = &[
    0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0, 900.0, 3600.0,
];

static HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the Prometheus recorder and serve it on `addr`.
///
/// # Errors
///
/// Returns an error if the recorder cannot be installed or metrics were
/// already initialized in this process.
pub fn init(addr: SocketAddr) -> Result<(), MetricsError> {
    let handle = PrometheusBuilder::new()
        .set_buckets(DURATION_BUCKETS)
        .context(PrometheusInitSnafu)?
        .install_recorder()
        .context(PrometheusInitSnafu)?;

    HANDLE
        .set(handle.clone())
        .map_err(|_| AlreadyInitializedSnafu.build())?;

    tokio::spawn(run_server(addr, handle));

    info!(%addr, "Metrics server started");
    Ok(())
}

async fn run_server(addr: SocketAddr, handle: PrometheusHandle) {
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .layer(Extension(handle));

    let listener = match TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("Failed to bind metrics server to {}: {}", addr, e);
            return;
        }
    };

    if let Err(e) = axum::serve(listener, app).await {
        error!("Metrics server error: {}", e);
    }
}

async fn metrics_handler(Extension(handle): Extension<PrometheusHandle>) -> String {
    handle.render()
}

async fn health_handler() -> &'static str {
    "ok\n"
}
