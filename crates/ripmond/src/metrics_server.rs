//! HTTP metrics server for Prometheus scraping
//!
//! Plain HTTP on the loopback interface; scrape it locally or through a
//! forwarding agent.
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - AU-6: Audit Record Review - Metrics endpoint for analysis
//! - SI-4: System Monitoring - HTTP endpoint for monitoring systems
//! - SC-7: Boundary Protection - Bound to loopback only

use crate::error::Result;
use crate::metrics::MetricsCollector;
use axum::{Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use prometheus::{Encoder, TextEncoder};
use std::net::{Ipv4Addr, SocketAddr};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Default metrics server port
pub const DEFAULT_METRICS_PORT: u16 = 9105;

#[derive(Clone)]
struct MetricsServerState {
    collector: MetricsCollector,
}

fn router(collector: MetricsCollector) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .with_state(MetricsServerState { collector })
}

/// Serve `/metrics` and `/health` until `cancel` fires
///
/// # NIST Controls
/// - AU-6: Audit Record Review - Expose metrics for collection
pub async fn start_metrics_server(
    collector: MetricsCollector,
    port: u16,
    cancel: CancellationToken,
) -> Result<()> {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!("Starting metrics server on http://{}/metrics", addr);

    axum::serve(listener, router(collector))
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await?;

    info!("Metrics server stopped");
    Ok(())
}

/// Handle /metrics endpoint - Prometheus text format
async fn metrics_handler(State(state): State<MetricsServerState>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = state.collector.registry.gather();

    let mut buffer = vec![];
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(_) => (
            StatusCode::OK,
            [("content-type", encoder.format_type())],
            buffer,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to encode metrics",
            )
                .into_response()
        }
    }
}

/// Handle /health endpoint
///
/// Healthy while the receiver task is running. The trie stays queryable
/// after a receiver failure, so a stopped receiver reports degraded.
async fn health_handler(State(state): State<MetricsServerState>) -> impl IntoResponse {
    let (status, body) = health_body(&state.collector);
    (status, [("content-type", "application/json")], body)
}

fn health_body(collector: &MetricsCollector) -> (StatusCode, String) {
    let running = collector.receiver_running.get() >= 1.0;
    let (code, status) = if running {
        (StatusCode::OK, "healthy")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded")
    };
    let body = format!(
        r#"{{"status": "{}", "population": {}}}"#,
        status,
        collector.trie_population.get()
    );
    (code, body)
}
