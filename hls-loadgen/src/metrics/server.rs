//! Binds the Prometheus exposition endpoint: a single `GET /metrics` route
//! over `axum`, shut down cooperatively via the same `CancellationToken`
//! every other subsystem uses.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::prometheus::PrometheusExporter;
use crate::error::CoreError;

async fn metrics_handler(State(exporter): State<Arc<PrometheusExporter>>) -> impl IntoResponse {
    (
        [("content-type", "text/plain; version=0.0.4")],
        exporter.export(),
    )
}

fn router(exporter: Arc<PrometheusExporter>) -> Router {
    Router::new().route("/metrics", get(metrics_handler)).with_state(exporter)
}

/// Bind the exposition listener. Split out from `serve_bound` so the
/// orchestrator can surface a bind failure as fatal *before* ramping
/// starts, per the spec's "HTTP bind failure at startup is fatal" rule,
/// rather than discovering it only when the background task later fails.
pub async fn bind(addr: SocketAddr) -> Result<tokio::net::TcpListener, CoreError> {
    tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|source| CoreError::Exposition { addr: addr.to_string(), source })
}

/// Serve `GET /metrics` on an already-bound listener until `cancel` fires.
pub async fn serve_bound(
    listener: tokio::net::TcpListener,
    exporter: Arc<PrometheusExporter>,
    cancel: CancellationToken,
) -> Result<(), CoreError> {
    let addr = listener.local_addr().map(|a| a.to_string()).unwrap_or_default();
    info!(addr = %addr, "metrics exposition listening");

    axum::serve(listener, router(exporter))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .map_err(|source| CoreError::Exposition { addr, source })
}

/// Bind and serve in one step. Kept for callers (and tests) that don't need
/// to separate the two phases.
pub async fn serve(addr: SocketAddr, exporter: Arc<PrometheusExporter>, cancel: CancellationToken) -> Result<(), CoreError> {
    let listener = bind(addr).await?;
    serve_bound(listener, exporter, cancel).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::collector::{MetricsCollector, MetricsCollectorConfig};
    use std::time::Duration;

    #[tokio::test]
    async fn metrics_route_serves_prometheus_text() {
        let collector = Arc::new(MetricsCollector::new(MetricsCollectorConfig::default()));
        let exporter = Arc::new(PrometheusExporter::new(collector));
        let app = router(exporter);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let cancel_for_server = cancel.clone();
        let server = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { cancel_for_server.cancelled().await })
                .await
                .unwrap();
        });

        let resp = reqwest::get(format!("http://{addr}/metrics")).await.unwrap();
        assert!(resp.status().is_success());
        let body = resp.text().await.unwrap();
        assert!(body.contains("hls_loadgen_clients_active"));

        cancel.cancel();
        let _ = tokio::time::timeout(Duration::from_secs(2), server).await;
    }

    #[tokio::test]
    async fn serve_returns_exposition_error_on_bind_failure() {
        let collector = Arc::new(MetricsCollector::new(MetricsCollectorConfig::default()));
        let exporter = Arc::new(PrometheusExporter::new(collector));
        // Bind once to occupy the port, then try to bind the same addr again via `serve`.
        let occupied = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = occupied.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let result = serve(addr, exporter, cancel).await;
        assert!(matches!(result, Err(CoreError::Exposition { .. })));
    }
}
