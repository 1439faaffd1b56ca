use std::sync::Arc;

use axum::extract::State;
use axum::response::IntoResponse;
use metrics_exporter_prometheus::PrometheusHandle;

/// GET /metrics — everything the recorder has accumulated, rendered in
/// Prometheus text exposition format. Carries its own state (the handle
/// installed in `main`), separate from the orchestrator's.
pub async fn prometheus_metrics(State(handle): State<Arc<PrometheusHandle>>) -> impl IntoResponse {
    handle.render()
}
