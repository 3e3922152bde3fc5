//! Read-only HTTP endpoints for a running campaign
//!
//! - `GET /health`: campaign progress plus pool health as JSON
//! - `GET /metrics`: Prometheus text exposition

use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::get;
use dispatch::CampaignController;
use metrics_exporter_prometheus::PrometheusHandle;

/// Shared state accessible from all handlers
#[derive(Clone)]
pub struct MonitorState {
    pub controller: Arc<CampaignController>,
    pub prometheus: PrometheusHandle,
    pub started_at: Instant,
}

/// Build the monitor router with a concurrency limit of `max_connections`.
pub fn build_router(state: MonitorState, max_connections: usize) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

/// 200 with progress once a campaign has started, 503 before that.
async fn health_handler(State(state): State<MonitorState>) -> impl IntoResponse {
    let uptime = state.started_at.elapsed().as_secs();

    let (status_code, body) = match state.controller.current() {
        Some(live) => {
            let progress = live.tracker.snapshot();
            let pool = live.pool.health().await;
            let status = if progress.finished {
                "finished"
            } else {
                "running"
            };
            (
                StatusCode::OK,
                serde_json::json!({
                    "status": status,
                    "campaign_id": live.campaign_id,
                    "progress": progress,
                    "pool": pool,
                    "uptime_seconds": uptime,
                }),
            )
        }
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            serde_json::json!({
                "status": "starting",
                "uptime_seconds": uptime,
            }),
        ),
    };

    (
        status_code,
        [(header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

async fn metrics_handler(State(state): State<MonitorState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}
