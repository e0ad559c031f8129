use crate::collectors::MetricSnapshot;
use crate::metrics::Metrics;
use crate::state::{ScanState, State as AgentState};
use axum::body::Body;
use axum::extract::State;
use axum::http::{header::CONTENT_TYPE, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{routing::get, Json, Router};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Clone)]
pub struct HttpAppState {
    pub metrics: Arc<Metrics>,
    pub state: Arc<RwLock<AgentState>>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ApiSnapshot {
    pub started_at_unix: i64,
    pub last_collect_timestamp_seconds: i64,
    pub snapshot: Arc<MetricSnapshot>,
    pub critical_fields: BTreeMap<String, String>,
}

pub fn build_router(metrics: Arc<Metrics>, state: Arc<RwLock<AgentState>>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_handler))
        .route("/api/snapshot", get(snapshot_handler))
        .route("/api/scan", get(scan_handler))
        .with_state(HttpAppState { metrics, state })
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn metrics_handler(State(state): State<HttpAppState>) -> Response {
    state.metrics.inc_scrape_count();
    match state.metrics.encode_metrics() {
        Ok(encoded) => {
            let mut response = Response::new(Body::from(encoded));
            response.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4"),
            );
            response
        }
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to encode metrics: {err}"),
        )
            .into_response(),
    }
}

async fn snapshot_handler(State(state): State<HttpAppState>) -> Response {
    let guard = state.state.read().await;
    match &guard.snapshot {
        Some(snapshot) => Json(ApiSnapshot {
            started_at_unix: guard.started_at_unix,
            last_collect_timestamp_seconds: guard.last_collect_timestamp_seconds,
            snapshot: Arc::clone(snapshot),
            critical_fields: guard.critical_fields.clone(),
        })
        .into_response(),
        None => (StatusCode::NOT_FOUND, "no snapshot collected yet").into_response(),
    }
}

async fn scan_handler(State(state): State<HttpAppState>) -> Json<ScanState> {
    let guard = state.state.read().await;
    Json(guard.scan.clone())
}
