//! Unauthenticated Prometheus text exposition: `GET /metrics`.

use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::extract::State;

use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/metrics", get(metrics))
}

async fn metrics(State(state): State<Arc<AppState>>) -> Response {
    let body = state.monitoring.export_prometheus().await;
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
        .into_response()
}
