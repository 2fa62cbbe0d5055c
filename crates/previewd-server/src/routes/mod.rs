//! Control API (C9) route composition.

pub mod health;
pub mod machines;
pub mod metrics;
pub mod monitoring;
pub mod sessions;

use std::sync::Arc;

use axum::middleware;
use axum::Router;

use crate::auth::auth_middleware;
use crate::state::AppState;

/// Builds the full Control API router: `/api/health` and `/metrics` are
/// open, everything else requires a bearer token exchanged against the
/// auth service.
pub fn router(state: Arc<AppState>) -> Router {
    let authenticated = Router::new()
        .merge(sessions::router())
        .merge(machines::router())
        .merge(monitoring::router())
        .route_layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    let open = Router::new().merge(health::router()).merge(metrics::router());

    Router::new().merge(authenticated).merge(open).with_state(state)
}
