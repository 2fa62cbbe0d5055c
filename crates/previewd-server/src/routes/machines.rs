//! Provider passthrough routes (spec §4.9): `/machines/*`.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::get;
use axum::{Json, Router};
use previewd_provider::MachineDescriptor;
use serde::Serialize;

use crate::error::AppError;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/machines", get(list))
        .route("/machines/:id/status", get(status))
}

#[derive(Serialize)]
struct Envelope<T: Serialize> {
    success: bool,
    data: T,
}

async fn list(State(state): State<Arc<AppState>>) -> Json<Envelope<Vec<MachineDescriptor>>> {
    let machines = state.provider.list_machines().await;
    Json(Envelope { success: true, data: machines })
}

async fn status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Envelope<MachineDescriptor>>, AppError> {
    let descriptor = state
        .provider
        .get_machine(&id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("machine not found: {id}")))?;
    Ok(Json(Envelope { success: true, data: descriptor }))
}
