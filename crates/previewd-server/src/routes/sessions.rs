//! Session CRUD routes (spec §4.9): `/sessions/*`.

use std::sync::Arc;

use axum::extract::{Extension, Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use previewd_core::quota::{CheckOutcome, CheckRequest};
use previewd_core::session::{SessionInfo, TierName};
use previewd_core::tier::QuotaResource;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::Identity;
use crate::error::AppError;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/sessions/start", post(start))
        .route("/sessions/stop", post(stop))
        .route("/sessions/cleanup", post(cleanup))
        .route("/sessions", get(list))
        .route("/sessions/:id/status", get(status))
}

#[derive(Serialize)]
struct Envelope<T: Serialize> {
    success: bool,
    data: T,
}

#[derive(Deserialize)]
struct StartRequest {
    project_id: Uuid,
    #[serde(default)]
    device_type: Option<String>,
    #[serde(default)]
    options: Option<serde_json::Value>,
    #[serde(default = "default_tier")]
    tier: TierName,
}

fn default_tier() -> TierName {
    TierName::Free
}

/// Runs the quota engine (C8) against `user_id` and maps a denial onto
/// `AppError::RateLimited`. Applied to every handler below per the
/// validate-authenticate-own-rate_limit-invoke pipeline (spec §4.9).
async fn check_rate_limit(state: &AppState, user_id: Uuid) -> Result<(), AppError> {
    let decision = state
        .quota
        .check(&CheckRequest {
            user_id,
            resource: QuotaResource::SessionCreate,
            weight: 1,
            request_id: Uuid::new_v4(),
            graceful_degradation: false,
        })
        .await;

    if let CheckOutcome::Denied { decision, .. } = decision {
        return Err(AppError::RateLimited {
            retry_after_secs: decision.retry_after_secs.unwrap_or(60),
        });
    }
    Ok(())
}

async fn start(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    Json(body): Json<StartRequest>,
) -> Result<Json<Envelope<SessionInfo>>, AppError> {
    let _ = (body.device_type, body.options);

    check_rate_limit(&state, identity.user_id).await?;

    let info = state
        .manager
        .create_session(identity.user_id, body.project_id, body.tier)
        .await?;

    Ok(Json(Envelope { success: true, data: info }))
}

#[derive(Deserialize)]
struct StopRequest {
    session_id: Uuid,
}

#[derive(Serialize)]
struct MessageBody {
    success: bool,
    message: String,
}

async fn stop(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    Json(body): Json<StopRequest>,
) -> Result<Json<MessageBody>, AppError> {
    let owner = state
        .ledger
        .get(body.session_id)
        .await
        .map_err(previewd_core::error::ManagerError::Ledger)?
        .ok_or_else(|| AppError::NotFound(format!("session not found: {}", body.session_id)))?
        .user_id;

    if owner != identity.user_id {
        return Err(AppError::Unauthorized("Unauthorized to stop this session".to_owned()));
    }

    check_rate_limit(&state, identity.user_id).await?;

    state.manager.destroy_session(body.session_id).await?;

    Ok(Json(MessageBody { success: true, message: "Session stopped successfully".to_owned() }))
}

async fn status(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    Path(id): Path<Uuid>,
) -> Result<Json<Envelope<SessionInfo>>, AppError> {
    let owner = state
        .ledger
        .get(id)
        .await
        .map_err(previewd_core::error::ManagerError::Ledger)?
        .ok_or_else(|| AppError::NotFound(format!("session not found: {id}")))?
        .user_id;

    if owner != identity.user_id {
        return Err(AppError::Unauthorized("Unauthorized to view this session".to_owned()));
    }

    check_rate_limit(&state, identity.user_id).await?;

    let info = state.manager.get_status(id).await?.ok_or_else(|| AppError::NotFound(format!("session not found: {id}")))?;
    Ok(Json(Envelope { success: true, data: info }))
}

async fn list(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
) -> Result<Json<Envelope<Vec<SessionInfo>>>, AppError> {
    check_rate_limit(&state, identity.user_id).await?;

    let sessions = state
        .ledger
        .list_for_user(identity.user_id)
        .await
        .map_err(previewd_core::error::ManagerError::Ledger)?
        .into_iter()
        .map(Into::into)
        .collect();
    Ok(Json(Envelope { success: true, data: sessions }))
}

async fn cleanup(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
) -> Result<Json<Envelope<u32>>, AppError> {
    if !state.config.is_admin(&identity.email) {
        return Err(AppError::Unauthorized("admin access required".to_owned()));
    }

    check_rate_limit(&state, identity.user_id).await?;

    let destroyed = state.manager.cleanup_expired_sessions().await?;
    Ok(Json(Envelope { success: true, data: destroyed }))
}
