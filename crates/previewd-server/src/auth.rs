//! Control API authentication (spec §6): every non-trivial endpoint
//! requires a Bearer token, exchanged with an external auth service for
//! `{user_id, email}`. This service never validates JWTs itself — that is
//! explicitly the auth service's job (spec §1 Non-goals).

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use serde::Deserialize;
use uuid::Uuid;

use crate::error::AppError;
use crate::state::AppState;

/// Identity of the authenticated caller, resolved by the external auth
/// service.
#[derive(Debug, Clone)]
pub struct Identity {
    pub user_id: Uuid,
    pub email: String,
}

#[derive(Deserialize)]
struct ExchangeResponse {
    user_id: Uuid,
    email: String,
}

async fn exchange_token(state: &AppState, token: &str) -> Result<Identity, AppError> {
    let response = state
        .auth_client
        .post(format!("{}/verify", state.config.auth_service_url))
        .bearer_auth(&state.config.auth_service_key)
        .json(&serde_json::json!({ "token": token }))
        .send()
        .await
        .map_err(|_| AppError::Unauthenticated)?;

    if response.status() == reqwest::StatusCode::UNAUTHORIZED {
        return Err(AppError::Unauthenticated);
    }
    if !response.status().is_success() {
        return Err(AppError::Unauthenticated);
    }

    let parsed: ExchangeResponse = response.json().await.map_err(|_| AppError::Unauthenticated)?;
    Ok(Identity { user_id: parsed.user_id, email: parsed.email })
}

/// Axum middleware that authenticates Control API requests. Injects
/// [`Identity`] into request extensions on success.
pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let header = req
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);

    let Some(header) = header else {
        return Err(AppError::Unauthenticated);
    };
    let token = header.strip_prefix("Bearer ").ok_or(AppError::Unauthenticated)?;

    let identity = exchange_token(&state, token).await?;
    req.extensions_mut().insert(identity);

    Ok(next.run(req).await)
}
