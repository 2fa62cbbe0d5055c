//! HTTP error types for the `previewd` server (C9).
//!
//! Every subsystem error (`ProviderError`, `LedgerError`, `ManagerError`,
//! `RegistrarError`, `SchedulerError`) converges into a single
//! [`AppError`] that implements `IntoResponse` with the uniform
//! `{success:false, error:"..."}` envelope and the canonical HTTP status
//! per spec §7's error taxonomy table.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use previewd_core::error::{LedgerError, ManagerError, ProviderError, SchedulerError};
use serde::Serialize;

/// Application-level error returned from HTTP handlers.
#[derive(Debug)]
pub enum AppError {
    /// Required request field missing or malformed.
    MissingField(String),
    /// Bearer token missing or the auth service rejected it.
    Unauthenticated,
    /// Caller is not the owner of the resource (cross-user access).
    Unauthorized(String),
    /// Requested resource not found.
    NotFound(String),
    /// Quota engine denied the request.
    RateLimited { retry_after_secs: u64 },
    /// Provider rejected or never completed session creation.
    ProvisioningFailed(String),
    /// Ready-wait ended in an unhealthy state or timed out.
    UnhealthyOrTimeout(String),
    /// Destroy exhausted its retry budget; ledger still marks the session
    /// ended, so this is surfaced but not retried by the caller.
    DestroyFailed(String),
    /// Session ledger read/write failure.
    Ledger(String),
    /// `run_job_now` named an unknown job.
    UnknownJob(String),
}

#[derive(Serialize)]
struct ErrorBody {
    success: bool,
    error: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::MissingField(msg) => (StatusCode::BAD_REQUEST, msg),
            Self::Unauthenticated => (StatusCode::UNAUTHORIZED, "authentication required".to_owned()),
            Self::Unauthorized(msg) => (StatusCode::FORBIDDEN, msg),
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            Self::RateLimited { retry_after_secs } => {
                let body = ErrorBody { success: false, error: "rate limited".to_owned() };
                let mut response = (StatusCode::TOO_MANY_REQUESTS, axum::Json(body)).into_response();
                if let Ok(value) = axum::http::HeaderValue::from_str(&retry_after_secs.to_string()) {
                    response.headers_mut().insert("Retry-After", value);
                }
                return response;
            }
            Self::ProvisioningFailed(msg) => {
                tracing::error!(error = %msg, "session provisioning failed");
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
            Self::UnhealthyOrTimeout(msg) => {
                tracing::error!(error = %msg, "ready-wait ended unhealthy or timed out");
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
            Self::DestroyFailed(msg) => {
                tracing::warn!(error = %msg, "destroy retries exhausted, session marked ended anyway");
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
            Self::Ledger(msg) => {
                tracing::error!(error = %msg, "ledger operation failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_owned())
            }
            Self::UnknownJob(msg) => (StatusCode::BAD_REQUEST, msg),
        };

        (status, axum::Json(ErrorBody { success: false, error: message })).into_response()
    }
}

impl From<ManagerError> for AppError {
    fn from(err: ManagerError) -> Self {
        match err {
            ManagerError::NotFound { id } => Self::NotFound(format!("session not found: {id}")),
            ManagerError::ProvisioningFailed(provider_err) => provider_err.into(),
            ManagerError::Ledger(ledger_err) => ledger_err.into(),
            ManagerError::DestroyFailed(msg) => Self::DestroyFailed(msg),
        }
    }
}

impl From<ProviderError> for AppError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::ProvisionFailure { reason } => Self::ProvisioningFailed(reason),
            ProviderError::UnhealthyState { reason } => Self::UnhealthyOrTimeout(reason),
            ProviderError::Timeout => Self::UnhealthyOrTimeout("ready-wait deadline exceeded".to_owned()),
            ProviderError::DestroyFailed { machine_id, attempts, reason } => {
                Self::DestroyFailed(format!("destroy of {machine_id} failed after {attempts} attempts: {reason}"))
            }
            ProviderError::Transport(msg) => Self::ProvisioningFailed(msg),
        }
    }
}

impl From<LedgerError> for AppError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::NotFound { id } => Self::NotFound(format!("session not found: {id}")),
            LedgerError::Storage(e) => Self::Ledger(e.to_string()),
        }
    }
}

impl From<SchedulerError> for AppError {
    fn from(err: SchedulerError) -> Self {
        match err {
            SchedulerError::UnknownJob { name } => Self::UnknownJob(format!("unknown job: {name}")),
            SchedulerError::AlreadyRunning { name } => Self::UnknownJob(format!("job already running: {name}")),
        }
    }
}
