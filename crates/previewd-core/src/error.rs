//! Error types for `previewd-core`.
//!
//! Each subsystem gets its own variant set scoped to its failure modes,
//! matching the granularity C9 needs to map failures onto the right HTTP
//! status (see `previewd-server::error::AppError`).

pub use previewd_provider::ProviderError;

/// Errors from the session ledger (C2).
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    /// The session row does not exist.
    #[error("session not found: {id}")]
    NotFound { id: String },

    /// The backing store rejected a read or write.
    #[error("ledger storage error: {0}")]
    Storage(#[from] sqlx::Error),
}

/// Errors from the realtime registrar (C4). Callers treat every variant as
/// best-effort — never propagated out of session create/destroy.
#[derive(Debug, thiserror::Error)]
pub enum RegistrarError {
    #[error("registrar request failed: {0}")]
    Transport(String),

    #[error("registrar exhausted reconnect attempts")]
    ReconnectExhausted,
}

/// Errors from the container manager (C5).
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("session not found: {id}")]
    NotFound { id: uuid::Uuid },

    #[error("provisioning failed: {0}")]
    ProvisioningFailed(#[from] ProviderError),

    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("destroy failed: {0}")]
    DestroyFailed(String),
}

/// Errors from the scheduler (C7).
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("unknown job: {name}")]
    UnknownJob { name: String },

    #[error("job '{name}' is already running")]
    AlreadyRunning { name: String },
}
