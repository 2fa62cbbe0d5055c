//! Errors surfaced by a [`crate::ProviderAdapter`] implementation.

/// Failure modes for Machines-as-a-Service provider operations.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// The provider rejected or failed to bring up a machine.
    #[error("provisioning failed: {reason}")]
    ProvisionFailure { reason: String },

    /// The machine entered a terminal non-ready state (`failed`/`stopped`)
    /// while waiting for readiness.
    #[error("machine entered unhealthy state: {reason}")]
    UnhealthyState { reason: String },

    /// The ready-wait deadline elapsed before the machine became ready.
    #[error("timed out waiting for machine to become ready")]
    Timeout,

    /// Destroy exhausted its retry budget without confirming destruction.
    #[error("failed to destroy machine {machine_id} after {attempts} attempts: {reason}")]
    DestroyFailed {
        machine_id: String,
        attempts: u32,
        reason: String,
    },

    /// Transport-level failure talking to the provider (network, deserialize, etc).
    #[error("provider transport error: {0}")]
    Transport(String),
}
