//! Provider adapter abstraction for `previewd`.
//!
//! This crate defines [`ProviderAdapter`] — a thin RPC surface over a
//! Machines-as-a-Service provider that knows nothing about sessions, tiers,
//! or quotas. The orchestration layer in `previewd-core` wraps an adapter to
//! realize session lifecycle.
//!
//! Two implementations are provided:
//!
//! - [`FlyAdapter`] — production default, talks to the provider's REST API.
//! - [`MemoryAdapter`] — deterministic in-memory fake used by every test.

mod error;
mod fly;
mod memory;

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use error::ProviderError;
pub use fly::FlyAdapter;
pub use memory::MemoryAdapter;

/// CPU allocation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CpuKind {
    Shared,
    Dedicated,
}

/// A health check to attach to a machine spec.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckSpec {
    pub name: String,
    pub kind: CheckKind,
    pub interval_secs: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckKind {
    Http { path: String },
    Script { command: String },
}

/// A fully hardened, tier-derived machine spec ready to submit to the
/// provider. Built by `previewd-core::tier::apply_hardening`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineSpec {
    pub project_id: String,
    pub session_id: String,
    pub image: String,
    pub cpu_kind: CpuKind,
    pub cpus: u32,
    pub memory_mb: u32,
    pub disk_gb: Option<u32>,
    pub allowed_ports: Vec<u16>,
    pub drop_capabilities: Vec<String>,
    pub no_new_privileges: bool,
    pub read_only_rootfs: bool,
    pub seccomp_profile: Option<String>,
    pub checks: Vec<CheckSpec>,
    /// Free-form tags attached to the machine; used by orphan-reaping to
    /// distinguish machines owned by this service from unrelated ones.
    pub tags: HashMap<String, String>,
}

/// Observed lifecycle state of a provider machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MachineState {
    Created,
    Started,
    Stopping,
    Stopped,
    Failed,
    Destroyed,
}

impl MachineState {
    /// States that can never transition back to `started` — a create
    /// attempt observing one of these surfaces as [`ProviderError::UnhealthyState`].
    #[must_use]
    pub const fn is_terminal_for_create(self) -> bool {
        matches!(self, Self::Stopping | Self::Stopped | Self::Failed)
    }
}

/// The status of a single registered health check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Passing,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineCheck {
    pub name: String,
    pub status: CheckStatus,
}

/// A provider-side machine as observed through the adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineDescriptor {
    pub id: String,
    pub name: String,
    pub state: MachineState,
    pub region: String,
    pub url: String,
    pub created_at: DateTime<Utc>,
    /// Empty means "no health checks configured" (spec §4.1.1) — the field
    /// type itself encodes that: an empty vec, not an `Option`.
    pub checks: Vec<MachineCheck>,
    pub tags: HashMap<String, String>,
}

impl MachineDescriptor {
    /// A machine is ready when started and every configured check passes.
    /// An empty `checks` list always passes (spec §4.1.1 edge case).
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.state == MachineState::Started
            && self.checks.iter().all(|c| c.status == CheckStatus::Passing)
    }
}

/// Thin RPC surface to an external Machines-as-a-Service provider (spec §4.1).
#[async_trait::async_trait]
pub trait ProviderAdapter: Send + Sync + 'static {
    /// Submit a machine spec and block until it is ready or definitively
    /// fails. Internally polls via [`ProviderAdapter::wait_for_ready`].
    ///
    /// # Errors
    ///
    /// [`ProviderError::ProvisionFailure`] if the provider rejects the spec,
    /// [`ProviderError::UnhealthyState`] or [`ProviderError::Timeout`] if it
    /// is accepted but never becomes ready within `deadline`.
    async fn create_machine(
        &self,
        spec: MachineSpec,
        deadline: Duration,
    ) -> Result<MachineDescriptor, ProviderError>;

    /// Destroy a machine. Idempotent: a 404 from the provider counts as
    /// success. Attempts a graceful stop, then a forced destroy, retrying up
    /// to 3 times with a 2s backoff, verifying destruction before returning.
    ///
    /// # Errors
    ///
    /// [`ProviderError::DestroyFailed`] once the retry budget is exhausted.
    async fn destroy_machine(&self, machine_id: &str) -> Result<(), ProviderError>;

    /// Look up a machine by id. A 404 is not an error — it is `Ok(None)`.
    ///
    /// # Errors
    ///
    /// [`ProviderError::Transport`] on a genuine RPC failure.
    async fn get_machine(&self, machine_id: &str) -> Result<Option<MachineDescriptor>, ProviderError>;

    /// List all machines known to the provider. Per spec §4.1 this degrades
    /// to an empty list on provider failure rather than propagating an error
    /// — callers (the orphan reaper) treat "nothing to reap this tick" as
    /// safe on transient provider outages.
    async fn list_machines(&self) -> Vec<MachineDescriptor>;

    /// Poll every 2s until `machine_id` is ready or `deadline` elapses.
    ///
    /// # Errors
    ///
    /// [`ProviderError::UnhealthyState`] if the machine enters a terminal
    /// state, [`ProviderError::Timeout`] if `deadline` elapses first.
    async fn wait_for_ready(
        &self,
        machine_id: &str,
        deadline: Duration,
    ) -> Result<MachineDescriptor, ProviderError>;

    /// Destroy all non-destroyed machines tagged with `project_id`.
    ///
    /// # Errors
    ///
    /// [`ProviderError::Transport`] on a genuine RPC failure; individual
    /// destroy failures within the batch are logged, not propagated.
    async fn cleanup_project_containers(&self, project_id: &str) -> Result<u32, ProviderError>;

    /// Destroy machines tagged as belonging to this service that are older
    /// than `max_age` and not yet destroyed. This is adapter-level cleanup
    /// keyed purely on provider tags and age — it does not consult the
    /// session ledger (that cross-reference is the scheduler's orphan-reaper
    /// job, which calls [`ProviderAdapter::destroy_machine`] directly for
    /// entries it determines have no ledger row).
    ///
    /// # Errors
    ///
    /// [`ProviderError::Transport`] on a genuine RPC failure.
    async fn cleanup_orphaned(&self, max_age: Duration) -> Result<u32, ProviderError>;
}

/// The tag key used to mark machines as owned by this service, checked by
/// [`ProviderAdapter::cleanup_orphaned`].
pub const SERVICE_TAG_KEY: &str = "previewd.service";
pub const SERVICE_TAG_VALUE: &str = "previewd";
pub const PROJECT_TAG_KEY: &str = "previewd.project_id";
pub const SESSION_TAG_KEY: &str = "previewd.session_id";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_requires_started_state() {
        let mut m = sample_machine();
        m.state = MachineState::Created;
        assert!(!m.is_ready());
        m.state = MachineState::Started;
        assert!(m.is_ready());
    }

    #[test]
    fn empty_checks_pass_once_started() {
        let mut m = sample_machine();
        m.checks.clear();
        assert!(m.is_ready());
    }

    #[test]
    fn any_failing_check_blocks_readiness() {
        let mut m = sample_machine();
        m.checks.push(MachineCheck {
            name: "liveness".to_owned(),
            status: CheckStatus::Critical,
        });
        assert!(!m.is_ready());
    }

    #[test]
    fn terminal_states_are_flagged() {
        assert!(MachineState::Failed.is_terminal_for_create());
        assert!(MachineState::Stopped.is_terminal_for_create());
        assert!(MachineState::Stopping.is_terminal_for_create());
        assert!(!MachineState::Started.is_terminal_for_create());
        assert!(!MachineState::Created.is_terminal_for_create());
    }

    fn sample_machine() -> MachineDescriptor {
        MachineDescriptor {
            id: "m1".to_owned(),
            name: "m1".to_owned(),
            state: MachineState::Started,
            region: "iad".to_owned(),
            url: "https://m1.example.preview.dev".to_owned(),
            created_at: Utc::now(),
            checks: vec![MachineCheck {
                name: "health".to_owned(),
                status: CheckStatus::Passing,
            }],
            tags: HashMap::new(),
        }
    }
}
