//! Container Manager (C5) — orchestrates C1-C4 to realize session
//! create/destroy/status, the convergence point of the data plane
//! (spec §4.5).

use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use previewd_provider::{MachineSpec, ProviderAdapter, SERVICE_TAG_KEY, SERVICE_TAG_VALUE};
use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::ManagerError;
use crate::ledger::SessionLedger;
use crate::realtime::RealtimeRegistrar;
use crate::session::{Session, SessionInfo, SessionStatus, TierName};
use crate::tier::{apply_hardening, policy_for};

const READY_WAIT_DEADLINE: Duration = Duration::from_secs(60);
const ORPHAN_CLEANUP_MAX_AGE: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AssessmentSeverity {
    Ok,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionAssessment {
    pub session_id: Uuid,
    pub tier: TierName,
    pub severity: AssessmentSeverity,
    pub alerts: Vec<String>,
    pub actions: Vec<String>,
}

/// Orchestrates the provider adapter, session ledger, tier policy, and
/// realtime registrar to realize session lifecycle operations.
pub struct ContainerManager {
    provider: Arc<dyn ProviderAdapter>,
    ledger: Arc<dyn SessionLedger>,
    registrar: Arc<dyn RealtimeRegistrar>,
    image: String,
    public_url_builder: Arc<dyn Fn(&str) -> String + Send + Sync>,
}

impl ContainerManager {
    #[must_use]
    pub fn new(
        provider: Arc<dyn ProviderAdapter>,
        ledger: Arc<dyn SessionLedger>,
        registrar: Arc<dyn RealtimeRegistrar>,
        image: String,
        public_url_builder: Arc<dyn Fn(&str) -> String + Send + Sync>,
    ) -> Self {
        Self { provider, ledger, registrar, image, public_url_builder }
    }

    /// Creates a new session (spec §4.5 `create_session`).
    ///
    /// # Errors
    ///
    /// [`ManagerError::ProvisioningFailed`] if the provider rejects or never
    /// becomes ready; ledger write failures on this path are logged, not
    /// surfaced, since a successful provider call must not be undone by a
    /// bookkeeping failure.
    pub async fn create_session(
        &self,
        user_id: Uuid,
        project_id: Uuid,
        tier_name: TierName,
    ) -> Result<SessionInfo, ManagerError> {
        let id = Uuid::new_v4();
        let tier = policy_for(tier_name);
        let expires_at = Utc::now() + ChronoDuration::hours(i64::from(tier.max_duration_hours));
        let provisional_container_id = Session::provisional_container_id(id);

        let session = self
            .ledger
            .insert_creating(id, user_id, project_id, tier_name, expires_at, &provisional_container_id)
            .await?;

        let project_tag = project_id.to_string();
        if let Err(err) = self.provider.cleanup_project_containers(&project_tag).await {
            warn!(project_id = %project_id, error = %err, "stale container cleanup failed, proceeding anyway");
        }

        let spec = apply_hardening(
            MachineSpec {
                project_id: project_tag,
                session_id: id.to_string(),
                image: self.image.clone(),
                cpu_kind: tier.resources.cpu_kind,
                cpus: tier.resources.cpus,
                memory_mb: tier.resources.memory_mb,
                disk_gb: tier.resources.disk_gb,
                allowed_ports: tier.security.allowed_ports.clone(),
                drop_capabilities: Vec::new(),
                no_new_privileges: false,
                read_only_rootfs: false,
                seccomp_profile: None,
                checks: Vec::new(),
                tags: [
                    (SERVICE_TAG_KEY.to_owned(), SERVICE_TAG_VALUE.to_owned()),
                    (previewd_provider::PROJECT_TAG_KEY.to_owned(), project_id.to_string()),
                    (previewd_provider::SESSION_TAG_KEY.to_owned(), id.to_string()),
                ]
                .into_iter()
                .collect(),
            },
            &tier,
        );

        match self.provider.create_machine(spec, READY_WAIT_DEADLINE).await {
            Ok(descriptor) => {
                let url = (self.public_url_builder)(&id.to_string());
                if let Err(err) = self.ledger.mark_active(id, &descriptor.id, &url).await {
                    error!(session_id = %id, error = %err, "ledger write failed after successful provisioning");
                }
                if let Some(handle) = self.registrar.register(&project_id.to_string(), &descriptor.id, &url).await {
                    info!(session_id = %id, channel = %handle.channel_name, "registered with realtime bus");
                }
                info!(session_id = %id, machine_id = %descriptor.id, "session created");

                let mut info: SessionInfo = session.into();
                info.status = SessionStatus::Active;
                info.container_id = Some(descriptor.id);
                info.container_url = Some(url);
                Ok(info)
            }
            Err(err) => {
                if let Err(write_err) = self.ledger.mark_error(id, &err.to_string()).await {
                    error!(session_id = %id, error = %write_err, "failed to record provisioning error in ledger");
                }
                Err(ManagerError::ProvisioningFailed(err))
            }
        }
    }

    /// Destroys a session (spec §4.5 `destroy_session`). Serialized per
    /// session id via the ledger's advisory lock (spec §5): the second of
    /// two concurrent calls observes `status=ended` and is a no-op.
    ///
    /// # Errors
    ///
    /// [`ManagerError::NotFound`] if the session does not exist.
    pub async fn destroy_session(&self, id: Uuid) -> Result<(), ManagerError> {
        let _guard = self.ledger.lock_session(id).await;

        let session = self
            .ledger
            .get(id)
            .await?
            .ok_or(ManagerError::NotFound { id })?;

        if session.status == SessionStatus::Ended {
            return Ok(());
        }

        if let Some(container_id) = session.container_id.as_deref() {
            self.registrar.unregister(&session.project_id.to_string(), container_id).await;

            if let Err(err) = self.provider.destroy_machine(container_id).await {
                warn!(session_id = %id, container_id, error = %err, "destroy_machine failed, marking ended anyway");
                self.ledger.mark_ended(id).await?;
                return Err(ManagerError::DestroyFailed(err.to_string()));
            }
        }

        self.ledger.mark_ended(id).await?;
        info!(session_id = %id, "session destroyed");
        Ok(())
    }

    /// Direct ledger read (spec §4.5 `get_status`).
    ///
    /// # Errors
    ///
    /// [`ManagerError::Ledger`] on a backing-store failure.
    pub async fn get_status(&self, id: Uuid) -> Result<Option<SessionInfo>, ManagerError> {
        Ok(self.ledger.get(id).await?.map(Into::into))
    }

    /// Assesses every active session against age and health-check
    /// thresholds (spec §4.5 `monitor_all_sessions`).
    ///
    /// # Errors
    ///
    /// [`ManagerError::Ledger`] on a backing-store failure.
    pub async fn monitor_all_sessions(&self) -> Result<Vec<SessionAssessment>, ManagerError> {
        let active = self
            .ledger
            .select_orphan_check_set()
            .await
            .map_err(ManagerError::Ledger)?;
        let mut assessments = Vec::with_capacity(active.len());

        for container_id in active {
            let Ok(Some(descriptor)) = self.provider.get_machine(&container_id).await else {
                continue;
            };
            let Some(session_id_tag) = descriptor.tags.get(previewd_provider::SESSION_TAG_KEY) else {
                continue;
            };
            let Ok(session_id) = session_id_tag.parse::<Uuid>() else { continue };
            let Some(session) = self.ledger.get(session_id).await? else { continue };

            let tier = policy_for(session.tier);
            let age = Utc::now() - session.created_at;
            let max_duration = ChronoDuration::hours(i64::from(tier.max_duration_hours));

            let mut alerts = Vec::new();
            let mut actions = Vec::new();
            let mut severity = AssessmentSeverity::Ok;

            if age > max_duration {
                severity = AssessmentSeverity::Critical;
                alerts.push("session exceeded max duration".to_owned());
                actions.push("Auto-destroy machine".to_owned());
            } else if age.num_seconds() as f64 > 0.8 * max_duration.num_seconds() as f64 {
                severity = AssessmentSeverity::Warning;
                alerts.push("session nearing expiry".to_owned());
                actions.push("Notify user".to_owned());
            }

            if matches!(descriptor.state, previewd_provider::MachineState::Failed) {
                severity = AssessmentSeverity::Critical;
                alerts.push("provider reports machine failed".to_owned());
            }

            for check in &descriptor.checks {
                match check.status {
                    previewd_provider::CheckStatus::Warning => {
                        severity = severity.max(AssessmentSeverity::Warning);
                        alerts.push(format!("check '{}' warning", check.name));
                    }
                    previewd_provider::CheckStatus::Critical => {
                        severity = AssessmentSeverity::Critical;
                        alerts.push(format!("check '{}' critical", check.name));
                    }
                    previewd_provider::CheckStatus::Passing => {}
                }
            }

            assessments.push(SessionAssessment {
                session_id,
                tier: session.tier,
                severity,
                alerts,
                actions,
            });
        }

        Ok(assessments)
    }

    /// Logs a discrepancy when a running machine's spec no longer matches
    /// its tier; never mutates the running machine in place (spec §4.5).
    pub fn enforce_session_limits(&self, _id: Uuid) -> bool {
        // No in-place resize support on the provider side; always a no-op
        // that reports success unless a future provider adds live resize.
        true
    }

    /// Reaps expired sessions and follows up with tag+age-based orphan
    /// cleanup at the adapter level (spec §4.5 `cleanup_expired_sessions`).
    ///
    /// # Errors
    ///
    /// [`ManagerError::Ledger`] if the expired-session scan itself fails;
    /// individual destroy failures are logged, not propagated.
    pub async fn cleanup_expired_sessions(&self) -> Result<u32, ManagerError> {
        let expired = self.ledger.select_expired().await.map_err(ManagerError::Ledger)?;
        let mut destroyed = 0u32;

        for session in expired {
            match self.destroy_session(session.id).await {
                Ok(()) => destroyed += 1,
                Err(err) => warn!(session_id = %session.id, error = %err, "failed to destroy expired session"),
            }
        }

        match self.provider.cleanup_orphaned(ORPHAN_CLEANUP_MAX_AGE).await {
            Ok(count) if count > 0 => info!(count, "orphaned provider machines cleaned up"),
            Ok(_) => {}
            Err(err) => warn!(error = %err, "orphan cleanup at provider level failed"),
        }

        Ok(destroyed)
    }
}

impl AssessmentSeverity {
    fn max(self, other: Self) -> Self {
        use AssessmentSeverity::{Critical, Ok as AOk, Warning};
        match (self, other) {
            (Critical, _) | (_, Critical) => Critical,
            (Warning, _) | (_, Warning) => Warning,
            (AOk, AOk) => AOk,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use previewd_provider::MemoryAdapter;
    use uuid::Uuid;

    use super::*;
    use crate::ledger::InMemoryLedger;
    use crate::realtime::NullRegistrar;

    fn manager() -> ContainerManager {
        ContainerManager::new(
            Arc::new(MemoryAdapter::new()),
            Arc::new(InMemoryLedger::new()),
            Arc::new(NullRegistrar),
            "registry.example/preview:latest".to_owned(),
            Arc::new(|session_id: &str| format!("https://{session_id}.preview.example.com")),
        )
    }

    #[tokio::test]
    async fn create_session_reaches_active() {
        let manager = manager();
        let info = manager
            .create_session(Uuid::new_v4(), Uuid::new_v4(), TierName::Free)
            .await
            .unwrap();
        assert_eq!(info.status, SessionStatus::Active);
        assert!(info.container_url.unwrap().starts_with("https://"));
    }

    #[tokio::test]
    async fn create_session_marks_error_on_provider_failure() {
        let provider = Arc::new(MemoryAdapter::new());
        provider.fail_next_create();
        let manager = ContainerManager::new(
            provider,
            Arc::new(InMemoryLedger::new()),
            Arc::new(NullRegistrar),
            "registry.example/preview:latest".to_owned(),
            Arc::new(|id: &str| format!("https://{id}.preview.example.com")),
        );
        let result = manager.create_session(Uuid::new_v4(), Uuid::new_v4(), TierName::Free).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn destroy_session_is_idempotent() {
        let manager = manager();
        let info = manager
            .create_session(Uuid::new_v4(), Uuid::new_v4(), TierName::Free)
            .await
            .unwrap();
        manager.destroy_session(info.session_id).await.unwrap();
        manager.destroy_session(info.session_id).await.unwrap();
        let status = manager.get_status(info.session_id).await.unwrap().unwrap();
        assert_eq!(status.status, SessionStatus::Ended);
    }

    #[tokio::test]
    async fn destroy_session_on_unknown_id_is_not_found() {
        let manager = manager();
        let result = manager.destroy_session(Uuid::new_v4()).await;
        assert!(matches!(result, Err(ManagerError::NotFound { .. })));
    }

    #[tokio::test]
    async fn cleanup_expired_sessions_destroys_past_deadline_rows() {
        let manager = manager();
        let info = manager
            .create_session(Uuid::new_v4(), Uuid::new_v4(), TierName::Free)
            .await
            .unwrap();

        // Force expiry by ending directly through the ledger's expiry path:
        // insert a second, already-expired session to exercise the scan.
        let ledger = InMemoryLedger::new();
        let id = Uuid::new_v4();
        ledger
            .insert_creating(
                id,
                Uuid::new_v4(),
                Uuid::new_v4(),
                TierName::Free,
                Utc::now() - ChronoDuration::seconds(1),
                "prov-test",
            )
            .await
            .unwrap();
        ledger.mark_active(id, "m-expired", "https://m-expired.preview").await.unwrap();

        let manager = ContainerManager::new(
            Arc::new(MemoryAdapter::new()),
            Arc::new(ledger),
            Arc::new(NullRegistrar),
            "registry.example/preview:latest".to_owned(),
            Arc::new(|sid: &str| format!("https://{sid}.preview.example.com")),
        );
        let destroyed = manager.cleanup_expired_sessions().await.unwrap();
        assert_eq!(destroyed, 1);

        let _ = info;
    }
}
