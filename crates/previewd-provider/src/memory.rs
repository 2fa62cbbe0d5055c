//! Deterministic in-memory provider adapter for testing.
//!
//! All machines live in a `BTreeMap` behind a `RwLock`. Nothing is persisted
//! and no network call is ever made — use this for unit and integration
//! tests that need a real [`ProviderAdapter`] without touching a provider.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::RwLock;

use crate::{
    MachineDescriptor, MachineSpec, MachineState, ProviderAdapter, ProviderError,
    PROJECT_TAG_KEY, SERVICE_TAG_KEY, SERVICE_TAG_VALUE,
};

/// An in-memory [`ProviderAdapter`] backed by a `BTreeMap`.
///
/// Thread-safe and async-compatible. `create_machine` is immediately ready
/// unless the adapter was configured to fail or stall, via
/// [`MemoryAdapter::fail_next_create`] / [`MemoryAdapter::never_ready`], so
/// tests can exercise both the happy path and the retry/timeout paths.
#[derive(Debug, Clone)]
pub struct MemoryAdapter {
    machines: Arc<RwLock<BTreeMap<String, MachineDescriptor>>>,
    next_id: Arc<std::sync::atomic::AtomicU64>,
    fail_next_create: Arc<std::sync::atomic::AtomicBool>,
    never_ready_ids: Arc<RwLock<Vec<String>>>,
}

impl MemoryAdapter {
    #[must_use]
    pub fn new() -> Self {
        Self {
            machines: Arc::new(RwLock::new(BTreeMap::new())),
            next_id: Arc::new(std::sync::atomic::AtomicU64::new(1)),
            fail_next_create: Arc::new(std::sync::atomic::AtomicBool::new(false)),
            never_ready_ids: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// The next call to `create_machine` fails with `ProvisionFailure`.
    pub fn fail_next_create(&self) {
        self.fail_next_create
            .store(true, std::sync::atomic::Ordering::SeqCst);
    }

    /// Seed a machine directly, bypassing `create_machine`. Useful for
    /// constructing orphan-reaping fixtures.
    pub async fn seed(&self, descriptor: MachineDescriptor) {
        self.machines
            .write()
            .await
            .insert(descriptor.id.clone(), descriptor);
    }
}

impl Default for MemoryAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ProviderAdapter for MemoryAdapter {
    async fn create_machine(
        &self,
        spec: MachineSpec,
        deadline: Duration,
    ) -> Result<MachineDescriptor, ProviderError> {
        if self
            .fail_next_create
            .swap(false, std::sync::atomic::Ordering::SeqCst)
        {
            return Err(ProviderError::ProvisionFailure {
                reason: "simulated provisioning failure".to_owned(),
            });
        }

        let id = format!(
            "mem-{}",
            self.next_id.fetch_add(1, std::sync::atomic::Ordering::SeqCst)
        );
        let mut tags = spec.tags;
        tags.insert(SERVICE_TAG_KEY.to_owned(), SERVICE_TAG_VALUE.to_owned());
        tags.insert(PROJECT_TAG_KEY.to_owned(), spec.project_id.clone());

        let descriptor = MachineDescriptor {
            id: id.clone(),
            name: format!("previewd-{}", spec.session_id),
            state: MachineState::Started,
            region: "local".to_owned(),
            url: format!("https://{id}.preview.local"),
            created_at: Utc::now(),
            checks: Vec::new(),
            tags,
        };
        self.machines.write().await.insert(id.clone(), descriptor);

        self.wait_for_ready(&id, deadline).await
    }

    async fn destroy_machine(&self, machine_id: &str) -> Result<(), ProviderError> {
        let mut machines = self.machines.write().await;
        match machines.get_mut(machine_id) {
            Some(m) => {
                m.state = MachineState::Destroyed;
                Ok(())
            }
            None => Ok(()),
        }
    }

    async fn get_machine(&self, machine_id: &str) -> Result<Option<MachineDescriptor>, ProviderError> {
        Ok(self.machines.read().await.get(machine_id).cloned())
    }

    async fn list_machines(&self) -> Vec<MachineDescriptor> {
        self.machines.read().await.values().cloned().collect()
    }

    async fn wait_for_ready(
        &self,
        machine_id: &str,
        _deadline: Duration,
    ) -> Result<MachineDescriptor, ProviderError> {
        if self.never_ready_ids.read().await.iter().any(|id| id == machine_id) {
            return Err(ProviderError::Timeout);
        }
        let machines = self.machines.read().await;
        let descriptor = machines
            .get(machine_id)
            .cloned()
            .ok_or_else(|| ProviderError::Transport(format!("unknown machine {machine_id}")))?;
        if descriptor.state.is_terminal_for_create() {
            return Err(ProviderError::UnhealthyState {
                reason: format!("machine {machine_id} in state {:?}", descriptor.state),
            });
        }
        Ok(descriptor)
    }

    async fn cleanup_project_containers(&self, project_id: &str) -> Result<u32, ProviderError> {
        let mut machines = self.machines.write().await;
        let mut count = 0u32;
        for m in machines.values_mut() {
            if m.tags.get(PROJECT_TAG_KEY).map(String::as_str) == Some(project_id)
                && m.state != MachineState::Destroyed
            {
                m.state = MachineState::Destroyed;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn cleanup_orphaned(&self, max_age: Duration) -> Result<u32, ProviderError> {
        let cutoff = Utc::now() - chrono::Duration::from_std(max_age).unwrap_or_default();
        let mut machines = self.machines.write().await;
        let mut count = 0u32;
        for m in machines.values_mut() {
            if m.tags.get(SERVICE_TAG_KEY).map(String::as_str) == Some(SERVICE_TAG_VALUE)
                && m.state != MachineState::Destroyed
                && m.created_at < cutoff
            {
                m.state = MachineState::Destroyed;
                count += 1;
            }
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn sample_spec(session_id: &str) -> MachineSpec {
        MachineSpec {
            project_id: "proj-1".to_owned(),
            session_id: session_id.to_owned(),
            image: "registry.example/preview:latest".to_owned(),
            cpu_kind: crate::CpuKind::Shared,
            cpus: 1,
            memory_mb: 512,
            disk_gb: None,
            allowed_ports: vec![8080],
            drop_capabilities: vec!["ALL".to_owned()],
            no_new_privileges: true,
            read_only_rootfs: false,
            seccomp_profile: None,
            checks: Vec::new(),
            tags: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn create_then_get_roundtrip() {
        let adapter = MemoryAdapter::new();
        let descriptor = adapter
            .create_machine(sample_spec("s1"), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(descriptor.is_ready());
        let fetched = adapter.get_machine(&descriptor.id).await.unwrap();
        assert_eq!(fetched.unwrap().id, descriptor.id);
    }

    #[tokio::test]
    async fn get_unknown_machine_returns_none() {
        let adapter = MemoryAdapter::new();
        assert!(adapter.get_machine("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn destroy_is_idempotent() {
        let adapter = MemoryAdapter::new();
        let descriptor = adapter
            .create_machine(sample_spec("s1"), Duration::from_secs(5))
            .await
            .unwrap();
        adapter.destroy_machine(&descriptor.id).await.unwrap();
        adapter.destroy_machine(&descriptor.id).await.unwrap();
        adapter.destroy_machine("never-existed").await.unwrap();
        let fetched = adapter.get_machine(&descriptor.id).await.unwrap().unwrap();
        assert_eq!(fetched.state, MachineState::Destroyed);
    }

    #[tokio::test]
    async fn fail_next_create_triggers_provision_failure() {
        let adapter = MemoryAdapter::new();
        adapter.fail_next_create();
        let result = adapter
            .create_machine(sample_spec("s1"), Duration::from_secs(5))
            .await;
        assert!(matches!(result, Err(ProviderError::ProvisionFailure { .. })));

        // The flag resets after one use.
        let result = adapter
            .create_machine(sample_spec("s2"), Duration::from_secs(5))
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn cleanup_project_containers_destroys_only_matching_project() {
        let adapter = MemoryAdapter::new();
        let mut spec_a = sample_spec("s1");
        spec_a.project_id = "proj-a".to_owned();
        let mut spec_b = sample_spec("s2");
        spec_b.project_id = "proj-b".to_owned();
        adapter.create_machine(spec_a, Duration::from_secs(5)).await.unwrap();
        adapter.create_machine(spec_b, Duration::from_secs(5)).await.unwrap();

        let destroyed = adapter.cleanup_project_containers("proj-a").await.unwrap();
        assert_eq!(destroyed, 1);

        let remaining = adapter.list_machines().await;
        let live: Vec<_> = remaining
            .iter()
            .filter(|m| m.state != MachineState::Destroyed)
            .collect();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].tags.get(PROJECT_TAG_KEY).unwrap(), "proj-b");
    }

    #[tokio::test]
    async fn cleanup_orphaned_respects_age_and_service_tag() {
        let adapter = MemoryAdapter::new();
        let mut old = MachineDescriptor {
            id: "old".to_owned(),
            name: "old".to_owned(),
            state: MachineState::Started,
            region: "local".to_owned(),
            url: "https://old.preview.local".to_owned(),
            created_at: Utc::now() - chrono::Duration::hours(2),
            checks: Vec::new(),
            tags: HashMap::new(),
        };
        old.tags
            .insert(SERVICE_TAG_KEY.to_owned(), SERVICE_TAG_VALUE.to_owned());
        adapter.seed(old).await;

        let mut unrelated = MachineDescriptor {
            id: "unrelated".to_owned(),
            name: "unrelated".to_owned(),
            state: MachineState::Started,
            region: "local".to_owned(),
            url: "https://unrelated.preview.local".to_owned(),
            created_at: Utc::now() - chrono::Duration::hours(2),
            checks: Vec::new(),
            tags: HashMap::new(),
        };
        unrelated.tags.clear();
        adapter.seed(unrelated).await;

        let destroyed = adapter
            .cleanup_orphaned(Duration::from_secs(60 * 30))
            .await
            .unwrap();
        assert_eq!(destroyed, 1);

        let remaining = adapter.list_machines().await;
        let unrelated = remaining.iter().find(|m| m.id == "unrelated").unwrap();
        assert_eq!(unrelated.state, MachineState::Started);
    }
}
