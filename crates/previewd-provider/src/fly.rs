//! HTTP provider adapter backed by a Fly-Machines-style REST API.
//!
//! Talks to `https://api.machines.dev/v1/apps/{app}/machines` (or a
//! configured base URL, for pointing at a staging API or a local stub in
//! integration tests) using a Bearer-token-authenticated `reqwest::Client`.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::{
    CheckStatus, MachineCheck, MachineDescriptor, MachineSpec, MachineState, ProviderAdapter,
    ProviderError,
};

const POLL_INTERVAL: Duration = Duration::from_secs(2);
const DESTROY_RETRY_BACKOFF: Duration = Duration::from_secs(2);
const DESTROY_MAX_ATTEMPTS: u32 = 3;

/// Production [`ProviderAdapter`] implementation.
#[derive(Debug, Clone)]
pub struct FlyAdapter {
    client: reqwest::Client,
    base_url: String,
    app_name: String,
}

impl FlyAdapter {
    /// Build an adapter for the given app, authenticating every request with
    /// `token`.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Transport`] if the underlying `reqwest`
    /// client cannot be constructed (e.g. invalid TLS configuration).
    pub fn new(base_url: impl Into<String>, app_name: impl Into<String>, token: &str) -> Result<Self, ProviderError> {
        let mut headers = reqwest::header::HeaderMap::new();
        let mut auth_value = reqwest::header::HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|e| ProviderError::Transport(format!("invalid token header: {e}")))?;
        auth_value.set_sensitive(true);
        headers.insert(reqwest::header::AUTHORIZATION, auth_value);

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| ProviderError::Transport(format!("failed to build http client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.into(),
            app_name: app_name.into(),
        })
    }

    fn machines_url(&self) -> String {
        format!("{}/v1/apps/{}/machines", self.base_url, self.app_name)
    }

    fn machine_url(&self, machine_id: &str) -> String {
        format!("{}/{machine_id}", self.machines_url())
    }
}

#[derive(Debug, Serialize)]
struct CreateMachineRequest {
    name: String,
    region: Option<String>,
    config: MachineConfig,
}

#[derive(Debug, Serialize)]
struct MachineConfig {
    image: String,
    guest: GuestConfig,
    services: Vec<ServiceConfig>,
    checks: std::collections::HashMap<String, RemoteCheckConfig>,
    metadata: std::collections::HashMap<String, String>,
    restart: RestartConfig,
    init: InitConfig,
}

#[derive(Debug, Serialize)]
struct GuestConfig {
    cpu_kind: String,
    cpus: u32,
    memory_mb: u32,
}

#[derive(Debug, Serialize)]
struct ServiceConfig {
    protocol: String,
    internal_port: u16,
    ports: Vec<PortConfig>,
}

#[derive(Debug, Serialize)]
struct PortConfig {
    port: u16,
    handlers: Vec<String>,
}

#[derive(Debug, Serialize)]
struct RemoteCheckConfig {
    #[serde(rename = "type")]
    kind: String,
    interval: String,
    path: Option<String>,
}

#[derive(Debug, Serialize)]
struct RestartConfig {
    policy: String,
}

#[derive(Debug, Serialize)]
struct InitConfig {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    entrypoint: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct MachineResponse {
    id: String,
    name: String,
    state: String,
    region: String,
    #[serde(default)]
    private_ip: Option<String>,
    created_at: DateTime<Utc>,
    #[serde(default)]
    checks: Vec<RemoteCheckStatus>,
    #[serde(default)]
    config: Option<ResponseConfig>,
}

#[derive(Debug, Deserialize)]
struct ResponseConfig {
    #[serde(default)]
    metadata: std::collections::HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct RemoteCheckStatus {
    name: String,
    status: String,
}

fn parse_state(raw: &str) -> MachineState {
    match raw {
        "started" => MachineState::Started,
        "stopping" => MachineState::Stopping,
        "stopped" => MachineState::Stopped,
        "failed" => MachineState::Failed,
        "destroyed" => MachineState::Destroyed,
        _ => MachineState::Created,
    }
}

fn parse_check_status(raw: &str) -> CheckStatus {
    match raw {
        "passing" => CheckStatus::Passing,
        "warning" => CheckStatus::Warning,
        _ => CheckStatus::Critical,
    }
}

impl From<MachineResponse> for MachineDescriptor {
    fn from(resp: MachineResponse) -> Self {
        let tags = resp
            .config
            .map(|c| c.metadata)
            .unwrap_or_default();
        Self {
            id: resp.id,
            name: resp.name,
            state: parse_state(&resp.state),
            region: resp.region,
            url: resp
                .private_ip
                .map(|ip| format!("http://{ip}"))
                .unwrap_or_default(),
            created_at: resp.created_at,
            checks: resp
                .checks
                .into_iter()
                .map(|c| MachineCheck {
                    name: c.name,
                    status: parse_check_status(&c.status),
                })
                .collect(),
            tags,
        }
    }
}

impl From<&MachineSpec> for CreateMachineRequest {
    fn from(spec: &MachineSpec) -> Self {
        let cpu_kind = match spec.cpu_kind {
            crate::CpuKind::Shared => "shared",
            crate::CpuKind::Dedicated => "performance",
        };
        let mut metadata = spec.tags.clone();
        metadata.insert(crate::PROJECT_TAG_KEY.to_owned(), spec.project_id.clone());
        metadata.insert(crate::SESSION_TAG_KEY.to_owned(), spec.session_id.clone());
        metadata.insert(
            crate::SERVICE_TAG_KEY.to_owned(),
            crate::SERVICE_TAG_VALUE.to_owned(),
        );

        let checks = spec
            .checks
            .iter()
            .map(|c| {
                let (kind, path) = match &c.kind {
                    crate::CheckKind::Http { path } => ("http".to_owned(), Some(path.clone())),
                    crate::CheckKind::Script { .. } => ("script".to_owned(), None),
                };
                (
                    c.name.clone(),
                    RemoteCheckConfig {
                        kind,
                        interval: format!("{}s", c.interval_secs),
                        path,
                    },
                )
            })
            .collect();

        Self {
            name: format!("previewd-{}", spec.session_id),
            region: None,
            config: MachineConfig {
                image: spec.image.clone(),
                guest: GuestConfig {
                    cpu_kind: cpu_kind.to_owned(),
                    cpus: spec.cpus,
                    memory_mb: spec.memory_mb,
                },
                services: spec
                    .allowed_ports
                    .iter()
                    .map(|&port| ServiceConfig {
                        protocol: "tcp".to_owned(),
                        internal_port: port,
                        ports: vec![PortConfig {
                            port,
                            handlers: vec!["tls".to_owned(), "http".to_owned()],
                        }],
                    })
                    .collect(),
                checks,
                metadata,
                restart: RestartConfig {
                    policy: "no".to_owned(),
                },
                init: InitConfig { entrypoint: Vec::new() },
            },
        }
    }
}

#[async_trait::async_trait]
impl ProviderAdapter for FlyAdapter {
    async fn create_machine(
        &self,
        spec: MachineSpec,
        deadline: Duration,
    ) -> Result<MachineDescriptor, ProviderError> {
        let request = CreateMachineRequest::from(&spec);
        let response = self
            .client
            .post(self.machines_url())
            .json(&request)
            .send()
            .await
            .map_err(|e| ProviderError::Transport(format!("create machine request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::ProvisionFailure {
                reason: format!("provider returned {status}: {body}"),
            });
        }

        let created: MachineResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Transport(format!("invalid create response: {e}")))?;

        debug!(machine_id = %created.id, "machine created, awaiting readiness");
        self.wait_for_ready(&created.id, deadline).await
    }

    async fn destroy_machine(&self, machine_id: &str) -> Result<(), ProviderError> {
        let mut last_reason = String::new();
        for attempt in 1..=DESTROY_MAX_ATTEMPTS {
            let response = self
                .client
                .delete(format!("{}?force=true", self.machine_url(machine_id)))
                .send()
                .await;

            match response {
                Ok(resp) if resp.status() == reqwest::StatusCode::NOT_FOUND => return Ok(()),
                Ok(resp) if resp.status().is_success() => return Ok(()),
                Ok(resp) => {
                    last_reason = format!("provider returned {}", resp.status());
                }
                Err(e) => {
                    last_reason = format!("transport error: {e}");
                }
            }

            warn!(machine_id, attempt, reason = %last_reason, "destroy attempt failed, retrying");
            if attempt < DESTROY_MAX_ATTEMPTS {
                tokio::time::sleep(DESTROY_RETRY_BACKOFF).await;
            }
        }

        error!(machine_id, "destroy exhausted retry budget");
        Err(ProviderError::DestroyFailed {
            machine_id: machine_id.to_owned(),
            attempts: DESTROY_MAX_ATTEMPTS,
            reason: last_reason,
        })
    }

    async fn get_machine(&self, machine_id: &str) -> Result<Option<MachineDescriptor>, ProviderError> {
        let response = self
            .client
            .get(self.machine_url(machine_id))
            .send()
            .await
            .map_err(|e| ProviderError::Transport(format!("get machine request failed: {e}")))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(ProviderError::Transport(format!(
                "provider returned {}",
                response.status()
            )));
        }

        let resp: MachineResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Transport(format!("invalid get response: {e}")))?;
        Ok(Some(resp.into()))
    }

    async fn list_machines(&self) -> Vec<MachineDescriptor> {
        let response = match self.client.get(self.machines_url()).send().await {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "list_machines request failed, returning empty list");
                return Vec::new();
            }
        };

        if !response.status().is_success() {
            warn!(status = %response.status(), "list_machines returned non-success, returning empty list");
            return Vec::new();
        }

        match response.json::<Vec<MachineResponse>>().await {
            Ok(machines) => machines.into_iter().map(Into::into).collect(),
            Err(e) => {
                warn!(error = %e, "list_machines response undecodable, returning empty list");
                Vec::new()
            }
        }
    }

    async fn wait_for_ready(
        &self,
        machine_id: &str,
        deadline: Duration,
    ) -> Result<MachineDescriptor, ProviderError> {
        let start = tokio::time::Instant::now();
        loop {
            let descriptor = self
                .get_machine(machine_id)
                .await?
                .ok_or_else(|| ProviderError::Transport(format!("machine {machine_id} disappeared")))?;

            if descriptor.is_ready() {
                return Ok(descriptor);
            }
            if descriptor.state.is_terminal_for_create() {
                return Err(ProviderError::UnhealthyState {
                    reason: format!("machine {machine_id} entered state {:?}", descriptor.state),
                });
            }
            if start.elapsed() >= deadline {
                return Err(ProviderError::Timeout);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn cleanup_project_containers(&self, project_id: &str) -> Result<u32, ProviderError> {
        let machines = self.list_machines().await;
        let mut count = 0u32;
        for m in machines {
            if m.tags.get(crate::PROJECT_TAG_KEY).map(String::as_str) == Some(project_id)
                && m.state != MachineState::Destroyed
            {
                if let Err(e) = self.destroy_machine(&m.id).await {
                    warn!(machine_id = %m.id, error = %e, "failed to destroy project machine during cleanup");
                    continue;
                }
                count += 1;
            }
        }
        Ok(count)
    }

    async fn cleanup_orphaned(&self, max_age: Duration) -> Result<u32, ProviderError> {
        let cutoff = Utc::now() - chrono::Duration::from_std(max_age).unwrap_or_default();
        let machines = self.list_machines().await;
        let mut count = 0u32;
        for m in machines {
            let owned = m.tags.get(crate::SERVICE_TAG_KEY).map(String::as_str)
                == Some(crate::SERVICE_TAG_VALUE);
            if owned && m.state != MachineState::Destroyed && m.created_at < cutoff {
                if let Err(e) = self.destroy_machine(&m.id).await {
                    warn!(machine_id = %m.id, error = %e, "failed to destroy orphaned machine");
                    continue;
                }
                count += 1;
            }
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_states() {
        assert_eq!(parse_state("started"), MachineState::Started);
        assert_eq!(parse_state("stopped"), MachineState::Stopped);
        assert_eq!(parse_state("bogus"), MachineState::Created);
    }

    #[test]
    fn parses_check_statuses() {
        assert_eq!(parse_check_status("passing"), CheckStatus::Passing);
        assert_eq!(parse_check_status("warning"), CheckStatus::Warning);
        assert_eq!(parse_check_status("critical"), CheckStatus::Critical);
        assert_eq!(parse_check_status("???"), CheckStatus::Critical);
    }

    #[test]
    fn new_rejects_control_characters_in_token() {
        let result = FlyAdapter::new("https://api.machines.dev", "app", "bad\ntoken");
        assert!(result.is_err());
    }

    #[test]
    fn machine_url_nests_under_app() {
        let adapter = FlyAdapter::new("https://api.machines.dev", "previewd-app", "tok").unwrap();
        assert_eq!(
            adapter.machine_url("m1"),
            "https://api.machines.dev/v1/apps/previewd-app/machines/m1"
        );
    }
}
