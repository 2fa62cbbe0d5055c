//! Realtime Registrar (C4) — wires a container into the external
//! message-bus channel the editor uses for file updates (spec §4.4).
//!
//! Both operations are best-effort sidecars: never on the critical path of
//! session create/destroy. Callers log failures and move on.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Channel credentials handed back by the realtime bus on registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelHandle {
    pub channel_name: String,
    pub access_token: String,
}

const RECONNECT_BASE: Duration = Duration::from_secs(1);
const RECONNECT_FACTOR: u32 = 2;
const RECONNECT_MAX_ATTEMPTS: u32 = 5;

/// Registers/unregisters containers against the realtime bus.
#[async_trait::async_trait]
pub trait RealtimeRegistrar: Send + Sync + 'static {
    async fn register(
        &self,
        project_id: &str,
        container_id: &str,
        url: &str,
    ) -> Option<ChannelHandle>;

    async fn unregister(&self, project_id: &str, container_id: &str);
}

/// Real implementation: an HTTP RPC to the realtime bus, with a bounded
/// exponential-backoff reconnect loop on transient failure.
pub struct HttpRegistrar {
    client: reqwest::Client,
    base_url: String,
}

impl HttpRegistrar {
    #[must_use]
    pub fn new(base_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
        }
    }

    async fn register_once(
        &self,
        project_id: &str,
        container_id: &str,
        url: &str,
    ) -> reqwest::Result<ChannelHandle> {
        #[derive(Serialize)]
        struct Body<'a> {
            project_id: &'a str,
            container_id: &'a str,
            url: &'a str,
        }

        let response = self
            .client
            .post(format!("{}/register", self.base_url))
            .json(&Body { project_id, container_id, url })
            .send()
            .await?
            .error_for_status()?;
        response.json::<ChannelHandle>().await
    }
}

#[async_trait::async_trait]
impl RealtimeRegistrar for HttpRegistrar {
    async fn register(
        &self,
        project_id: &str,
        container_id: &str,
        url: &str,
    ) -> Option<ChannelHandle> {
        let mut backoff = RECONNECT_BASE;
        for attempt in 1..=RECONNECT_MAX_ATTEMPTS {
            match self.register_once(project_id, container_id, url).await {
                Ok(handle) => return Some(handle),
                Err(err) if attempt == RECONNECT_MAX_ATTEMPTS => {
                    warn!(
                        project_id,
                        container_id,
                        attempt,
                        error = %err,
                        "realtime registrar exhausted reconnect attempts"
                    );
                    return None;
                }
                Err(err) => {
                    warn!(project_id, container_id, attempt, error = %err, "realtime register failed, retrying");
                    tokio::time::sleep(backoff).await;
                    backoff *= RECONNECT_FACTOR;
                }
            }
        }
        None
    }

    async fn unregister(&self, project_id: &str, container_id: &str) {
        #[derive(Serialize)]
        struct Body<'a> {
            project_id: &'a str,
            container_id: &'a str,
        }

        if let Err(err) = self
            .client
            .post(format!("{}/unregister", self.base_url))
            .json(&Body { project_id, container_id })
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
        {
            warn!(project_id, container_id, error = %err, "realtime unregister failed");
        }
    }
}

/// No-op registrar used by tests and by deployments with no realtime bus
/// configured.
#[derive(Debug, Clone, Default)]
pub struct NullRegistrar;

#[async_trait::async_trait]
impl RealtimeRegistrar for NullRegistrar {
    async fn register(
        &self,
        _project_id: &str,
        _container_id: &str,
        _url: &str,
    ) -> Option<ChannelHandle> {
        None
    }

    async fn unregister(&self, _project_id: &str, _container_id: &str) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn null_registrar_register_returns_none() {
        let registrar = NullRegistrar;
        assert!(registrar.register("p1", "c1", "https://c1.preview").await.is_none());
    }

    #[tokio::test]
    async fn null_registrar_unregister_is_a_no_op() {
        let registrar = NullRegistrar;
        registrar.unregister("p1", "c1").await;
    }
}
