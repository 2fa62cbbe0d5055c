//! Shared application state for the `previewd` server.
//!
//! A single [`AppState`] is constructed at startup and shared across all
//! Axum handlers via `Arc`. It is the composition root spec §9 calls for:
//! component interfaces constructed once at boot, with no process-global
//! mutable state — tests substitute fakes of the provider adapter, session
//! ledger, and realtime registrar directly into this struct.

use std::sync::Arc;

use previewd_core::ledger::SessionLedger;
use previewd_core::manager::ContainerManager;
use previewd_core::monitoring::MonitoringBus;
use previewd_core::quota::QuotaEngine;
use previewd_core::scheduler::Scheduler;
use previewd_provider::ProviderAdapter;

use crate::config::ServerConfig;

/// Shared application state passed to all HTTP handlers.
pub struct AppState {
    pub manager: Arc<ContainerManager>,
    pub ledger: Arc<dyn SessionLedger>,
    pub provider: Arc<dyn ProviderAdapter>,
    pub monitoring: Arc<MonitoringBus>,
    pub scheduler: Arc<Scheduler>,
    pub quota: Arc<QuotaEngine>,
    pub config: ServerConfig,
    pub auth_client: reqwest::Client,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState").finish_non_exhaustive()
    }
}
