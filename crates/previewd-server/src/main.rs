//! `previewd` server entry point.
//!
//! Bootstraps the provider adapter, session ledger, monitoring bus, quota
//! engine, and scheduler, then starts the Axum HTTP server with graceful
//! shutdown. Scheduler jobs run alongside the server as background tasks.

use std::sync::Arc;

use anyhow::Context;
use axum::http::HeaderValue;
use reqwest::Client;
use sqlx::postgres::PgPoolOptions;
use tokio::net::TcpListener;
use tracing::info;
use uuid::Uuid;

use previewd_core::ledger::{InMemoryLedger, PostgresLedger, SessionLedger};
use previewd_core::manager::ContainerManager;
use previewd_core::monitoring::MonitoringBus;
use previewd_core::quota::{QuotaEngine, TierResolver};
use previewd_core::realtime::{HttpRegistrar, NullRegistrar, RealtimeRegistrar};
use previewd_core::scheduler::Scheduler;
use previewd_core::session::TierName;
use previewd_provider::{FlyAdapter, MemoryAdapter, ProviderAdapter};

use previewd_server::config::{ProviderKind, ServerConfig};
use previewd_server::routes;
use previewd_server::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = match ServerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("FATAL: {e}");
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .json()
        .init();

    info!(provider = ?config.provider_kind, "previewd starting");

    let state = build_app_state(config).await?;

    let job_handles = state.scheduler.spawn_all();

    let app = routes::router(Arc::clone(&state))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(
            tower_http::cors::CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods([axum::http::Method::GET, axum::http::Method::POST])
                .allow_headers(tower_http::cors::Any),
        )
        .layer(tower_http::set_header::SetResponseHeaderLayer::if_not_present(
            axum::http::header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ));

    let listener = TcpListener::bind(state.config.bind_addr)
        .await
        .with_context(|| format!("failed to bind to {}", state.config.bind_addr))?;

    info!(addr = %state.config.bind_addr, "previewd listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    for handle in job_handles {
        handle.abort();
    }

    info!("previewd stopped");
    Ok(())
}

async fn build_app_state(config: ServerConfig) -> anyhow::Result<Arc<AppState>> {
    let provider: Arc<dyn ProviderAdapter> = match config.provider_kind {
        ProviderKind::Memory => {
            info!("using in-memory provider adapter (no real machines will be created)");
            Arc::new(MemoryAdapter::new())
        }
        ProviderKind::Fly => {
            info!(app = %config.provider_app_name, "using Fly Machines provider adapter");
            Arc::new(
                FlyAdapter::new(
                    config.provider_base_url.clone(),
                    config.provider_app_name.clone(),
                    &config.provider_token,
                )
                .context("failed to construct Fly Machines adapter")?,
            )
        }
    };

    let mut pg_pool: Option<sqlx::PgPool> = None;
    let ledger: Arc<dyn SessionLedger> = if let Some(ref url) = config.database_url {
        info!("using Postgres session ledger");
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await
            .context("failed to connect to Postgres")?;
        pg_pool = Some(pool.clone());
        Arc::new(PostgresLedger::new(pool))
    } else {
        info!("using in-memory session ledger (data will not persist across restarts)");
        Arc::new(InMemoryLedger::new())
    };

    let registrar: Arc<dyn RealtimeRegistrar> = match std::env::var("PREVIEWD_REALTIME_BUS_URL") {
        Ok(url) => Arc::new(HttpRegistrar::new(url)),
        Err(_) => Arc::new(NullRegistrar),
    };

    let preview_domain = config.preview_domain.clone();
    let subdomain_routing = config.subdomain_routing;
    let provider_app_name = config.provider_app_name.clone();
    let public_url_builder: Arc<dyn Fn(&str) -> String + Send + Sync> =
        Arc::new(move |session_id: &str| {
            if subdomain_routing {
                format!("https://{session_id}.{preview_domain}")
            } else {
                format!("https://{provider_app_name}.fly.dev/session/{session_id}")
            }
        });

    let manager = Arc::new(ContainerManager::new(
        Arc::clone(&provider),
        Arc::clone(&ledger),
        registrar,
        config.preview_image.clone(),
        public_url_builder,
    ));

    let monitoring_bus = MonitoringBus::new(config.webhook_url.clone());
    let monitoring = Arc::new(match pg_pool {
        Some(pool) => monitoring_bus.with_persistence(pool),
        None => monitoring_bus,
    });

    let resolver: Arc<dyn TierResolver> = Arc::new(LedgerTierResolver { ledger: Arc::clone(&ledger) });
    let quota = Arc::new(QuotaEngine::new(resolver));

    let scheduler = Arc::new(Scheduler::new(
        Arc::clone(&manager),
        Arc::clone(&monitoring),
        Arc::clone(&provider),
        Arc::clone(&ledger),
    ));

    let auth_client = Client::builder()
        .build()
        .context("failed to construct auth HTTP client")?;

    Ok(Arc::new(AppState {
        manager,
        ledger,
        provider,
        monitoring,
        scheduler,
        quota,
        config,
        auth_client,
    }))
}

/// Resolves a user's tier from their most recent session, defaulting to
/// `Free` for users with no session history yet. `previewd` has no
/// separate billing service of its own (spec §1 Non-goals); tier is
/// whatever the caller requested on their last `create_session`.
struct LedgerTierResolver {
    ledger: Arc<dyn SessionLedger>,
}

#[async_trait::async_trait]
impl TierResolver for LedgerTierResolver {
    async fn tier_for(&self, user_id: Uuid) -> TierName {
        match self.ledger.list_for_user(user_id).await {
            Ok(sessions) => sessions.first().map_or(TierName::Free, |s| s.tier),
            Err(e) => {
                tracing::warn!(error = %e, %user_id, "failed to resolve tier, defaulting to free");
                TierName::Free
            }
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };

    #[cfg(unix)]
    let terminate = async {
        if let Ok(mut sig) =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            sig.recv().await;
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("shutdown signal received, stopping server");
}
