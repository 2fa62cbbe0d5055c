//! Server configuration for `previewd`.
//!
//! Loads configuration from environment variables with sensible dev
//! defaults; fails fast (exit code 1) on missing variables that are
//! genuine boot-time requirements (spec §6), rather than silently
//! defaulting them.

use std::net::SocketAddr;

/// Which [`previewd_provider::ProviderAdapter`] backs this deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    /// The real Fly Machines API.
    Fly,
    /// In-process fake, for local development and CI.
    Memory,
}

/// Server configuration, resolved once at boot.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the HTTP listener to.
    pub bind_addr: SocketAddr,
    /// Log level filter (e.g., `info`, `debug`, `warn`).
    pub log_level: String,
    /// External auth-service base URL, used to exchange bearer tokens for
    /// `{user_id, email}` (spec §6).
    pub auth_service_url: String,
    /// Shared secret this service presents to the auth service.
    pub auth_service_key: String,
    /// Machines provider base URL.
    pub provider_base_url: String,
    /// Machines provider API token.
    pub provider_token: String,
    /// Machines provider app name (machines are created under this app).
    pub provider_app_name: String,
    /// Container image used for every preview session.
    pub preview_image: String,
    /// Optional webhook URL that receives critical alerts.
    pub webhook_url: Option<String>,
    /// Whether preview URLs use subdomain routing
    /// (`https://<session>.preview.<domain>`) or path routing
    /// (`https://<app>.fly.dev/session/<session>`) — a pure function of
    /// this one flag, checked once per process (spec §9 resolved open
    /// question).
    pub subdomain_routing: bool,
    /// Domain used when `subdomain_routing` is enabled.
    pub preview_domain: String,
    /// Which provider adapter to construct.
    pub provider_kind: ProviderKind,
    /// Postgres connection string. When unset the session ledger falls
    /// back to an in-memory map (data does not survive a restart).
    pub database_url: Option<String>,
    /// Email addresses allowed to call admin-only routes (currently just
    /// `POST /sessions/cleanup`). Spec names no separate admin-claim
    /// mechanism, so this is the simplest allow-list that fits the
    /// existing `Identity{user_id,email}` shape.
    pub admin_emails: Vec<String>,
}

/// A variable required at boot was missing or unparseable.
#[derive(Debug, thiserror::Error)]
#[error("missing or invalid required configuration: {0}")]
pub struct ConfigError(pub String);

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `PORT` — port to bind on (Railway/Fly convention, binds to `0.0.0.0`)
    /// - `PREVIEWD_BIND_ADDR` — full bind address (overrides `PORT`, default: `127.0.0.1:8100`)
    /// - `PREVIEWD_LOG_LEVEL` — log filter (default: `info`)
    /// - `PREVIEWD_AUTH_SERVICE_URL` — required
    /// - `PREVIEWD_AUTH_SERVICE_KEY` — required
    /// - `PREVIEWD_PROVIDER_TOKEN` — required
    /// - `PREVIEWD_PROVIDER_APP_NAME` — required
    /// - `PREVIEWD_PROVIDER_BASE_URL` — default: `https://api.machines.dev/v1`
    /// - `PREVIEWD_PREVIEW_IMAGE` — default: `registry.example/preview:latest`
    /// - `PREVIEWD_WEBHOOK_URL` — optional
    /// - `PREVIEWD_USE_SUBDOMAIN_ROUTING` — `true`/`false` (default: `false`)
    /// - `PREVIEWD_PREVIEW_DOMAIN` — default: `preview.example.com`
    /// - `PREVIEWD_PROVIDER_KIND` — `fly`/`memory` (default: `fly`)
    /// - `PREVIEWD_DATABASE_URL` — optional Postgres URL; unset uses an
    ///   in-memory session ledger
    /// - `PREVIEWD_ADMIN_EMAILS` — comma-separated allow-list for
    ///   admin-only routes (default: empty, no admin access)
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] naming the first missing required variable.
    pub fn from_env() -> Result<Self, ConfigError> {
        let bind_addr = if let Ok(addr) = std::env::var("PREVIEWD_BIND_ADDR") {
            addr.parse()
                .map_err(|_| ConfigError(format!("PREVIEWD_BIND_ADDR is not a valid address: {addr}")))?
        } else if let Ok(port_str) = std::env::var("PORT") {
            let port: u16 = port_str
                .parse()
                .map_err(|_| ConfigError(format!("PORT is not a valid port: {port_str}")))?;
            SocketAddr::from(([0, 0, 0, 0], port))
        } else {
            SocketAddr::from(([127, 0, 0, 1], 8100))
        };

        let log_level = std::env::var("PREVIEWD_LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());

        let auth_service_url = required_env("PREVIEWD_AUTH_SERVICE_URL")?;
        let auth_service_key = required_env("PREVIEWD_AUTH_SERVICE_KEY")?;
        let provider_token = required_env("PREVIEWD_PROVIDER_TOKEN")?;
        let provider_app_name = required_env("PREVIEWD_PROVIDER_APP_NAME")?;

        let provider_base_url = std::env::var("PREVIEWD_PROVIDER_BASE_URL")
            .unwrap_or_else(|_| "https://api.machines.dev/v1".to_owned());
        let preview_image = std::env::var("PREVIEWD_PREVIEW_IMAGE")
            .unwrap_or_else(|_| "registry.example/preview:latest".to_owned());
        let webhook_url = std::env::var("PREVIEWD_WEBHOOK_URL").ok();

        let subdomain_routing = std::env::var("PREVIEWD_USE_SUBDOMAIN_ROUTING")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);
        let preview_domain = std::env::var("PREVIEWD_PREVIEW_DOMAIN")
            .unwrap_or_else(|_| "preview.example.com".to_owned());

        let provider_kind = match std::env::var("PREVIEWD_PROVIDER_KIND").as_deref() {
            Ok("memory") => ProviderKind::Memory,
            Ok("fly") | Err(_) => ProviderKind::Fly,
            Ok(other) => return Err(ConfigError(format!("unknown PREVIEWD_PROVIDER_KIND: {other}"))),
        };
        let database_url = std::env::var("PREVIEWD_DATABASE_URL").ok();
        let admin_emails = std::env::var("PREVIEWD_ADMIN_EMAILS")
            .map(|v| v.split(',').map(|s| s.trim().to_lowercase()).filter(|s| !s.is_empty()).collect())
            .unwrap_or_default();

        Ok(Self {
            bind_addr,
            log_level,
            auth_service_url,
            auth_service_key,
            provider_base_url,
            provider_token,
            provider_app_name,
            preview_image,
            webhook_url,
            subdomain_routing,
            preview_domain,
            provider_kind,
            database_url,
            admin_emails,
        })
    }

    /// Whether `email` is allowed to call admin-only routes.
    #[must_use]
    pub fn is_admin(&self, email: &str) -> bool {
        self.admin_emails.iter().any(|e| e == &email.to_lowercase())
    }

    /// Builds a session's public URL per the fixed routing rule (spec §6/§9).
    #[must_use]
    pub fn preview_url(&self, session_id: &str) -> String {
        if self.subdomain_routing {
            format!("https://{session_id}.{}", self.preview_domain)
        } else {
            format!("https://{}.fly.dev/session/{session_id}", self.provider_app_name)
        }
    }
}

fn required_env(name: &str) -> Result<String, ConfigError> {
    std::env::var(name).map_err(|_| ConfigError(format!("{name} is required but not set")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preview_url_uses_path_routing_by_default() {
        let config = ServerConfig {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8100)),
            log_level: "info".to_owned(),
            auth_service_url: "https://auth.example.com".to_owned(),
            auth_service_key: "key".to_owned(),
            provider_base_url: "https://api.machines.dev/v1".to_owned(),
            provider_token: "token".to_owned(),
            provider_app_name: "previewd-app".to_owned(),
            preview_image: "registry.example/preview:latest".to_owned(),
            webhook_url: None,
            subdomain_routing: false,
            preview_domain: "preview.example.com".to_owned(),
            provider_kind: ProviderKind::Memory,
            database_url: None,
            admin_emails: Vec::new(),
        };
        assert_eq!(
            config.preview_url("s1"),
            "https://previewd-app.fly.dev/session/s1"
        );
    }

    #[test]
    fn preview_url_uses_subdomain_when_enabled() {
        let config = ServerConfig {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8100)),
            log_level: "info".to_owned(),
            auth_service_url: "https://auth.example.com".to_owned(),
            auth_service_key: "key".to_owned(),
            provider_base_url: "https://api.machines.dev/v1".to_owned(),
            provider_token: "token".to_owned(),
            provider_app_name: "previewd-app".to_owned(),
            preview_image: "registry.example/preview:latest".to_owned(),
            webhook_url: None,
            subdomain_routing: true,
            preview_domain: "preview.example.com".to_owned(),
            provider_kind: ProviderKind::Memory,
            database_url: None,
            admin_emails: Vec::new(),
        };
        assert_eq!(config.preview_url("s1"), "https://s1.preview.example.com");
    }

    #[test]
    fn is_admin_matches_case_insensitively() {
        let config = ServerConfig {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8100)),
            log_level: "info".to_owned(),
            auth_service_url: "https://auth.example.com".to_owned(),
            auth_service_key: "key".to_owned(),
            provider_base_url: "https://api.machines.dev/v1".to_owned(),
            provider_token: "token".to_owned(),
            provider_app_name: "previewd-app".to_owned(),
            preview_image: "registry.example/preview:latest".to_owned(),
            webhook_url: None,
            subdomain_routing: false,
            preview_domain: "preview.example.com".to_owned(),
            provider_kind: ProviderKind::Memory,
            database_url: None,
            admin_emails: vec!["admin@example.com".to_owned()],
        };
        assert!(config.is_admin("Admin@example.com"));
        assert!(!config.is_admin("nobody@example.com"));
    }
}
