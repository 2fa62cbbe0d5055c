//! Session data model (C2's row shape, spec §3).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Pricing/resource tier, closed set per spec §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TierName {
    Free,
    Basic,
    Pro,
    Enterprise,
}

impl std::fmt::Display for TierName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Free => write!(f, "free"),
            Self::Basic => write!(f, "basic"),
            Self::Pro => write!(f, "pro"),
            Self::Enterprise => write!(f, "enterprise"),
        }
    }
}

impl std::str::FromStr for TierName {
    type Err = String;

    /// Unknown names fall back to `free` — `policy_for` depends on this
    /// being infallible in practice, but `FromStr` itself still reports the
    /// unrecognized string so callers can log it.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "free" => Ok(Self::Free),
            "basic" => Ok(Self::Basic),
            "pro" => Ok(Self::Pro),
            "enterprise" => Ok(Self::Enterprise),
            other => Err(format!("unknown tier: {other}")),
        }
    }
}

/// Session lifecycle status, closed set per spec §3/§4.5.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Creating,
    Active,
    Error,
    Ended,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Creating => write!(f, "creating"),
            Self::Active => write!(f, "active"),
            Self::Error => write!(f, "error"),
            Self::Ended => write!(f, "ended"),
        }
    }
}

/// A preview session row (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Session {
    pub id: Uuid,
    pub user_id: Uuid,
    pub project_id: Uuid,
    pub container_id: Option<String>,
    pub container_url: Option<String>,
    pub tier: TierName,
    pub status: SessionStatus,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
}

impl Session {
    /// A provisional container id assigned before the provider accepts
    /// creation (spec §3's `container_id` note).
    #[must_use]
    pub fn provisional_container_id(session_id: Uuid) -> String {
        format!("prov-{session_id}")
    }
}

/// Public-facing session view returned by the Control API.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub session_id: Uuid,
    pub container_id: Option<String>,
    pub container_url: Option<String>,
    pub status: SessionStatus,
    pub error_message: Option<String>,
    pub expires_at: DateTime<Utc>,
}

impl From<Session> for SessionInfo {
    fn from(s: Session) -> Self {
        Self {
            session_id: s.id,
            container_id: s.container_id,
            container_url: s.container_url,
            status: s.status,
            error_message: s.error_message,
            expires_at: s.expires_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn tier_name_roundtrips_through_display_and_from_str() {
        for tier in [TierName::Free, TierName::Basic, TierName::Pro, TierName::Enterprise] {
            let parsed = TierName::from_str(&tier.to_string()).unwrap();
            assert_eq!(parsed, tier);
        }
    }

    #[test]
    fn tier_name_from_str_rejects_unknown() {
        assert!(TierName::from_str("platinum").is_err());
    }

    #[test]
    fn provisional_container_id_is_derived_from_session_id() {
        let id = Uuid::nil();
        assert_eq!(Session::provisional_container_id(id), format!("prov-{id}"));
    }
}
