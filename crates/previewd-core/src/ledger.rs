//! Session Ledger (C2) — the authoritative persistent record of every
//! session (spec §4.2).
//!
//! Two implementations: [`PostgresLedger`], the production backend (grounded
//! in the parameterized-query style of a `sqlx`-backed repository), and
//! [`InMemoryLedger`], the deterministic fake every test in spec §8 runs
//! against.
//!
//! Per-session serialization (spec §5: concurrent `destroy_session` calls
//! for the same id are totally ordered) is implemented here as an
//! in-process per-id mutex table, not a distributed lock — correct for the
//! single-process deployment model the spec assumes.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use uuid::Uuid;

use crate::error::LedgerError;
use crate::session::{Session, SessionStatus, TierName};

/// Authoritative persistent record of sessions (spec §4.2).
#[async_trait::async_trait]
pub trait SessionLedger: Send + Sync + 'static {
    /// Insert a new session row in `creating` status. `container_id` is the
    /// provisional id allocated before the provider accepts the machine
    /// (spec §4.5 step 1, see [`Session::provisional_container_id`]);
    /// `mark_active` replaces it with the real machine id.
    ///
    /// # Errors
    ///
    /// [`LedgerError::Storage`] on a backing-store failure.
    async fn insert_creating(
        &self,
        id: Uuid,
        user_id: Uuid,
        project_id: Uuid,
        tier: TierName,
        expires_at: DateTime<Utc>,
        container_id: &str,
    ) -> Result<Session, LedgerError>;

    /// Transition `creating → active`.
    ///
    /// # Errors
    ///
    /// [`LedgerError::NotFound`] if the row does not exist;
    /// [`LedgerError::Storage`] on a backing-store failure.
    async fn mark_active(
        &self,
        id: Uuid,
        container_id: &str,
        url: &str,
    ) -> Result<(), LedgerError>;

    /// Transition any status → `error`.
    ///
    /// # Errors
    ///
    /// [`LedgerError::Storage`] on a backing-store failure. A missing row is
    /// tolerated (logged, not an error) — this is called from failure paths
    /// where the row's prior existence isn't guaranteed.
    async fn mark_error(&self, id: Uuid, message: &str) -> Result<(), LedgerError>;

    /// Transition to `ended`, setting `ended_at=now`. Idempotent: marking an
    /// already-ended session ended again is a no-op, not an error.
    ///
    /// # Errors
    ///
    /// [`LedgerError::Storage`] on a backing-store failure.
    async fn mark_ended(&self, id: Uuid) -> Result<(), LedgerError>;

    /// Fetch a session by id.
    ///
    /// # Errors
    ///
    /// [`LedgerError::Storage`] on a backing-store failure.
    async fn get(&self, id: Uuid) -> Result<Option<Session>, LedgerError>;

    /// List sessions owned by `user_id`.
    ///
    /// # Errors
    ///
    /// [`LedgerError::Storage`] on a backing-store failure.
    async fn list_for_user(&self, user_id: Uuid) -> Result<Vec<Session>, LedgerError>;

    /// Rows whose `expires_at < now` and `status ∈ {creating, active}`.
    ///
    /// # Errors
    ///
    /// [`LedgerError::Storage`] on a backing-store failure.
    async fn select_expired(&self) -> Result<Vec<Session>, LedgerError>;

    /// Container ids of every session currently `active`, used by the
    /// orphan reaper to cross-reference provider machines against the
    /// ledger.
    ///
    /// # Errors
    ///
    /// [`LedgerError::Storage`] on a backing-store failure.
    async fn select_orphan_check_set(&self) -> Result<Vec<String>, LedgerError>;

    /// Acquire the per-session advisory lock guarding state transitions for
    /// `id` (spec §5). Holding this lock across a read-then-write sequence
    /// makes concurrent `destroy_session` calls for the same id observe each
    /// other's effects.
    async fn lock_session(&self, id: Uuid) -> OwnedMutexGuard<()>;
}

/// Production ledger backed by PostgreSQL.
#[derive(Clone)]
pub struct PostgresLedger {
    pool: PgPool,
    locks: Arc<RwLock<HashMap<Uuid, Arc<Mutex<()>>>>>,
}

impl PostgresLedger {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            locks: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    async fn lock_for(&self, id: Uuid) -> Arc<Mutex<()>> {
        if let Some(lock) = self.locks.read().await.get(&id) {
            return lock.clone();
        }
        let mut locks = self.locks.write().await;
        locks.entry(id).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }
}

#[async_trait::async_trait]
impl SessionLedger for PostgresLedger {
    async fn insert_creating(
        &self,
        id: Uuid,
        user_id: Uuid,
        project_id: Uuid,
        tier: TierName,
        expires_at: DateTime<Utc>,
        container_id: &str,
    ) -> Result<Session, LedgerError> {
        let session = sqlx::query_as::<_, Session>(
            r"INSERT INTO sessions
                (id, user_id, project_id, tier, status, expires_at, container_id)
              VALUES ($1, $2, $3, $4, 'creating', $5, $6)
              RETURNING *",
        )
        .bind(id)
        .bind(user_id)
        .bind(project_id)
        .bind(tier)
        .bind(expires_at)
        .bind(container_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(session)
    }

    async fn mark_active(
        &self,
        id: Uuid,
        container_id: &str,
        url: &str,
    ) -> Result<(), LedgerError> {
        let result = sqlx::query(
            r"UPDATE sessions
              SET status = 'active', container_id = $2, container_url = $3, updated_at = now()
              WHERE id = $1",
        )
        .bind(id)
        .bind(container_id)
        .bind(url)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(LedgerError::NotFound { id: id.to_string() });
        }
        Ok(())
    }

    async fn mark_error(&self, id: Uuid, message: &str) -> Result<(), LedgerError> {
        sqlx::query(
            r"UPDATE sessions
              SET status = 'error', error_message = $2, updated_at = now()
              WHERE id = $1",
        )
        .bind(id)
        .bind(message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_ended(&self, id: Uuid) -> Result<(), LedgerError> {
        sqlx::query(
            r"UPDATE sessions
              SET status = 'ended', ended_at = now(), updated_at = now()
              WHERE id = $1 AND status != 'ended'",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Session>, LedgerError> {
        let session = sqlx::query_as::<_, Session>("SELECT * FROM sessions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(session)
    }

    async fn list_for_user(&self, user_id: Uuid) -> Result<Vec<Session>, LedgerError> {
        let sessions = sqlx::query_as::<_, Session>(
            "SELECT * FROM sessions WHERE user_id = $1 ORDER BY created_at DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(sessions)
    }

    async fn select_expired(&self) -> Result<Vec<Session>, LedgerError> {
        let sessions = sqlx::query_as::<_, Session>(
            r"SELECT * FROM sessions
              WHERE expires_at < now() AND status IN ('creating', 'active')",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(sessions)
    }

    async fn select_orphan_check_set(&self) -> Result<Vec<String>, LedgerError> {
        let ids: Vec<(String,)> = sqlx::query_as(
            r"SELECT container_id FROM sessions
              WHERE status = 'active' AND container_id IS NOT NULL",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(ids.into_iter().map(|(id,)| id).collect())
    }

    async fn lock_session(&self, id: Uuid) -> OwnedMutexGuard<()> {
        self.lock_for(id).await.lock_owned().await
    }
}

/// Deterministic in-memory ledger fake, used by every test in spec §8.
#[derive(Clone, Default)]
pub struct InMemoryLedger {
    sessions: Arc<RwLock<HashMap<Uuid, Session>>>,
    locks: Arc<RwLock<HashMap<Uuid, Arc<Mutex<()>>>>>,
}

impl InMemoryLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    async fn lock_for(&self, id: Uuid) -> Arc<Mutex<()>> {
        if let Some(lock) = self.locks.read().await.get(&id) {
            return lock.clone();
        }
        let mut locks = self.locks.write().await;
        locks.entry(id).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }
}

#[async_trait::async_trait]
impl SessionLedger for InMemoryLedger {
    async fn insert_creating(
        &self,
        id: Uuid,
        user_id: Uuid,
        project_id: Uuid,
        tier: TierName,
        expires_at: DateTime<Utc>,
        container_id: &str,
    ) -> Result<Session, LedgerError> {
        let now = Utc::now();
        let session = Session {
            id,
            user_id,
            project_id,
            container_id: Some(container_id.to_owned()),
            container_url: None,
            tier,
            status: SessionStatus::Creating,
            error_message: None,
            created_at: now,
            updated_at: now,
            ended_at: None,
            expires_at,
        };
        self.sessions.write().await.insert(id, session.clone());
        Ok(session)
    }

    async fn mark_active(
        &self,
        id: Uuid,
        container_id: &str,
        url: &str,
    ) -> Result<(), LedgerError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(&id)
            .ok_or_else(|| LedgerError::NotFound { id: id.to_string() })?;
        session.status = SessionStatus::Active;
        session.container_id = Some(container_id.to_owned());
        session.container_url = Some(url.to_owned());
        session.updated_at = Utc::now();
        Ok(())
    }

    async fn mark_error(&self, id: Uuid, message: &str) -> Result<(), LedgerError> {
        if let Some(session) = self.sessions.write().await.get_mut(&id) {
            session.status = SessionStatus::Error;
            session.error_message = Some(message.to_owned());
            session.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn mark_ended(&self, id: Uuid) -> Result<(), LedgerError> {
        if let Some(session) = self.sessions.write().await.get_mut(&id) {
            if session.status != SessionStatus::Ended {
                session.status = SessionStatus::Ended;
                session.ended_at = Some(Utc::now());
                session.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Session>, LedgerError> {
        Ok(self.sessions.read().await.get(&id).cloned())
    }

    async fn list_for_user(&self, user_id: Uuid) -> Result<Vec<Session>, LedgerError> {
        let mut sessions: Vec<Session> = self
            .sessions
            .read()
            .await
            .values()
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect();
        sessions.sort_by_key(|s| std::cmp::Reverse(s.created_at));
        Ok(sessions)
    }

    async fn select_expired(&self) -> Result<Vec<Session>, LedgerError> {
        let now = Utc::now();
        Ok(self
            .sessions
            .read()
            .await
            .values()
            .filter(|s| {
                s.expires_at < now
                    && matches!(s.status, SessionStatus::Creating | SessionStatus::Active)
            })
            .cloned()
            .collect())
    }

    async fn select_orphan_check_set(&self) -> Result<Vec<String>, LedgerError> {
        Ok(self
            .sessions
            .read()
            .await
            .values()
            .filter(|s| s.status == SessionStatus::Active)
            .filter_map(|s| s.container_id.clone())
            .collect())
    }

    async fn lock_session(&self, id: Uuid) -> OwnedMutexGuard<()> {
        self.lock_for(id).await.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids() -> (Uuid, Uuid, Uuid) {
        (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4())
    }

    #[tokio::test]
    async fn insert_then_get_roundtrip() {
        let ledger = InMemoryLedger::new();
        let (id, user_id, project_id) = ids();
        let expires = Utc::now() + chrono::Duration::hours(2);
        ledger
            .insert_creating(id, user_id, project_id, TierName::Free, expires, "prov-test")
            .await
            .unwrap();
        let fetched = ledger.get(id).await.unwrap().unwrap();
        assert_eq!(fetched.status, SessionStatus::Creating);
        assert_eq!(fetched.expires_at, expires);
    }

    #[tokio::test]
    async fn mark_active_transitions_status() {
        let ledger = InMemoryLedger::new();
        let (id, user_id, project_id) = ids();
        ledger
            .insert_creating(id, user_id, project_id, TierName::Free, Utc::now(), "prov-test")
            .await
            .unwrap();
        ledger.mark_active(id, "m1", "https://m1.preview").await.unwrap();
        let fetched = ledger.get(id).await.unwrap().unwrap();
        assert_eq!(fetched.status, SessionStatus::Active);
        assert_eq!(fetched.container_id.as_deref(), Some("m1"));
    }

    #[tokio::test]
    async fn mark_active_on_missing_session_is_not_found() {
        let ledger = InMemoryLedger::new();
        let result = ledger.mark_active(Uuid::new_v4(), "m1", "url").await;
        assert!(matches!(result, Err(LedgerError::NotFound { .. })));
    }

    #[tokio::test]
    async fn mark_ended_is_idempotent() {
        let ledger = InMemoryLedger::new();
        let (id, user_id, project_id) = ids();
        ledger
            .insert_creating(id, user_id, project_id, TierName::Free, Utc::now(), "prov-test")
            .await
            .unwrap();
        ledger.mark_ended(id).await.unwrap();
        let first_ended_at = ledger.get(id).await.unwrap().unwrap().ended_at;
        ledger.mark_ended(id).await.unwrap();
        let second_ended_at = ledger.get(id).await.unwrap().unwrap().ended_at;
        assert_eq!(first_ended_at, second_ended_at);
    }

    #[tokio::test]
    async fn list_for_user_orders_most_recent_first() {
        let ledger = InMemoryLedger::new();
        let user_id = Uuid::new_v4();
        let (first, second, third) = ids();

        for (id, age_hours) in [(first, 2), (second, 1), (third, 0)] {
            ledger
                .insert_creating(id, user_id, Uuid::new_v4(), TierName::Free, Utc::now(), "prov-test")
                .await
                .unwrap();
            if let Some(session) = ledger.sessions.write().await.get_mut(&id) {
                session.created_at = Utc::now() - chrono::Duration::hours(age_hours);
            }
        }

        let sessions = ledger.list_for_user(user_id).await.unwrap();
        let session_ids: Vec<Uuid> = sessions.iter().map(|s| s.id).collect();
        assert_eq!(session_ids, vec![third, second, first]);
    }

    #[tokio::test]
    async fn select_expired_only_returns_creating_or_active_past_deadline() {
        let ledger = InMemoryLedger::new();
        let (id, user_id, project_id) = ids();
        ledger
            .insert_creating(
                id,
                user_id,
                project_id,
                TierName::Free,
                Utc::now() - chrono::Duration::seconds(1),
                "prov-test",
            )
            .await
            .unwrap();
        let expired = ledger.select_expired().await.unwrap();
        assert_eq!(expired.len(), 1);

        ledger.mark_ended(id).await.unwrap();
        let expired = ledger.select_expired().await.unwrap();
        assert!(expired.is_empty());
    }

    #[tokio::test]
    async fn select_orphan_check_set_only_includes_active_with_container_id() {
        let ledger = InMemoryLedger::new();
        let (id, user_id, project_id) = ids();
        ledger
            .insert_creating(id, user_id, project_id, TierName::Free, Utc::now(), "prov-test")
            .await
            .unwrap();
        assert!(ledger.select_orphan_check_set().await.unwrap().is_empty());
        ledger.mark_active(id, "m1", "https://m1.preview").await.unwrap();
        assert_eq!(ledger.select_orphan_check_set().await.unwrap(), vec!["m1".to_owned()]);
    }

    #[tokio::test]
    async fn lock_session_serializes_concurrent_holders() {
        let ledger = InMemoryLedger::new();
        let id = Uuid::new_v4();
        let guard = ledger.lock_session(id).await;
        let ledger2 = ledger.clone();
        let handle = tokio::spawn(async move {
            let _second_guard = ledger2.lock_session(id).await;
        });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!handle.is_finished());
        drop(guard);
        handle.await.unwrap();
    }
}
