//! Scheduler (C7) — cron-like driver for five periodic jobs (spec §4.7).
//!
//! Each job is single-flighted against itself via a per-job `Mutex`; the
//! spec explicitly warns against sharing mutexes across jobs, so every job
//! gets its own lock and can fail in isolation (spec §9).

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use previewd_provider::{ProviderAdapter, SERVICE_TAG_KEY, SERVICE_TAG_VALUE};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::error::SchedulerError;
use crate::ledger::SessionLedger;
use crate::manager::ContainerManager;
use crate::monitoring::{MonitoringBus, Severity};

const JOB_HISTORY_CAPACITY: usize = 20;
const ORPHAN_MIN_AGE: Duration = Duration::from_secs(30 * 60);

const CLEANUP_PERIOD: Duration = Duration::from_secs(15 * 60);
const MONITORING_PERIOD: Duration = Duration::from_secs(5 * 60);
const ORPHAN_REAPER_PERIOD: Duration = Duration::from_secs(60 * 60);
const TIMEOUT_ENFORCEMENT_PERIOD: Duration = Duration::from_secs(10 * 60);
const METRICS_COLLECTION_PERIOD: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobName {
    Cleanup,
    Monitoring,
    OrphanReaper,
    TimeoutEnforcement,
    MetricsCollection,
}

impl JobName {
    const ALL: [Self; 5] = [
        Self::Cleanup,
        Self::Monitoring,
        Self::OrphanReaper,
        Self::TimeoutEnforcement,
        Self::MetricsCollection,
    ];

    fn as_str(self) -> &'static str {
        match self {
            Self::Cleanup => "cleanup",
            Self::Monitoring => "monitoring",
            Self::OrphanReaper => "orphan-reaper",
            Self::TimeoutEnforcement => "timeout-enforcement",
            Self::MetricsCollection => "metrics-collection",
        }
    }

    fn from_str(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|job| job.as_str() == name)
    }

    fn period(self) -> Duration {
        match self {
            Self::Cleanup => CLEANUP_PERIOD,
            Self::Monitoring => MONITORING_PERIOD,
            Self::OrphanReaper => ORPHAN_REAPER_PERIOD,
            Self::TimeoutEnforcement => TIMEOUT_ENFORCEMENT_PERIOD,
            Self::MetricsCollection => METRICS_COLLECTION_PERIOD,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobRun {
    pub job: String,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub success: bool,
    pub detail: Option<String>,
}

struct JobLocks {
    cleanup: Mutex<()>,
    monitoring: Mutex<()>,
    orphan_reaper: Mutex<()>,
    timeout_enforcement: Mutex<()>,
    metrics_collection: Mutex<()>,
}

impl JobLocks {
    fn lock_for(&self, job: JobName) -> &Mutex<()> {
        match job {
            JobName::Cleanup => &self.cleanup,
            JobName::Monitoring => &self.monitoring,
            JobName::OrphanReaper => &self.orphan_reaper,
            JobName::TimeoutEnforcement => &self.timeout_enforcement,
            JobName::MetricsCollection => &self.metrics_collection,
        }
    }
}

/// Drives the five periodic jobs of spec §4.7.
pub struct Scheduler {
    manager: Arc<ContainerManager>,
    monitoring: Arc<MonitoringBus>,
    provider: Arc<dyn ProviderAdapter>,
    ledger: Arc<dyn SessionLedger>,
    locks: Arc<JobLocks>,
    history: Arc<RwLock<HashMap<&'static str, VecDeque<JobRun>>>>,
}

impl Scheduler {
    #[must_use]
    pub fn new(
        manager: Arc<ContainerManager>,
        monitoring: Arc<MonitoringBus>,
        provider: Arc<dyn ProviderAdapter>,
        ledger: Arc<dyn SessionLedger>,
    ) -> Self {
        Self {
            manager,
            monitoring,
            provider,
            ledger,
            locks: Arc::new(JobLocks {
                cleanup: Mutex::new(()),
                monitoring: Mutex::new(()),
                orphan_reaper: Mutex::new(()),
                timeout_enforcement: Mutex::new(()),
                metrics_collection: Mutex::new(()),
            }),
            history: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Spawns a ticking task per job. Each task owns its own lock and
    /// timer; a job tick never overlaps its own next tick (spec §4.7), and
    /// distinct jobs run fully concurrently.
    #[must_use]
    pub fn spawn_all(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        JobName::ALL.iter().map(|&job| self.spawn_ticker(job)).collect()
    }

    fn spawn_ticker(self: &Arc<Self>, job: JobName) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(job.period());
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                this.run(job).await;
            }
        })
    }

    /// Executes a named job once, synchronously (spec §4.7 `run_job_now`).
    ///
    /// # Errors
    ///
    /// [`SchedulerError::UnknownJob`] for an unrecognized name.
    pub async fn run_job_now(&self, name: &str) -> Result<JobRun, SchedulerError> {
        let job = JobName::from_str(name).ok_or_else(|| SchedulerError::UnknownJob { name: name.to_owned() })?;
        Ok(self.run(job).await)
    }

    async fn run(&self, job: JobName) -> JobRun {
        let lock = self.locks.lock_for(job);
        let Ok(_guard) = lock.try_lock() else {
            warn!(job = job.as_str(), "job already running, skipping this tick");
            return JobRun {
                job: job.as_str().to_owned(),
                started_at: Utc::now(),
                duration_ms: 0,
                success: false,
                detail: Some("already running".to_owned()),
            };
        };

        let started_at = Utc::now();
        let result = self.execute(job).await;
        let duration_ms = (Utc::now() - started_at).num_milliseconds().max(0) as u64;

        let run = match &result {
            Ok(detail) => {
                info!(job = job.as_str(), duration_ms, "job completed");
                JobRun { job: job.as_str().to_owned(), started_at, duration_ms, success: true, detail: detail.clone() }
            }
            Err(err) => {
                error!(job = job.as_str(), error = %err, "job failed");
                self.monitoring
                    .record_event(
                        &format!("{}_job_failed", job.as_str()),
                        serde_json::json!({ "error": err }),
                        Severity::Error,
                    )
                    .await;
                JobRun {
                    job: job.as_str().to_owned(),
                    started_at,
                    duration_ms,
                    success: false,
                    detail: Some(err.clone()),
                }
            }
        };

        self.record_history(job, run.clone()).await;
        run
    }

    async fn record_history(&self, job: JobName, run: JobRun) {
        let mut history = self.history.write().await;
        let ring = history.entry(job.as_str()).or_insert_with(VecDeque::new);
        if ring.len() == JOB_HISTORY_CAPACITY {
            ring.pop_front();
        }
        ring.push_back(run);
    }

    /// The last `JOB_HISTORY_CAPACITY` outcomes for every job, surfaced via
    /// `GET /monitoring/jobs` (spec §4.11's supplemented observability).
    pub async fn job_history(&self) -> HashMap<String, Vec<JobRun>> {
        self.history
            .read()
            .await
            .iter()
            .map(|(name, ring)| ((*name).to_owned(), ring.iter().cloned().collect()))
            .collect()
    }

    async fn execute(&self, job: JobName) -> Result<Option<String>, String> {
        match job {
            JobName::Cleanup => {
                let destroyed = self.manager.cleanup_expired_sessions().await.map_err(|e| e.to_string())?;
                Ok(Some(format!("{destroyed} expired sessions destroyed")))
            }
            JobName::Monitoring => {
                let assessments = self.manager.monitor_all_sessions().await.map_err(|e| e.to_string())?;
                self.monitoring
                    .record_metric("active_sessions", assessments.len() as f64, HashMap::new())
                    .await;
                Ok(Some(format!("{} sessions assessed", assessments.len())))
            }
            JobName::OrphanReaper => {
                let reaped = self.reap_orphans().await.map_err(|e| e.to_string())?;
                Ok(Some(format!("{reaped} orphaned machines destroyed")))
            }
            JobName::TimeoutEnforcement => {
                let enforced = self.enforce_timeouts().await.map_err(|e| e.to_string())?;
                Ok(Some(format!("{enforced} sessions auto-destroyed on timeout")))
            }
            JobName::MetricsCollection => {
                self.collect_metrics().await.map_err(|e| e.to_string())?;
                Ok(None)
            }
        }
    }

    /// Destroys provider machines tagged as this service, older than
    /// `ORPHAN_MIN_AGE`, that have no corresponding ledger row — distinct
    /// from `ProviderAdapter::cleanup_orphaned`, which is a tag+age sweep at
    /// the adapter level invoked from `cleanup_expired_sessions`. True
    /// orphans are destroyed directly through the adapter since
    /// `destroy_session` only ever accepts a session id (spec §9 open
    /// question) and orphans by definition have none.
    async fn reap_orphans(&self) -> Result<u32, crate::error::LedgerError> {
        let known_container_ids: std::collections::HashSet<String> =
            self.ledger.select_orphan_check_set().await?.into_iter().collect();

        let machines = self.provider.list_machines().await;
        let now = Utc::now();
        let mut reaped = 0u32;

        for machine in machines {
            if machine.tags.get(SERVICE_TAG_KEY).map(String::as_str) != Some(SERVICE_TAG_VALUE) {
                continue;
            }
            if known_container_ids.contains(&machine.id) {
                continue;
            }
            let age = now - machine.created_at;
            if age.to_std().unwrap_or(Duration::ZERO) < ORPHAN_MIN_AGE {
                continue;
            }
            if let Err(err) = self.provider.destroy_machine(&machine.id).await {
                warn!(machine_id = %machine.id, error = %err, "orphan reap destroy failed");
                continue;
            }
            reaped += 1;
        }

        Ok(reaped)
    }

    async fn enforce_timeouts(&self) -> Result<u32, String> {
        let assessments = self.manager.monitor_all_sessions().await.map_err(|e| e.to_string())?;
        let mut enforced = 0u32;

        for assessment in assessments {
            if assessment.actions.iter().any(|a| a == "Auto-destroy machine") {
                match self.manager.destroy_session(assessment.session_id).await {
                    Ok(()) => {
                        enforced += 1;
                        self.monitoring
                            .record_event(
                                "session_timeout_enforced",
                                serde_json::json!({ "session_id": assessment.session_id }),
                                Severity::Warning,
                            )
                            .await;
                    }
                    Err(err) => warn!(session_id = %assessment.session_id, error = %err, "timeout enforcement destroy failed"),
                }
            }
        }

        Ok(enforced)
    }

    async fn collect_metrics(&self) -> Result<(), String> {
        let assessments = self.manager.monitor_all_sessions().await.map_err(|e| e.to_string())?;
        let total = assessments.len() as f64;
        let critical = assessments
            .iter()
            .filter(|a| a.severity == crate::manager::AssessmentSeverity::Critical)
            .count() as f64;
        let warning = assessments
            .iter()
            .filter(|a| a.severity == crate::manager::AssessmentSeverity::Warning)
            .count() as f64;
        let healthy = total - critical - warning;

        self.monitoring.record_metric("active_sessions", total, HashMap::new()).await;
        self.monitoring.record_metric("critical_sessions", critical, HashMap::new()).await;
        self.monitoring.record_metric("warning_sessions", warning, HashMap::new()).await;
        self.monitoring.record_metric("healthy_sessions", healthy, HashMap::new()).await;

        let mut per_tier: HashMap<String, f64> = HashMap::new();
        for assessment in &assessments {
            *per_tier.entry(assessment.tier.to_string()).or_insert(0.0) += 1.0;
        }
        for (tier, count) in per_tier {
            let mut tags = HashMap::new();
            tags.insert("tier".to_owned(), tier);
            self.monitoring.record_metric("sessions_by_tier", count, tags).await;
        }

        Ok(())
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
    use crate::session::TierName;

    fn scheduler() -> (Scheduler, Arc<ContainerManager>) {
        let provider = Arc::new(MemoryAdapter::new());
        let ledger = Arc::new(InMemoryLedger::new());
        let manager = Arc::new(ContainerManager::new(
            provider.clone(),
            ledger.clone(),
            Arc::new(NullRegistrar),
            "registry.example/preview:latest".to_owned(),
            Arc::new(|id: &str| format!("https://{id}.preview.example.com")),
        ));
        let monitoring = Arc::new(MonitoringBus::new(None));
        let scheduler = Scheduler::new(manager.clone(), monitoring, provider, ledger);
        (scheduler, manager)
    }

    #[tokio::test]
    async fn run_job_now_rejects_unknown_job() {
        let (scheduler, _manager) = scheduler();
        let result = scheduler.run_job_now("not-a-real-job").await;
        assert!(matches!(result, Err(SchedulerError::UnknownJob { .. })));
    }

    #[tokio::test]
    async fn run_job_now_cleanup_destroys_expired_sessions() {
        let (scheduler, manager) = scheduler();
        manager.create_session(Uuid::new_v4(), Uuid::new_v4(), TierName::Free).await.unwrap();
        let run = scheduler.run_job_now("cleanup").await.unwrap();
        assert!(run.success);
    }

    #[tokio::test]
    async fn job_history_records_runs() {
        let (scheduler, _manager) = scheduler();
        scheduler.run_job_now("metrics-collection").await.unwrap();
        scheduler.run_job_now("metrics-collection").await.unwrap();
        let history = scheduler.job_history().await;
        assert_eq!(history.get("metrics-collection").map(Vec::len), Some(2));
    }

    #[tokio::test]
    async fn concurrent_run_of_same_job_skips_the_second() {
        let (scheduler, _manager) = scheduler();
        let scheduler = Arc::new(scheduler);
        let a = scheduler.clone();
        let b = scheduler.clone();
        let (first, second) = tokio::join!(a.run_job_now("metrics-collection"), b.run_job_now("metrics-collection"));
        let results = [first.unwrap(), second.unwrap()];
        assert!(results.iter().any(|r| r.success));
    }
}
