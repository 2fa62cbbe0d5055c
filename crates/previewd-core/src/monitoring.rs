//! Monitoring Bus (C6) — in-memory ring buffers of metrics, events, and
//! alerts, with threshold-driven alert generation and an export surface
//! (spec §4.6).
//!
//! Rings are bounded circular structures (`VecDeque` with a capacity cap),
//! not append-only logs with periodic truncation — append is O(1), snapshot
//! is O(n), matching the teacher's preference for atomics/`RwLock`-guarded
//! collections over unbounded growth (`ResourceMetrics` in the teacher's
//! resource-tracking module).

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;
use tokio::sync::RwLock;
use tracing::{error, warn};
use uuid::Uuid;

const METRIC_RING_CAPACITY: usize = 1000;
const EVENT_RING_CAPACITY: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize)]
pub struct Metric {
    pub name: String,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
    pub tags: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub event_type: String,
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    pub severity: Severity,
}

#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub id: Uuid,
    pub alert_type: String,
    pub message: String,
    pub severity: Severity,
    pub timestamp: DateTime<Utc>,
    pub resolved: bool,
    pub data: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSummary {
    pub status: HealthStatus,
    pub active_alerts: usize,
    pub critical_alerts: usize,
    pub last_metrics: HashMap<String, f64>,
}

struct Threshold {
    metric: &'static str,
    at_least: f64,
    severity: Severity,
}

const THRESHOLDS: &[Threshold] = &[
    Threshold { metric: "critical_sessions", at_least: 5.0, severity: Severity::Error },
    Threshold { metric: "active_sessions", at_least: 50.0, severity: Severity::Warning },
    Threshold { metric: "memory_usage_percent", at_least: 90.0, severity: Severity::Critical },
    Threshold { metric: "cpu_usage_percent", at_least: 85.0, severity: Severity::Warning },
];

struct Ring<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> Ring<T> {
    fn new(capacity: usize) -> Self {
        Self { items: VecDeque::with_capacity(capacity), capacity }
    }

    fn push(&mut self, item: T) {
        if self.items.len() == self.capacity {
            self.items.pop_front();
        }
        self.items.push_back(item);
    }

    fn snapshot(&self) -> Vec<T>
    where
        T: Clone,
    {
        self.items.iter().cloned().collect()
    }
}

/// Owns all telemetry mutation (spec §3: "Monitoring Bus owns Metric/Event/
/// Alert mutation").
///
/// Metrics stay ring-buffered in-process only — spec §4.6 names events and
/// alerts as the durable system-events/system-alerts tables (spec §7), not
/// metrics. When `pool` is set, `record_event` and `create_alert` write
/// through to those tables in addition to the in-memory rings the
/// dashboard/export routes read from.
#[derive(Clone)]
pub struct MonitoringBus {
    metrics: Arc<RwLock<Ring<Metric>>>,
    events: Arc<RwLock<Ring<Event>>>,
    alerts: Arc<RwLock<HashMap<Uuid, Alert>>>,
    webhook_url: Option<String>,
    webhook_client: reqwest::Client,
    pool: Option<PgPool>,
}

impl MonitoringBus {
    #[must_use]
    pub fn new(webhook_url: Option<String>) -> Self {
        Self {
            metrics: Arc::new(RwLock::new(Ring::new(METRIC_RING_CAPACITY))),
            events: Arc::new(RwLock::new(Ring::new(EVENT_RING_CAPACITY))),
            alerts: Arc::new(RwLock::new(HashMap::new())),
            webhook_url,
            webhook_client: reqwest::Client::new(),
            pool: None,
        }
    }

    /// Enables durable persistence of events and alerts to the
    /// `system_events`/`system_alerts` tables backing `pool`.
    #[must_use]
    pub fn with_persistence(mut self, pool: PgPool) -> Self {
        self.pool = Some(pool);
        self
    }

    pub async fn record_metric(&self, name: &str, value: f64, tags: HashMap<String, String>) {
        let metric = Metric { name: name.to_owned(), value, timestamp: Utc::now(), tags };
        self.metrics.write().await.push(metric);

        if let Some(threshold) = THRESHOLDS.iter().find(|t| t.metric == name) {
            if value >= threshold.at_least {
                self.create_alert(
                    &format!("{name}_threshold"),
                    &format!("{name} reached {value} (threshold {})", threshold.at_least),
                    threshold.severity,
                    None,
                )
                .await;
            }
        }
    }

    pub async fn record_event(&self, event_type: &str, data: serde_json::Value, severity: Severity) {
        let event = Event { event_type: event_type.to_owned(), data: data.clone(), timestamp: Utc::now(), severity };
        self.events.write().await.push(event.clone());
        self.persist_event(&event).await;

        if matches!(severity, Severity::Error | Severity::Critical) {
            self.create_alert(event_type, &format!("{event_type} ({severity:?})"), severity, Some(data))
                .await;
        }
    }

    async fn persist_event(&self, event: &Event) {
        let Some(pool) = &self.pool else { return };
        if let Err(err) = sqlx::query(
            r"INSERT INTO system_events (event_type, data, severity, timestamp)
              VALUES ($1, $2, $3, $4)",
        )
        .bind(&event.event_type)
        .bind(&event.data)
        .bind(event.severity.as_str())
        .bind(event.timestamp)
        .execute(pool)
        .await
        {
            error!(error = %err, event_type = %event.event_type, "failed to persist system event");
        }
    }

    pub async fn create_alert(
        &self,
        alert_type: &str,
        message: &str,
        severity: Severity,
        data: Option<serde_json::Value>,
    ) -> Uuid {
        let alert = Alert {
            id: Uuid::new_v4(),
            alert_type: alert_type.to_owned(),
            message: message.to_owned(),
            severity,
            timestamp: Utc::now(),
            resolved: false,
            data,
        };
        let id = alert.id;
        self.alerts.write().await.insert(id, alert.clone());
        self.persist_alert(&alert).await;

        if severity == Severity::Critical {
            self.emit_webhook(&alert).await;
        }
        id
    }

    async fn persist_alert(&self, alert: &Alert) {
        let Some(pool) = &self.pool else { return };
        if let Err(err) = sqlx::query(
            r"INSERT INTO system_alerts
                (id, alert_type, message, severity, timestamp, resolved, data)
              VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(alert.id)
        .bind(&alert.alert_type)
        .bind(&alert.message)
        .bind(alert.severity.as_str())
        .bind(alert.timestamp)
        .bind(alert.resolved)
        .bind(&alert.data)
        .execute(pool)
        .await
        {
            error!(error = %err, alert_id = %alert.id, "failed to persist system alert");
        }
    }

    async fn emit_webhook(&self, alert: &Alert) {
        let Some(url) = self.webhook_url.as_ref() else { return };

        #[derive(Serialize)]
        struct Payload<'a> {
            #[serde(rename = "type")]
            kind: &'static str,
            alert: &'a Alert,
            service: &'static str,
        }

        if let Err(err) = self
            .webhook_client
            .post(url)
            .json(&Payload { kind: "alert", alert, service: "previewd" })
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
        {
            warn!(error = %err, "alert webhook delivery failed");
        }
    }

    /// Returns `false` if the alert does not exist or is already resolved
    /// (spec §8: idempotent, second call returns `false`).
    pub async fn resolve_alert(&self, id: Uuid, resolution: Option<&str>) -> bool {
        let mut alerts = self.alerts.write().await;
        match alerts.get_mut(&id) {
            Some(alert) if !alert.resolved => {
                alert.resolved = true;
                drop(alerts);
                self.persist_alert_resolution(id).await;
                self.record_event(
                    "alert_resolved",
                    serde_json::json!({ "alert_id": id, "resolution": resolution }),
                    Severity::Info,
                )
                .await;
                true
            }
            _ => false,
        }
    }

    async fn persist_alert_resolution(&self, id: Uuid) {
        let Some(pool) = &self.pool else { return };
        if let Err(err) = sqlx::query(r"UPDATE system_alerts SET resolved = true WHERE id = $1")
            .bind(id)
            .execute(pool)
            .await
        {
            error!(error = %err, alert_id = %id, "failed to persist alert resolution");
        }
    }

    pub async fn get_health_summary(&self) -> HealthSummary {
        let alerts = self.alerts.read().await;
        let active = alerts.values().filter(|a| !a.resolved).count();
        let critical = alerts.values().filter(|a| !a.resolved && a.severity == Severity::Critical).count();
        drop(alerts);

        let metrics = self.metrics.read().await;
        let mut last_metrics: HashMap<String, f64> = HashMap::new();
        for metric in &metrics.items {
            last_metrics.insert(metric.name.clone(), metric.value);
        }
        drop(metrics);

        let status = if critical > 0 {
            HealthStatus::Critical
        } else if active > 0 {
            HealthStatus::Warning
        } else {
            HealthStatus::Healthy
        };

        HealthSummary { status, active_alerts: active, critical_alerts: critical, last_metrics }
    }

    pub async fn metrics_snapshot(&self) -> Vec<Metric> {
        self.metrics.read().await.snapshot()
    }

    pub async fn events_snapshot(&self) -> Vec<Event> {
        self.events.read().await.snapshot()
    }

    pub async fn alerts_snapshot(&self) -> Vec<Alert> {
        self.alerts.read().await.values().cloned().collect()
    }

    /// Prometheus text-format export: latest value per metric name, one
    /// sample line per unique tag set (spec §8 invariant 6).
    pub async fn export_prometheus(&self) -> String {
        let metrics = self.metrics.read().await;
        let mut latest: HashMap<(String, Vec<(String, String)>), (f64, DateTime<Utc>)> = HashMap::new();
        for metric in &metrics.items {
            let mut tags: Vec<(String, String)> = metric.tags.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
            tags.sort();
            let key = (metric.name.clone(), tags);
            latest
                .entry(key)
                .and_modify(|(value, ts)| {
                    if metric.timestamp >= *ts {
                        *value = metric.value;
                        *ts = metric.timestamp;
                    }
                })
                .or_insert((metric.value, metric.timestamp));
        }
        drop(metrics);

        let mut names: Vec<&str> = latest.keys().map(|(name, _)| name.as_str()).collect();
        names.sort();
        names.dedup();

        let mut out = String::new();
        for name in names {
            out.push_str(&format!("# HELP {name} previewd metric\n"));
            out.push_str(&format!("# TYPE {name} gauge\n"));
            let mut rows: Vec<_> = latest
                .iter()
                .filter(|((n, _), _)| n == name)
                .collect();
            rows.sort_by(|a, b| a.0 .1.cmp(&b.0 .1));
            for ((_, tags), (value, _)) in rows {
                if tags.is_empty() {
                    out.push_str(&format!("{name} {value}\n"));
                } else {
                    let tag_str = tags.iter().map(|(k, v)| format!("{k}=\"{v}\"")).collect::<Vec<_>>().join(",");
                    out.push_str(&format!("{name}{{{tag_str}}} {value}\n"));
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn record_metric_over_threshold_creates_alert() {
        let bus = MonitoringBus::new(None);
        bus.record_metric("active_sessions", 51.0, HashMap::new()).await;
        let alerts = bus.alerts_snapshot().await;
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].severity, Severity::Warning);
    }

    #[tokio::test]
    async fn record_metric_below_threshold_creates_no_alert() {
        let bus = MonitoringBus::new(None);
        bus.record_metric("active_sessions", 3.0, HashMap::new()).await;
        assert!(bus.alerts_snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn record_event_error_severity_creates_alert() {
        let bus = MonitoringBus::new(None);
        bus.record_event("session_create_failed", serde_json::json!({}), Severity::Error).await;
        assert_eq!(bus.alerts_snapshot().await.len(), 1);
    }

    #[tokio::test]
    async fn resolve_alert_is_idempotent() {
        let bus = MonitoringBus::new(None);
        let id = bus.create_alert("test", "msg", Severity::Warning, None).await;
        assert!(bus.resolve_alert(id, None).await);
        assert!(!bus.resolve_alert(id, None).await);
    }

    #[tokio::test]
    async fn resolve_alert_on_unknown_id_returns_false() {
        let bus = MonitoringBus::new(None);
        assert!(!bus.resolve_alert(Uuid::new_v4(), None).await);
    }

    #[tokio::test]
    async fn health_summary_reflects_critical_alert() {
        let bus = MonitoringBus::new(None);
        bus.create_alert("oom", "out of memory", Severity::Critical, None).await;
        let summary = bus.get_health_summary().await;
        assert_eq!(summary.status, HealthStatus::Critical);
        assert_eq!(summary.critical_alerts, 1);
    }

    #[tokio::test]
    async fn metric_ring_respects_capacity() {
        let bus = MonitoringBus::new(None);
        for i in 0..(METRIC_RING_CAPACITY + 10) {
            bus.record_metric("noise", i as f64, HashMap::new()).await;
        }
        assert_eq!(bus.metrics_snapshot().await.len(), METRIC_RING_CAPACITY);
    }

    #[tokio::test]
    async fn export_prometheus_emits_one_line_per_tag_set() {
        let bus = MonitoringBus::new(None);
        let mut tags_a = HashMap::new();
        tags_a.insert("tier".to_owned(), "free".to_owned());
        bus.record_metric("sessions_by_tier", 3.0, tags_a.clone()).await;
        bus.record_metric("sessions_by_tier", 5.0, tags_a).await;

        let mut tags_b = HashMap::new();
        tags_b.insert("tier".to_owned(), "pro".to_owned());
        bus.record_metric("sessions_by_tier", 1.0, tags_b).await;

        let text = bus.export_prometheus().await;
        let sample_lines: Vec<&str> = text
            .lines()
            .filter(|line| !line.starts_with('#'))
            .collect();
        assert_eq!(sample_lines.len(), 2);
        assert!(text.contains("tier=\"free\"} 5"));
    }
}
