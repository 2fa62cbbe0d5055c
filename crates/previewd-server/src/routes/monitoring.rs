//! Monitoring and scheduler read/admin routes (spec §4.9):
//! `/monitoring/*`.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use previewd_core::monitoring::{Alert, Event, HealthSummary, Metric};
use previewd_core::scheduler::JobRun;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/monitoring/health", get(health))
        .route("/monitoring/metrics", get(metrics))
        .route("/monitoring/events", get(events))
        .route("/monitoring/alerts", get(alerts))
        .route("/monitoring/dashboard", get(dashboard))
        .route("/monitoring/sessions", get(sessions))
        .route("/monitoring/jobs", get(jobs))
        .route("/monitoring/alerts/:id/resolve", post(resolve_alert))
        .route("/monitoring/jobs/:name/run", post(run_job))
}

#[derive(Serialize)]
struct Envelope<T: Serialize> {
    success: bool,
    data: T,
}

async fn health(State(state): State<Arc<AppState>>) -> Json<Envelope<HealthSummary>> {
    Json(Envelope { success: true, data: state.monitoring.get_health_summary().await })
}

async fn metrics(State(state): State<Arc<AppState>>) -> Json<Envelope<Vec<Metric>>> {
    Json(Envelope { success: true, data: state.monitoring.metrics_snapshot().await })
}

async fn events(State(state): State<Arc<AppState>>) -> Json<Envelope<Vec<Event>>> {
    Json(Envelope { success: true, data: state.monitoring.events_snapshot().await })
}

async fn alerts(State(state): State<Arc<AppState>>) -> Json<Envelope<Vec<Alert>>> {
    Json(Envelope { success: true, data: state.monitoring.alerts_snapshot().await })
}

#[derive(Serialize)]
struct Dashboard {
    health: HealthSummary,
    recent_events: Vec<Event>,
    active_alerts: Vec<Alert>,
}

async fn dashboard(State(state): State<Arc<AppState>>) -> Json<Envelope<Dashboard>> {
    let health = state.monitoring.get_health_summary().await;
    let recent_events = state.monitoring.events_snapshot().await;
    let active_alerts = state
        .monitoring
        .alerts_snapshot()
        .await
        .into_iter()
        .filter(|a| !a.resolved)
        .collect();
    Json(Envelope { success: true, data: Dashboard { health, recent_events, active_alerts } })
}

async fn sessions(State(state): State<Arc<AppState>>) -> Result<Json<Envelope<Vec<previewd_core::manager::SessionAssessment>>>, AppError> {
    let assessments = state.manager.monitor_all_sessions().await?;
    Ok(Json(Envelope { success: true, data: assessments }))
}

async fn jobs(State(state): State<Arc<AppState>>) -> Json<Envelope<std::collections::HashMap<String, Vec<JobRun>>>> {
    Json(Envelope { success: true, data: state.scheduler.job_history().await })
}

#[derive(Deserialize)]
struct ResolveRequest {
    #[serde(default)]
    resolution: Option<String>,
}

async fn resolve_alert(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(body): Json<ResolveRequest>,
) -> Json<Envelope<bool>> {
    let resolved = state.monitoring.resolve_alert(id, body.resolution.as_deref()).await;
    Json(Envelope { success: true, data: resolved })
}

async fn run_job(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<Envelope<JobRun>>, AppError> {
    let run = state.scheduler.run_job_now(&name).await?;
    Ok(Json(Envelope { success: true, data: run }))
}
