//! netpulse-api: HTTP surface over the NetPulse core.
//!
//! Thin axum handlers around the store, scheduler, and classifier.
//! Every response is JSON with a `success` flag; unknown ids are 404,
//! missing parameters 400, store failures 500.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use netpulse_core::types::{Severity, TaskType};
use netpulse_core::NetPulseConfig;
use netpulse_scan::classify::{device_statistics, DeviceClassifier, SuspiciousDevice};
use netpulse_scan::export::{ExportFormat, ExportService};
use netpulse_scan::ScanScheduler;
use netpulse_store::DeviceStore;

/// Shared handler state, cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<DeviceStore>,
    pub scheduler: Arc<ScanScheduler>,
    pub classifier: Arc<DeviceClassifier>,
    pub config: Arc<NetPulseConfig>,
}

/// Build the API router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/devices", get(list_devices))
        .route("/api/devices/statistics", get(statistics))
        .route("/api/devices/:id", get(get_device))
        .route("/api/devices/:id/ports", get(get_device_ports))
        .route("/api/scans/discovery", axum::routing::post(start_discovery))
        .route("/api/scans/quick", axum::routing::post(start_quick))
        .route("/api/scans/deep", axum::routing::post(start_deep))
        .route("/api/scans/full", axum::routing::post(start_full))
        .route("/api/scans/results", get(list_scan_results))
        .route("/api/tasks", get(list_tasks))
        .route("/api/tasks/:id", get(get_task))
        .route("/api/events", get(list_events))
        .route("/api/scheduler/jobs", get(list_jobs))
        .route(
            "/api/scheduler/jobs/:job_id",
            axum::routing::delete(remove_job),
        )
        .route("/api/suspicious", get(suspicious_devices))
        .route("/api/export/devices", axum::routing::post(export_devices))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

fn internal_error(e: impl std::fmt::Display) -> Response {
    tracing::error!(error = %e, "API handler error");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"success": false, "error": e.to_string()})),
    )
        .into_response()
}

fn not_found(what: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"success": false, "error": format!("{what} not found")})),
    )
        .into_response()
}

fn bad_request(message: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({"success": false, "error": message})),
    )
        .into_response()
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "scheduled_jobs": state.scheduler.jobs().await.len(),
    }))
}

#[derive(Debug, Deserialize)]
struct DeviceListQuery {
    #[serde(default = "default_true")]
    active_only: bool,
}

fn default_true() -> bool {
    true
}

async fn list_devices(
    State(state): State<AppState>,
    Query(query): Query<DeviceListQuery>,
) -> Response {
    match state.store.list_devices(query.active_only) {
        Ok(devices) => Json(json!({
            "success": true,
            "count": devices.len(),
            "devices": devices,
        }))
        .into_response(),
        Err(e) => internal_error(e),
    }
}

async fn get_device(State(state): State<AppState>, Path(id): Path<i64>) -> Response {
    let device = match state.store.get_device(id) {
        Ok(Some(device)) => device,
        Ok(None) => return not_found("Device"),
        Err(e) => return internal_error(e),
    };
    match state.store.device_ports(id) {
        Ok(ports) => Json(json!({
            "success": true,
            "device": device,
            "ports": ports,
        }))
        .into_response(),
        Err(e) => internal_error(e),
    }
}

async fn get_device_ports(State(state): State<AppState>, Path(id): Path<i64>) -> Response {
    match state.store.get_device(id) {
        Ok(Some(_)) => {}
        Ok(None) => return not_found("Device"),
        Err(e) => return internal_error(e),
    }
    match state.store.device_ports(id) {
        Ok(ports) => Json(json!({
            "success": true,
            "device_id": id,
            "count": ports.len(),
            "ports": ports,
        }))
        .into_response(),
        Err(e) => internal_error(e),
    }
}

async fn statistics(State(state): State<AppState>) -> Response {
    match state.store.list_devices(true) {
        Ok(devices) => Json(json!({
            "success": true,
            "statistics": device_statistics(&devices),
        }))
        .into_response(),
        Err(e) => internal_error(e),
    }
}

#[derive(Debug, Default, Deserialize)]
struct ScanRequest {
    target: Option<String>,
    network: Option<String>,
}

async fn start_discovery(
    State(state): State<AppState>,
    body: Option<Json<ScanRequest>>,
) -> Response {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let network = request
        .network
        .or(request.target)
        .unwrap_or_else(|| state.config.scanner.default_network.clone());
    schedule_scan(&state, TaskType::Discovery, &network).await
}

async fn start_quick(State(state): State<AppState>, body: Option<Json<ScanRequest>>) -> Response {
    targeted_scan(state, TaskType::Quick, body).await
}

async fn start_deep(State(state): State<AppState>, body: Option<Json<ScanRequest>>) -> Response {
    targeted_scan(state, TaskType::Deep, body).await
}

async fn start_full(State(state): State<AppState>, body: Option<Json<ScanRequest>>) -> Response {
    targeted_scan(state, TaskType::Full, body).await
}

async fn targeted_scan(
    state: AppState,
    scan_type: TaskType,
    body: Option<Json<ScanRequest>>,
) -> Response {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    match request.target {
        Some(target) if !target.trim().is_empty() => {
            schedule_scan(&state, scan_type, &target).await
        }
        _ => bad_request("Target required"),
    }
}

async fn schedule_scan(state: &AppState, scan_type: TaskType, target: &str) -> Response {
    match state.scheduler.schedule_once(target, scan_type, None).await {
        Ok(task_id) => Json(json!({
            "success": true,
            "task_id": task_id,
            "message": format!("{scan_type} scan scheduled for {target}"),
        }))
        .into_response(),
        Err(e) => internal_error(e),
    }
}

#[derive(Debug, Deserialize)]
struct LimitQuery {
    limit: Option<usize>,
}

async fn list_scan_results(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> Response {
    match state.store.list_scan_records(query.limit.unwrap_or(50)) {
        Ok(results) => Json(json!({
            "success": true,
            "count": results.len(),
            "results": results,
        }))
        .into_response(),
        Err(e) => internal_error(e),
    }
}

async fn list_tasks(State(state): State<AppState>, Query(query): Query<LimitQuery>) -> Response {
    match state.store.list_tasks(query.limit.unwrap_or(50)) {
        Ok(tasks) => Json(json!({
            "success": true,
            "count": tasks.len(),
            "tasks": tasks,
        }))
        .into_response(),
        Err(e) => internal_error(e),
    }
}

async fn get_task(State(state): State<AppState>, Path(id): Path<i64>) -> Response {
    match state.store.get_task(id) {
        Ok(Some(task)) => Json(json!({"success": true, "task": task})).into_response(),
        Ok(None) => not_found("Task"),
        Err(e) => internal_error(e),
    }
}

async fn list_events(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let limit = query
        .get("limit")
        .and_then(|v| v.parse().ok())
        .unwrap_or(100);
    let severity = match query.get("severity").map(String::as_str) {
        None => None,
        Some("info") => Some(Severity::Info),
        Some("warning") => Some(Severity::Warning),
        Some("critical") => Some(Severity::Critical),
        Some(other) => {
            return bad_request(&format!("unknown severity: {other}"));
        }
    };

    match state.store.list_events(limit, severity) {
        Ok(events) => Json(json!({
            "success": true,
            "count": events.len(),
            "events": events,
        }))
        .into_response(),
        Err(e) => internal_error(e),
    }
}

async fn list_jobs(State(state): State<AppState>) -> Response {
    let jobs = state.scheduler.jobs().await;
    Json(json!({
        "success": true,
        "count": jobs.len(),
        "jobs": jobs,
    }))
    .into_response()
}

async fn remove_job(State(state): State<AppState>, Path(job_id): Path<String>) -> Response {
    if state.scheduler.remove_job(&job_id).await {
        Json(json!({
            "success": true,
            "message": format!("Job {job_id} removed"),
        }))
        .into_response()
    } else {
        not_found("Job")
    }
}

#[derive(Debug, Deserialize)]
struct ExportRequest {
    format: Option<String>,
}

async fn export_devices(
    State(state): State<AppState>,
    body: Option<Json<ExportRequest>>,
) -> Response {
    let format = match body
        .and_then(|Json(r)| r.format)
        .as_deref()
        .unwrap_or("json")
    {
        "json" => ExportFormat::Json,
        "csv" => ExportFormat::Csv,
        other => return bad_request(&format!("unsupported format: {other}")),
    };

    let service = ExportService::new(state.config.export.output_dir.clone(), state.store.clone());
    match service.export_devices(format) {
        Ok(path) => Json(json!({
            "success": true,
            "path": path.display().to_string(),
        }))
        .into_response(),
        Err(e) => internal_error(e),
    }
}

async fn suspicious_devices(State(state): State<AppState>) -> Response {
    let devices = match state.store.list_devices(true) {
        Ok(devices) => devices,
        Err(e) => return internal_error(e),
    };

    let mut findings: Vec<SuspiciousDevice> = Vec::new();
    for device in &devices {
        let ports = match state.store.device_ports(device.id) {
            Ok(ports) => ports,
            Err(e) => return internal_error(e),
        };
        if let Some(finding) = state.classifier.check_suspicious(device, &ports) {
            findings.push(finding);
        }
    }

    Json(json!({
        "success": true,
        "count": findings.len(),
        "devices": findings,
    }))
    .into_response()
}
