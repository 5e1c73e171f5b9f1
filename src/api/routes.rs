//! API route definitions.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::{
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};

use super::error::ApiError;
use super::state::AppState;
use crate::orchestrator::{RunId, TestRequest};

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/devices", get(list_devices))
        .route("/devices/{name}/health", get(device_health))
        .route("/tests", get(list_tests).post(start_test))
        .route("/tests/{id}", get(test_status))
        .route("/tests/{id}/stop", post(stop_test))
        .route("/logs", get(list_logs))
        .route("/logs/{name}", get(read_log))
        .route("/report", get(report))
}

fn meta() -> Value {
    json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION")
    })
}

fn run_id(id: &str) -> Result<RunId, ApiError> {
    RunId::parse(id).ok_or_else(|| ApiError::not_found(format!("no run with id {}", id)))
}

async fn health() -> Json<Value> {
    Json(json!({
        "data": {
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION")
        },
        "meta": meta()
    }))
}

#[derive(Debug, Default, Deserialize)]
struct DevicesQuery {
    #[serde(default)]
    health: bool,
}

async fn list_devices(State(state): State<AppState>, Query(q): Query<DevicesQuery>) -> Json<Value> {
    let devices = state.orchestrator.device_entries(q.health).await;
    Json(json!({ "data": devices, "meta": { "total": devices.len() } }))
}

async fn device_health(State(state): State<AppState>, Path(name): Path<String>) -> Result<Json<Value>, ApiError> {
    let report = state.orchestrator.device_health(&name).await?;
    Ok(Json(json!({ "data": { "device": name, "report": report }, "meta": meta() })))
}

async fn start_test(
    State(state): State<AppState>,
    payload: Result<Json<TestRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let Json(request) = payload?;
    let id = state.orchestrator.start_test(request).await?;
    let status = state.orchestrator.status(id)?;
    Ok((StatusCode::CREATED, Json(json!({ "data": status, "meta": meta() }))))
}

async fn list_tests(State(state): State<AppState>) -> Json<Value> {
    let runs = state.orchestrator.list_runs();
    Json(json!({ "data": runs, "meta": { "total": runs.len() } }))
}

async fn test_status(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Value>, ApiError> {
    let status = state.orchestrator.status(run_id(&id)?)?;
    Ok(Json(json!({ "data": status, "meta": meta() })))
}

async fn stop_test(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Value>, ApiError> {
    let status = state.orchestrator.stop_test(run_id(&id)?).await?;
    Ok(Json(json!({ "data": status, "meta": meta() })))
}

async fn list_logs(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let logs = state.orchestrator.list_logs()?;
    Ok(Json(json!({ "data": logs, "meta": { "total": logs.len() } })))
}

async fn read_log(State(state): State<AppState>, Path(name): Path<String>) -> Result<Json<Value>, ApiError> {
    let record = state.orchestrator.read_log(&name)?;
    Ok(Json(json!({
        "data": { "name": record.name, "text": record.text },
        "meta": meta()
    })))
}

async fn report(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let report = state.orchestrator.report()?;
    Ok(Json(json!({ "data": report, "meta": meta() })))
}
