//! API route definitions.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};

use super::AppState;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/scanners", get(scanners))
        .route("/scanners/trigger/:name", post(trigger))
        .route("/results/latest", get(results_latest))
        .route("/results/history", get(results_history))
        .route("/findings", get(findings))
        .route("/baselines", get(baselines))
        .route("/signatures/status", get(signatures_status))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            require_auth,
        ))
        .with_state(state)
}

async fn require_auth(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let token = state
        .cfg
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .auth_token
        .clone();
    if token.is_empty() {
        return next.run(request).await;
    }
    let authorized = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v == format!("Bearer {token}"))
        .unwrap_or(false);
    if !authorized {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "unauthorized" })),
        )
            .into_response();
    }
    next.run(request).await
}

async fn health() -> Json<Value> {
    Json(json!({
        "data": {
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION")
        }
    }))
}

async fn status(State(state): State<Arc<AppState>>) -> Json<Value> {
    let jobs: Vec<Value> = state
        .scheduler
        .list_jobs()
        .into_iter()
        .map(|job| {
            json!({
                "name": job.name,
                "plugin": job.plugin,
                "schedule": job.schedule,
                "state": state.scheduler.job_state(&job.name),
                "next_run": state.scheduler.next_run(&job.name),
            })
        })
        .collect();
    Json(json!({ "data": { "jobs": jobs } }))
}

async fn scanners(State(state): State<Arc<AppState>>) -> Json<Value> {
    let names = state.registry.list();
    Json(json!({ "data": names, "meta": { "total": names.len() } }))
}

async fn trigger(State(state): State<Arc<AppState>>, Path(name): Path<String>) -> Response {
    let read_only = state
        .cfg
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .read_only;
    if read_only {
        return (
            StatusCode::FORBIDDEN,
            Json(json!({ "error": "api is read-only" })),
        )
            .into_response();
    }
    match state.scheduler.run_once(&name, Duration::ZERO).await {
        Ok(result) => Json(json!({ "data": result })).into_response(),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": err.to_string() })),
        )
            .into_response(),
    }
}

async fn results_latest(State(state): State<Arc<AppState>>) -> Json<Value> {
    let latest = state.cache.latest();
    Json(json!({ "data": latest, "meta": { "total": latest.len() } }))
}

async fn results_history(State(state): State<Arc<AppState>>) -> Json<Value> {
    let history = state.cache.history();
    Json(json!({ "data": history, "meta": { "total": history.len() } }))
}

async fn findings(State(state): State<Arc<AppState>>) -> Json<Value> {
    let findings = state.cache.findings_history();
    Json(json!({ "data": findings, "meta": { "total": findings.len() } }))
}

async fn baselines(State(state): State<Arc<AppState>>) -> Response {
    match state.baselines.list() {
        Ok(list) => Json(json!({ "data": list, "meta": { "total": list.len() } })).into_response(),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": err.to_string() })),
        )
            .into_response(),
    }
}

async fn signatures_status(State(state): State<Arc<AppState>>) -> Response {
    match state.signatures.load_status() {
        Ok(status) => Json(json!({ "data": status })).into_response(),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": err.to_string() })),
        )
            .into_response(),
    }
}
