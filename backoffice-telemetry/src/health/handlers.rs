//! HTTP handlers for the health endpoints.
//!
//! - `GET /health`: composite status, 503 when unhealthy
//! - `GET /health/detailed`: the full [`HealthReport`](super::HealthReport)
//! - `GET /health/checks/:name`: one probe, 404 when unknown
//! - `GET /livez`: always 200 while the process serves requests
//! - `GET /readyz`: 200 iff every critical probe is healthy

use super::HealthEngine;
use crate::context;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::json;
use std::sync::Arc;

pub type HealthState = Arc<HealthEngine>;

pub fn router(engine: HealthState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/health/detailed", get(detailed_handler))
        .route("/health/checks/:name", get(check_handler))
        .route("/livez", get(liveness_handler))
        .route("/readyz", get(readiness_handler))
        .with_state(engine)
}

/// GET /health
pub async fn health_handler(State(engine): State<HealthState>) -> Response {
    let health = engine.status(&context::current()).await;
    (health.status.http_status(), Json(health)).into_response()
}

/// GET /health/detailed
pub async fn detailed_handler(State(engine): State<HealthState>) -> Response {
    let report = engine.report(&context::current()).await;
    (report.status.http_status(), Json(report)).into_response()
}

/// GET /health/checks/:name
pub async fn check_handler(
    State(engine): State<HealthState>,
    Path(name): Path<String>,
) -> Response {
    match engine.run(&name, &context::current()).await {
        Some(result) => (result.status.http_status(), Json(result)).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "unknown health check", "check": name })),
        )
            .into_response(),
    }
}

/// GET /livez
pub async fn liveness_handler(State(engine): State<HealthState>) -> Response {
    (
        StatusCode::OK,
        Json(json!({ "status": "alive", "version": engine.version() })),
    )
        .into_response()
}

/// GET /readyz
pub async fn readiness_handler(State(engine): State<HealthState>) -> Response {
    let readiness = engine.readiness(&context::current()).await;
    let code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(readiness)).into_response()
}
