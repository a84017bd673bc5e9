//! Health check endpoints

use std::sync::Arc;

use axum::{Json, Router, extract::State, http::StatusCode, routing::get};
use serde::Serialize;

use super::ApiState;

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

/// Readiness response
#[derive(Serialize)]
pub struct ReadinessResponse {
    pub status: &'static str,
    pub checks: ReadinessChecks,
}

/// Backend availability
#[derive(Serialize)]
pub struct ReadinessChecks {
    pub recognition: CheckResult,
    pub generation: CheckResult,
    pub synthesis: CheckResult,
}

/// Result of a single check
#[derive(Serialize)]
pub struct CheckResult {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl CheckResult {
    const fn ok() -> Self {
        Self {
            status: "ok",
            message: None,
        }
    }

    fn unavailable() -> Self {
        Self {
            status: "unavailable",
            message: Some("no server key configured".to_string()),
        }
    }

    fn from_present(present: bool) -> Self {
        if present { Self::ok() } else { Self::unavailable() }
    }
}

/// Liveness check
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Readiness check
///
/// Without server keys the relay still serves clients that bring their own,
/// so missing backends degrade the status instead of failing it.
async fn ready(State(state): State<Arc<ApiState>>) -> (StatusCode, Json<ReadinessResponse>) {
    let providers = &state.providers;
    let checks = ReadinessChecks {
        recognition: CheckResult::from_present(providers.recognizer.is_some()),
        generation: CheckResult::from_present(providers.generator.is_some()),
        synthesis: CheckResult::from_present(providers.synthesis.is_some()),
    };
    let status = if providers.missing().is_empty() {
        "ok"
    } else {
        "degraded"
    };

    (StatusCode::OK, Json(ReadinessResponse { status, checks }))
}

/// Build health router
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .with_state(state)
}
