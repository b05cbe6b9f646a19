//! Health check endpoints

use std::sync::Arc;

use axum::{Json, Router, extract::State, http::StatusCode, routing::get};
use chrono::Utc;
use serde::Serialize;

use super::ApiState;
use crate::db;

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

/// Detailed readiness response
#[derive(Serialize)]
pub struct ReadinessResponse {
    pub status: &'static str,
    pub checks: ReadinessChecks,
}

/// Individual readiness checks
#[derive(Serialize)]
pub struct ReadinessChecks {
    pub speech_loop: CheckResult,
    pub knowledge: CheckResult,
}

/// Result of a single health check
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

    fn fail(message: impl Into<String>) -> Self {
        Self {
            status: "fail",
            message: Some(message.into()),
        }
    }

    fn unavailable(message: impl Into<String>) -> Self {
        Self {
            status: "unavailable",
            message: Some(message.into()),
        }
    }
}

/// Liveness probe - is the service running?
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Readiness probe - is a speech loop publishing and alive?
///
/// The knowledge check is informational; an empty or unprovisioned store
/// only degrades answers.
async fn ready(State(state): State<Arc<ApiState>>) -> (StatusCode, Json<ReadinessResponse>) {
    let speech_loop = check_speech_loop(&state);
    let knowledge = check_knowledge(&state);

    let all_ok = speech_loop.status == "ok";
    let status = if all_ok { "ok" } else { "degraded" };
    let http_status = if all_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        http_status,
        Json(ReadinessResponse {
            status,
            checks: ReadinessChecks {
                speech_loop,
                knowledge,
            },
        }),
    )
}

/// A snapshot must exist and have been refreshed within `stale_after`
fn check_speech_loop(state: &ApiState) -> CheckResult {
    let Some(snapshot) = state.session.snapshot() else {
        return CheckResult::fail("no session snapshot");
    };

    let age = Utc::now().signed_duration_since(snapshot.updated_at);
    match age.to_std() {
        Ok(age) if age > state.stale_after => CheckResult::fail(format!(
            "session not refreshed for {}s",
            age.as_secs()
        )),
        _ => CheckResult::ok(),
    }
}

fn check_knowledge(state: &ApiState) -> CheckResult {
    let Some(pool) = &state.db else {
        return CheckResult::unavailable("not configured");
    };
    if db::is_provisioned(pool) {
        CheckResult::ok()
    } else {
        CheckResult::unavailable("unprovisioned; run `lectern setup`")
    }
}

/// Build health router (liveness only, no state needed)
pub fn router() -> Router {
    Router::new().route("/health", get(health))
}

/// Build readiness router (needs state for checks)
pub fn ready_router(state: Arc<ApiState>) -> Router {
    Router::new().route("/ready", get(ready)).with_state(state)
}
