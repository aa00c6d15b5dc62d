//! Health, liveness, readiness and cache-health endpoints.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde_json::json;

use super::AppState;
use crate::cache::{CacheHealth, CircuitState};
use crate::network::HealthState;

/// Detailed health as JSON. Always 200; the body carries the verdict.
pub async fn health_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    let cache = state.cache.health();
    Json(json!({
        "state": state.shutdown.health_state().as_str(),
        "connections": state.registry.count(),
        "in_flight": state.shutdown.in_flight_count(),
        "uptime_secs": state.start_time.elapsed().as_secs(),
        "cache_circuit": cache.state.as_str(),
    }))
}

/// Liveness never checks dependencies; a failure restarts the process.
pub async fn liveness_handler() -> StatusCode {
    StatusCode::OK
}

/// 200 only while `Ready` and the cache circuit is not open.
///
/// An open circuit means every rate-limited call is being refused, so the
/// instance should be taken out of rotation.
pub async fn readiness_handler(State(state): State<AppState>) -> StatusCode {
    let ready = state.shutdown.health_state() == HealthState::Ready
        && state.cache.health().state != CircuitState::Open;
    if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// Circuit state, counters, and whether the backend is the permissive store.
///
/// Pings the backend through the breaker first, so a cooled-down open
/// circuit gets probed by health checks even without user traffic.
pub async fn cache_health_handler(State(state): State<AppState>) -> (StatusCode, Json<CacheHealth>) {
    let health = state.cache.check_health().await;
    let status = if health.state == CircuitState::Open {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (status, Json(health))
}
