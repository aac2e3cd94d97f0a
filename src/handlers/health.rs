//! Health and readiness endpoints.
//!
//! # Endpoints
//!
//! - `GET /health` - Health check with store and circuit breaker status
//! - `GET /ready` - Kubernetes-compatible readiness probe
//!
//! # Health vs Readiness
//!
//! - **Health** (`/health`): Returns 200 even if degraded, includes details
//! - **Readiness** (`/ready`): Returns 503 while the store is unreachable
//!
//! Neither endpoint runs a request pipeline, so monitoring keeps working
//! when the store (and therefore rate limiting) is down.

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use chrono::Utc;
use tracing::instrument;

use crate::models::HealthResponse;
use crate::state::AppState;

/// Health check endpoint.
///
/// Pings the store through the circuit breaker. While the breaker is open
/// the ping fails fast and the store is reported `down`.
///
/// # Response Body
///
/// ```json
/// {
///   "status": "degraded",
///   "store": "down",
///   "circuit_state": "OPEN",
///   "version": "0.1.0",
///   "uptime_secs": 3600,
///   "timestamp": "2024-01-15T10:30:00Z"
/// }
/// ```
#[instrument(skip(state))]
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let store_up = state.store.health_check().await;
    let circuit_state = state.store.circuit_state().await;

    Json(HealthResponse {
        status: if store_up { "ok" } else { "degraded" },
        store: if store_up { "up" } else { "down" },
        circuit_state: circuit_state.as_str(),
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: state.uptime_seconds(),
        timestamp: Utc::now(),
    })
}

/// Readiness check endpoint for Kubernetes probes.
///
/// Returns 200 OK if the store answers, 503 Service Unavailable otherwise.
#[instrument(skip(state))]
pub async fn readiness_check(State(state): State<AppState>) -> Result<StatusCode, StatusCode> {
    if state.store.health_check().await {
        Ok(StatusCode::OK)
    } else {
        Err(StatusCode::SERVICE_UNAVAILABLE)
    }
}
