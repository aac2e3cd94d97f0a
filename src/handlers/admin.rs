use axum::Json;
use axum::extract::State;
use tracing::instrument;

use crate::middleware::PolicyClass;
use crate::models::{ApiResponse, CircuitStats, RateLimitView, StatsResponse};
use crate::state::AppState;

/// Gatekeeper statistics for operators: store reachability, breaker counters
/// and the active quotas.
#[instrument(skip(state))]
pub async fn stats(State(state): State<AppState>) -> Json<ApiResponse<StatsResponse>> {
    let store_up = state.store.health_check().await;
    let breaker = state.store.breaker();
    let breaker_config = breaker.config();

    let circuit_breaker = CircuitStats {
        state: breaker.state().await.as_str(),
        failure_count: breaker.failure_count().await,
        times_opened: breaker.times_opened(),
        requests_rejected: breaker.requests_rejected(),
        failure_threshold: breaker_config.failure_threshold,
        reset_timeout_ms: u64::try_from(breaker_config.reset_timeout.as_millis())
            .unwrap_or(u64::MAX),
    };

    let rate_limits = PolicyClass::ALL
        .iter()
        .map(|&class| {
            let policy = state.config.rate_limits.get(class);
            RateLimitView {
                class: class.as_str(),
                window_ms: u64::try_from(policy.window.as_millis()).unwrap_or(u64::MAX),
                max: policy.max,
            }
        })
        .collect();

    Json(ApiResponse::ok(StatsResponse {
        store_up,
        circuit_breaker,
        rate_limits,
        uptime_secs: state.uptime_seconds(),
    }))
}
