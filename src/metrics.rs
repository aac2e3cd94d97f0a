//! Prometheus metrics for the request trust boundary.
//!
//! Metrics are exposed via a dedicated HTTP listener (`METRICS_PORT`, 0 disables).
//! Recording functions are safe to call before (or without) initialization; the
//! `metrics` facade drops samples when no recorder is installed.
//!
//! # Available Metrics
//!
//! ## Counters
//! - `gatekeeper_store_operations_total` - Store round-trips (labels: operation, outcome)
//! - `gatekeeper_store_reconnects_total` - Store connect attempts after the first
//! - `gatekeeper_circuit_breaker_opens_total` - Times the circuit breaker opened
//! - `gatekeeper_circuit_breaker_rejections_total` - Calls rejected by an open breaker
//! - `gatekeeper_rate_limit_decisions_total` - Limiter outcomes (labels: class, outcome)
//! - `gatekeeper_auth_failures_total` - Authentication failures (label: reason)
//! - `gatekeeper_csrf_rejections_total` - CSRF rejections (label: code)
//! - `gatekeeper_cors_rejections_total` - Requests from origins not on the allow-list
//! - `gatekeeper_pipeline_step_timeouts_total` - Steps cancelled by timeout (label: step)
//!
//! ## Histograms
//! - `gatekeeper_store_operation_duration_seconds` - Store round-trip latency (label: operation)
//!
//! ## Gauges
//! - `gatekeeper_circuit_breaker_state` - Circuit breaker state (0 = closed, 1 = half-open, 2 = open)

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::{error, info};

/// Metric names as constants for consistency.
pub mod names {
    pub const STORE_OPERATIONS_TOTAL: &str = "gatekeeper_store_operations_total";
    pub const STORE_RECONNECTS_TOTAL: &str = "gatekeeper_store_reconnects_total";
    pub const STORE_OPERATION_DURATION_SECONDS: &str =
        "gatekeeper_store_operation_duration_seconds";
    pub const CIRCUIT_BREAKER_OPENS_TOTAL: &str = "gatekeeper_circuit_breaker_opens_total";
    pub const CIRCUIT_BREAKER_REJECTIONS_TOTAL: &str =
        "gatekeeper_circuit_breaker_rejections_total";
    pub const CIRCUIT_BREAKER_STATE: &str = "gatekeeper_circuit_breaker_state";
    pub const RATE_LIMIT_DECISIONS_TOTAL: &str = "gatekeeper_rate_limit_decisions_total";
    pub const AUTH_FAILURES_TOTAL: &str = "gatekeeper_auth_failures_total";
    pub const CSRF_REJECTIONS_TOTAL: &str = "gatekeeper_csrf_rejections_total";
    pub const CORS_REJECTIONS_TOTAL: &str = "gatekeeper_cors_rejections_total";
    pub const PIPELINE_STEP_TIMEOUTS_TOTAL: &str = "gatekeeper_pipeline_step_timeouts_total";
}

/// Initialize the Prometheus metrics exporter.
///
/// Installs the global recorder, starts the HTTP listener on `metrics_addr`
/// and registers metric descriptions.
pub fn init_metrics(metrics_addr: SocketAddr) -> Result<(), String> {
    PrometheusBuilder::new()
        .with_http_listener(metrics_addr)
        .install()
        .map_err(|e| format!("Failed to install Prometheus exporter: {e}"))?;

    describe_counter!(
        names::STORE_OPERATIONS_TOTAL,
        "Total number of key-value store round-trips"
    );
    describe_counter!(
        names::STORE_RECONNECTS_TOTAL,
        "Total number of store connection retries"
    );
    describe_counter!(
        names::CIRCUIT_BREAKER_OPENS_TOTAL,
        "Total number of times the circuit breaker opened"
    );
    describe_counter!(
        names::CIRCUIT_BREAKER_REJECTIONS_TOTAL,
        "Total number of store calls rejected by the circuit breaker"
    );
    describe_counter!(
        names::RATE_LIMIT_DECISIONS_TOTAL,
        "Rate limiter decisions by policy class and outcome"
    );
    describe_counter!(
        names::AUTH_FAILURES_TOTAL,
        "Authentication failures by reason"
    );
    describe_counter!(names::CSRF_REJECTIONS_TOTAL, "CSRF rejections by code");
    describe_counter!(
        names::CORS_REJECTIONS_TOTAL,
        "Requests rejected because their origin is not allowed"
    );
    describe_counter!(
        names::PIPELINE_STEP_TIMEOUTS_TOTAL,
        "Pipeline steps cancelled after exceeding the step timeout"
    );

    describe_histogram!(
        names::STORE_OPERATION_DURATION_SECONDS,
        "Store round-trip duration in seconds"
    );

    describe_gauge!(
        names::CIRCUIT_BREAKER_STATE,
        "Circuit breaker state (0 = closed, 1 = half-open, 2 = open)"
    );

    info!(addr = %metrics_addr, "Prometheus metrics endpoint started");
    Ok(())
}

/// Try to initialize metrics, logging any errors but not failing.
pub fn try_init_metrics(metrics_addr: SocketAddr) {
    if let Err(e) = init_metrics(metrics_addr) {
        error!(error = %e, "Failed to initialize metrics, continuing without metrics");
    }
}

// =============================================================================
// Store & Circuit Breaker
// =============================================================================

pub fn record_store_operation(operation: &'static str, outcome: &'static str, duration_secs: f64) {
    counter!(names::STORE_OPERATIONS_TOTAL, "operation" => operation, "outcome" => outcome)
        .increment(1);
    histogram!(names::STORE_OPERATION_DURATION_SECONDS, "operation" => operation)
        .record(duration_secs);
}

pub fn record_reconnect_attempt() {
    counter!(names::STORE_RECONNECTS_TOTAL).increment(1);
}

pub fn record_circuit_breaker_open() {
    counter!(names::CIRCUIT_BREAKER_OPENS_TOTAL).increment(1);
}

pub fn record_circuit_breaker_rejection() {
    counter!(names::CIRCUIT_BREAKER_REJECTIONS_TOTAL).increment(1);
}

/// Update circuit breaker state gauge.
///
/// States: 0 = closed, 1 = half-open, 2 = open
pub fn set_circuit_breaker_state(state: f64) {
    gauge!(names::CIRCUIT_BREAKER_STATE).set(state);
}

// =============================================================================
// Request Pipeline
// =============================================================================

/// Record a limiter outcome: `allowed`, `rejected` or `fail_open`.
pub fn record_rate_limit_decision(class: &'static str, outcome: &'static str) {
    counter!(names::RATE_LIMIT_DECISIONS_TOTAL, "class" => class, "outcome" => outcome)
        .increment(1);
}

pub fn record_auth_failure(reason: &'static str) {
    counter!(names::AUTH_FAILURES_TOTAL, "reason" => reason).increment(1);
}

pub fn record_csrf_rejection(code: &'static str) {
    counter!(names::CSRF_REJECTIONS_TOTAL, "code" => code).increment(1);
}

pub fn record_cors_rejection() {
    counter!(names::CORS_REJECTIONS_TOTAL).increment(1);
}

pub fn record_step_timeout(step: &'static str) {
    counter!(names::PIPELINE_STEP_TIMEOUTS_TOTAL, "step" => step).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    // These only verify the functions don't panic without a recorder.

    #[test]
    fn test_record_store_operation() {
        record_store_operation("get", "ok", 0.002);
        record_store_operation("pipeline", "error", 0.5);
    }

    #[test]
    fn test_record_pipeline_counters() {
        record_rate_limit_decision("login", "rejected");
        record_auth_failure("AUTH_EXPIRED");
        record_csrf_rejection("CSRF_TOKEN_MISSING");
        record_cors_rejection();
        record_step_timeout("rate_limit");
    }

    #[test]
    fn test_set_circuit_breaker_state() {
        set_circuit_breaker_state(0.0);
        set_circuit_breaker_state(2.0);
    }
}
