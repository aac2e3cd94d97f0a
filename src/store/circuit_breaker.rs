//! Circuit breaker guarding every round-trip to the key-value store.
//!
//! While the store is known to be unreachable the breaker fails calls fast, so
//! request latency stays flat and the store is not hammered while it recovers.
//!
//! # States
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────────┐
//! │                        Circuit Breaker                             │
//! │                                                                    │
//! │  ┌─────────┐   failure_count ≥ threshold ┌─────────┐               │
//! │  │  Closed │ ──────────────────────────► │  Open   │               │
//! │  │ (Normal)│                             │ (Fail   │               │
//! │  └────┬────┘                             │  Fast)  │               │
//! │       ▲                                  └────┬────┘               │
//! │       │                                       │ reset_timeout      │
//! │       │                                       │ since last failure │
//! │       │                                       ▼                    │
//! │       │                               ┌───────────────┐            │
//! │       └────────────────────────────── │   HalfOpen    │            │
//! │                probe success          │ (up to N      │            │
//! │                                       │  probes)      │            │
//! │                                       └───────┬───────┘            │
//! │                                               │ probe failure      │
//! │                                               ▼                    │
//! │                                          ┌─────────┐               │
//! │                                          │  Open   │               │
//! │                                          └─────────┘               │
//! └────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Configuration
//!
//! - `failure_threshold`: consecutive failures before opening
//! - `reset_timeout`: time since the last failure before a probe is admitted
//! - `half_open_max_probes`: real attempts admitted while half-open
//!
//! Reset eligibility is computed lazily on each call; there is no timer task.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation - all requests pass through.
    Closed,
    /// Failing fast - all requests are rejected immediately.
    Open,
    /// Testing recovery - a bounded number of probes pass through.
    HalfOpen,
}

impl CircuitState {
    /// Upper-case label used by health and stats endpoints.
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        }
    }

    /// Numeric encoding for the state gauge.
    pub fn as_gauge(&self) -> f64 {
        match self {
            CircuitState::Closed => 0.0,
            CircuitState::HalfOpen => 1.0,
            CircuitState::Open => 2.0,
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration for the circuit breaker.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening the circuit.
    pub failure_threshold: u32,
    /// How long after the last failure the circuit stays open.
    pub reset_timeout: Duration,
    /// Number of real attempts admitted while half-open.
    pub half_open_max_probes: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
            half_open_max_probes: 1,
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new circuit breaker configuration.
    pub fn new(failure_threshold: u32, reset_timeout: Duration, half_open_max_probes: u32) -> Self {
        Self {
            failure_threshold,
            reset_timeout,
            half_open_max_probes,
        }
    }
}

struct CircuitBreakerState {
    state: CircuitState,
    /// Consecutive failures while closed.
    failure_count: u32,
    /// When the most recent failure was recorded.
    last_failure_at: Option<Instant>,
    /// Probes admitted in the current half-open period.
    half_open_probes: u32,
    /// When the current half-open period began.
    half_open_since: Option<Instant>,
}

impl CircuitBreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            last_failure_at: None,
            half_open_probes: 0,
            half_open_since: None,
        }
    }

    fn reset_elapsed(&self, reset_timeout: Duration) -> bool {
        self.last_failure_at
            .is_none_or(|at| at.elapsed() >= reset_timeout)
    }

    fn enter_half_open(&mut self) {
        self.state = CircuitState::HalfOpen;
        self.half_open_probes = 1;
        self.half_open_since = Some(Instant::now());
    }
}

/// Thread-safe circuit breaker.
///
/// Concurrent callers may race on transitions; the breaker is a heuristic and
/// tolerates the occasional extra probe.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: RwLock<CircuitBreakerState>,
    /// Total number of times the circuit has been opened (for metrics).
    times_opened: AtomicU32,
    /// Total number of requests rejected without an attempt (for metrics).
    requests_rejected: AtomicU64,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given configuration.
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: RwLock::new(CircuitBreakerState::new()),
            times_opened: AtomicU32::new(0),
            requests_rejected: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Check if a call may perform a real attempt.
    ///
    /// - **Closed**: always admitted
    /// - **Open**: rejected until `reset_timeout` has passed since the last
    ///   failure; the first call after that moves to HalfOpen and is admitted
    /// - **HalfOpen**: admitted while the probe budget lasts. A probe whose
    ///   outcome never arrives (its caller was cancelled) stops blocking once
    ///   `reset_timeout` has passed since the half-open period began.
    pub async fn allow_request(&self) -> bool {
        // Read lock covers the common paths
        {
            let state = self.state.read().await;
            match state.state {
                CircuitState::Closed => return true,
                CircuitState::Open if !state.reset_elapsed(self.config.reset_timeout) => {
                    self.requests_rejected.fetch_add(1, Ordering::Relaxed);
                    return false;
                }
                CircuitState::Open | CircuitState::HalfOpen => {}
            }
        }

        let mut state = self.state.write().await;

        // Re-check state in case another task already transitioned
        match state.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                if state.reset_elapsed(self.config.reset_timeout) {
                    state.enter_half_open();
                    info!("Circuit breaker transitioning from Open to HalfOpen");
                    true
                } else {
                    self.requests_rejected.fetch_add(1, Ordering::Relaxed);
                    false
                }
            }
            CircuitState::HalfOpen => {
                if state.half_open_probes < self.config.half_open_max_probes {
                    state.half_open_probes += 1;
                    debug!(
                        probes = state.half_open_probes,
                        max_probes = self.config.half_open_max_probes,
                        "Circuit breaker admitted HalfOpen probe"
                    );
                    true
                } else if state
                    .half_open_since
                    .is_none_or(|at| at.elapsed() >= self.config.reset_timeout)
                {
                    state.enter_half_open();
                    debug!("Circuit breaker restarted stale HalfOpen probe");
                    true
                } else {
                    self.requests_rejected.fetch_add(1, Ordering::Relaxed);
                    false
                }
            }
        }
    }

    /// Record a successful round-trip.
    pub async fn record_success(&self) {
        let mut state = self.state.write().await;

        match state.state {
            CircuitState::Closed => {
                state.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                state.state = CircuitState::Closed;
                state.failure_count = 0;
                state.half_open_probes = 0;
                state.half_open_since = None;
                info!("Circuit breaker closed after successful probe");
            }
            CircuitState::Open => {
                // A call admitted before the circuit opened finished late
                debug!("Ignoring late success recorded in Open state");
            }
        }
    }

    /// Record a failed round-trip.
    pub async fn record_failure(&self) {
        let mut state = self.state.write().await;
        state.last_failure_at = Some(Instant::now());

        match state.state {
            CircuitState::Closed => {
                state.failure_count += 1;
                debug!(
                    failure_count = state.failure_count,
                    threshold = self.config.failure_threshold,
                    "Circuit breaker recorded failure"
                );

                if state.failure_count >= self.config.failure_threshold {
                    state.state = CircuitState::Open;
                    self.times_opened.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        failures = state.failure_count,
                        reset_timeout = ?self.config.reset_timeout,
                        "Circuit breaker opened due to consecutive failures"
                    );
                }
            }
            CircuitState::HalfOpen => {
                state.state = CircuitState::Open;
                state.half_open_probes = 0;
                state.half_open_since = None;
                self.times_opened.fetch_add(1, Ordering::Relaxed);
                warn!("Circuit breaker reopened after failed probe");
            }
            CircuitState::Open => {}
        }
    }

    /// Get the current circuit state.
    pub async fn state(&self) -> CircuitState {
        self.state.read().await.state
    }

    /// Consecutive failures recorded while closed.
    pub async fn failure_count(&self) -> u32 {
        self.state.read().await.failure_count
    }

    /// Get the number of times the circuit has been opened.
    pub fn times_opened(&self) -> u32 {
        self.times_opened.load(Ordering::Relaxed)
    }

    /// Get the number of requests rejected due to open circuit.
    pub fn requests_rejected(&self) -> u64 {
        self.requests_rejected.load(Ordering::Relaxed)
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_circuit_breaker_starts_closed() {
        let cb = CircuitBreaker::default();
        assert_eq!(cb.state().await, CircuitState::Closed);
        assert!(cb.allow_request().await);
    }

    #[tokio::test]
    async fn test_circuit_opens_after_threshold_failures() {
        let cb = CircuitBreaker::new(CircuitBreakerConfig::new(3, Duration::from_secs(30), 1));

        cb.record_failure().await;
        cb.record_failure().await;
        assert_eq!(cb.state().await, CircuitState::Closed);
        assert_eq!(cb.failure_count().await, 2);

        cb.record_failure().await;
        assert_eq!(cb.state().await, CircuitState::Open);
        assert_eq!(cb.times_opened(), 1);
    }

    #[tokio::test]
    async fn test_circuit_rejects_every_call_while_open() {
        let cb = CircuitBreaker::new(CircuitBreakerConfig::new(1, Duration::from_secs(30), 1));

        cb.record_failure().await;
        for _ in 0..10 {
            assert!(!cb.allow_request().await);
        }
        assert_eq!(cb.requests_rejected(), 10);
        assert_eq!(cb.state().await, CircuitState::Open);
    }

    #[tokio::test]
    async fn test_half_open_admits_exactly_the_probe_budget() {
        let cb = CircuitBreaker::new(CircuitBreakerConfig::new(1, Duration::from_millis(10), 1));

        cb.record_failure().await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(cb.allow_request().await);
        assert_eq!(cb.state().await, CircuitState::HalfOpen);

        // Probe still in flight: nobody else gets through
        assert!(!cb.allow_request().await);
        assert!(!cb.allow_request().await);
    }

    #[tokio::test]
    async fn test_half_open_with_larger_probe_budget() {
        let cb = CircuitBreaker::new(CircuitBreakerConfig::new(1, Duration::from_millis(10), 3));

        cb.record_failure().await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(cb.allow_request().await);
        assert!(cb.allow_request().await);
        assert!(cb.allow_request().await);
        assert!(!cb.allow_request().await);
    }

    #[tokio::test]
    async fn test_probe_success_closes_circuit() {
        let cb = CircuitBreaker::new(CircuitBreakerConfig::new(2, Duration::from_millis(10), 1));

        cb.record_failure().await;
        cb.record_failure().await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(cb.allow_request().await);
        cb.record_success().await;
        assert_eq!(cb.state().await, CircuitState::Closed);
        assert_eq!(cb.failure_count().await, 0);
        assert!(cb.allow_request().await);
    }

    #[tokio::test]
    async fn test_probe_failure_reopens_circuit() {
        let cb = CircuitBreaker::new(CircuitBreakerConfig::new(1, Duration::from_millis(10), 1));

        cb.record_failure().await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(cb.allow_request().await);
        cb.record_failure().await;
        assert_eq!(cb.state().await, CircuitState::Open);
        assert_eq!(cb.times_opened(), 2);

        // Reset timer restarted from the probe failure
        assert!(!cb.allow_request().await);
    }

    #[tokio::test]
    async fn test_abandoned_probe_is_replaced_after_reset_timeout() {
        let cb = CircuitBreaker::new(CircuitBreakerConfig::new(1, Duration::from_millis(10), 1));

        cb.record_failure().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(cb.allow_request().await);

        // The probe never reports back
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(cb.allow_request().await);
        assert_eq!(cb.state().await, CircuitState::HalfOpen);
    }

    #[tokio::test]
    async fn test_success_resets_failure_counter() {
        let cb = CircuitBreaker::new(CircuitBreakerConfig::new(3, Duration::from_secs(30), 1));

        cb.record_failure().await;
        cb.record_failure().await;
        cb.record_success().await;

        cb.record_failure().await;
        cb.record_failure().await;
        assert_eq!(cb.state().await, CircuitState::Closed);

        cb.record_failure().await;
        assert_eq!(cb.state().await, CircuitState::Open);
    }

    #[test]
    fn test_state_labels() {
        assert_eq!(CircuitState::Closed.to_string(), "CLOSED");
        assert_eq!(CircuitState::Open.to_string(), "OPEN");
        assert_eq!(CircuitState::HalfOpen.to_string(), "HALF_OPEN");
    }
}
