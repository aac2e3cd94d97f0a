//! Resilient client for the external key-value store.
//!
//! Every stateful component of the gatekeeper (rate limiter, profile lookups,
//! ownership records) goes through [`ResilientStore`], which layers:
//!
//! - **Circuit breaker**: fail fast with [`StoreError::CircuitOpen`] while the
//!   store is known to be down, with no connection attempt
//! - **Lazy single-flight connection**: the first call opens the connection
//!   under an async mutex, so a cold start makes one attempt, not one per request
//! - **Connect retry**: transient connect failures are retried with bounded
//!   exponential backoff and jitter, nested inside the breaker gate
//! - **Operation timeout**: every round-trip is bounded
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       ResilientStore                         │
//! │  ┌───────────────┐  ┌──────────────────┐  ┌───────────────┐  │
//! │  │ CircuitBreaker│─►│ connection()     │─►│ timeout(op)   │  │
//! │  │ allow_request │  │ single-flight +  │  │ ping/get/set/ │  │
//! │  │ record_*      │  │ backoff retries  │  │ execute_atomic│  │
//! │  └───────────────┘  └──────────────────┘  └───────────────┘  │
//! └──────────────────────────────────────────────────────────────┘
//!                               │
//!               StoreConnector / StoreConnection
//!                 (RedisConnector, InMemoryStore)
//! ```
//!
//! Only availability failures (connection, timeout) count against the breaker.
//! A command the store rejected proves the store is reachable and counts as a
//! successful round-trip.

mod backend;
mod backoff;
mod circuit_breaker;
mod memory;
mod redis;

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, instrument, warn};

use crate::config::Config;
use crate::metrics;

pub use backend::{StoreCommand, StoreConnection, StoreConnector, StoreError, StorePipeline};
pub use backoff::{backoff_delay, rand_jitter};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use memory::InMemoryStore;
pub use redis::RedisConnector;

/// Connection and timeout settings for [`ResilientStore`].
#[derive(Debug, Clone)]
pub struct StoreClientConfig {
    /// Bound on each store round-trip and each connect attempt.
    pub operation_timeout: Duration,
    /// Connect attempts per call before giving up (at least 1).
    pub connect_max_attempts: u32,
    /// Base delay between connect attempts (exponential backoff applies).
    pub connect_base_delay: Duration,
    /// Maximum delay between connect attempts.
    pub connect_max_delay: Duration,
}

impl Default for StoreClientConfig {
    fn default() -> Self {
        Self {
            operation_timeout: Duration::from_secs(2),
            connect_max_attempts: 3,
            connect_base_delay: Duration::from_millis(100),
            connect_max_delay: Duration::from_secs(2),
        }
    }
}

impl StoreClientConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            operation_timeout: config.store_operation_timeout,
            connect_max_attempts: config.store_connect_max_attempts,
            connect_base_delay: config.store_connect_base_delay,
            connect_max_delay: config.store_connect_max_delay,
        }
    }
}

/// Breaker-guarded, lazily connected store client.
///
/// Shared process-wide through `AppState`; all methods take `&self`.
pub struct ResilientStore {
    connector: Arc<dyn StoreConnector>,
    connection: Mutex<Option<Arc<dyn StoreConnection>>>,
    breaker: CircuitBreaker,
    config: StoreClientConfig,
}

impl ResilientStore {
    pub fn new(
        connector: Arc<dyn StoreConnector>,
        config: StoreClientConfig,
        breaker: CircuitBreakerConfig,
    ) -> Self {
        Self {
            connector,
            connection: Mutex::new(None),
            breaker: CircuitBreaker::new(breaker),
            config,
        }
    }

    /// Build a Redis-backed client from application configuration.
    ///
    /// Does not connect; the first operation does.
    pub fn from_config(config: &Config) -> Result<Self, StoreError> {
        let connector = RedisConnector::new(&config.redis_url)?;
        info!(target = %connector.describe(), "Configured Redis store");
        Ok(Self::new(
            Arc::new(connector),
            StoreClientConfig::from_config(config),
            CircuitBreakerConfig::new(
                config.circuit_breaker_failure_threshold,
                config.circuit_breaker_reset_timeout,
                config.circuit_breaker_half_open_max_probes,
            ),
        ))
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub async fn circuit_state(&self) -> CircuitState {
        self.breaker.state().await
    }

    // =========================================================================
    // Operations
    // =========================================================================

    /// Round-trip to the store. Never errors; `false` means unavailable,
    /// including when the breaker is open.
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> bool {
        match self.execute("ping", |conn| async move { conn.ping().await }).await {
            Ok(()) => true,
            Err(e) => {
                debug!(error = %e, "Store health check failed");
                false
            }
        }
    }

    #[instrument(skip(self))]
    pub async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let key = key.to_string();
        self.execute("get", |conn| async move { conn.get(&key).await })
            .await
    }

    #[instrument(skip(self, value))]
    pub async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let (key, value) = (key.to_string(), value.to_string());
        self.execute("set", |conn| async move { conn.set(&key, &value, ttl).await })
            .await
    }

    #[instrument(skip(self))]
    pub async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let key = key.to_string();
        self.execute("delete", |conn| async move { conn.delete(&key).await })
            .await
    }

    /// Run a batch as one transaction (`MULTI/EXEC` on Redis).
    #[instrument(skip(self, pipeline), fields(commands = pipeline.len()))]
    pub async fn execute_atomic(&self, pipeline: StorePipeline) -> Result<Vec<i64>, StoreError> {
        self.execute("pipeline", |conn| async move {
            conn.execute_atomic(&pipeline).await
        })
        .await
    }

    // =========================================================================
    // Resilience
    // =========================================================================

    /// Run `operation` behind the breaker gate with a timeout.
    ///
    /// The outcome is reported to the breaker exactly once per call, so one
    /// call counts as one failure however many connect attempts it made.
    async fn execute<T, F, Fut>(&self, name: &'static str, operation: F) -> Result<T, StoreError>
    where
        F: FnOnce(Arc<dyn StoreConnection>) -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        if !self.breaker.allow_request().await {
            metrics::record_circuit_breaker_rejection();
            debug!(operation = name, "Store call rejected by open circuit");
            return Err(StoreError::CircuitOpen);
        }

        let started = Instant::now();
        let result = match self.connection().await {
            Ok(conn) => match timeout(self.config.operation_timeout, operation(conn)).await {
                Ok(result) => result,
                Err(_) => Err(StoreError::Timeout(self.config.operation_timeout)),
            },
            Err(e) => Err(e),
        };
        let elapsed = started.elapsed().as_secs_f64();

        match &result {
            Err(e) if e.is_transient() => {
                warn!(operation = name, error = %e, "Store unavailable");
                self.invalidate_connection().await;
                self.report_failure().await;
                metrics::record_store_operation(name, "unavailable", elapsed);
            }
            Err(e) => {
                debug!(operation = name, error = %e, "Store rejected command");
                self.report_success().await;
                metrics::record_store_operation(name, "error", elapsed);
            }
            Ok(_) => {
                self.report_success().await;
                metrics::record_store_operation(name, "ok", elapsed);
            }
        }

        result
    }

    async fn report_success(&self) {
        let before = self.breaker.state().await;
        self.breaker.record_success().await;
        if before != CircuitState::Closed {
            metrics::set_circuit_breaker_state(self.breaker.state().await.as_gauge());
        }
    }

    async fn report_failure(&self) {
        let opened_before = self.breaker.times_opened();
        self.breaker.record_failure().await;
        if self.breaker.times_opened() > opened_before {
            metrics::record_circuit_breaker_open();
        }
        metrics::set_circuit_breaker_state(self.breaker.state().await.as_gauge());
    }

    /// Current connection, opening one if needed.
    ///
    /// The mutex is held across the connect so concurrent callers on a cold
    /// start wait for the single attempt instead of racing their own.
    async fn connection(&self) -> Result<Arc<dyn StoreConnection>, StoreError> {
        let mut slot = self.connection.lock().await;
        if let Some(conn) = slot.as_ref() {
            return Ok(conn.clone());
        }

        let conn = self.connect_with_backoff().await?;
        *slot = Some(conn.clone());
        Ok(conn)
    }

    async fn connect_with_backoff(&self) -> Result<Arc<dyn StoreConnection>, StoreError> {
        let max_attempts = self.config.connect_max_attempts.max(1);
        let mut attempt = 1;

        loop {
            let result = match timeout(self.config.operation_timeout, self.connector.connect()).await
            {
                Ok(result) => result,
                Err(_) => Err(StoreError::Timeout(self.config.operation_timeout)),
            };

            match result {
                Ok(conn) => {
                    if attempt > 1 {
                        info!(attempt, "Reconnected to store");
                    }
                    return Ok(conn);
                }
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    let delay = backoff_delay(
                        attempt,
                        self.config.connect_base_delay,
                        self.config.connect_max_delay,
                    );
                    warn!(
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Store connect failed, retrying"
                    );
                    metrics::record_reconnect_attempt();
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Drop the cached connection so the next admitted call reconnects.
    async fn invalidate_connection(&self) {
        let mut slot = self.connection.lock().await;
        if slot.take().is_some() {
            debug!("Dropped store connection after transport failure");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn store_with(
        backend: &InMemoryStore,
        threshold: u32,
        reset_timeout: Duration,
    ) -> ResilientStore {
        ResilientStore::new(
            Arc::new(backend.clone()),
            StoreClientConfig {
                operation_timeout: Duration::from_millis(200),
                connect_max_attempts: 1,
                ..StoreClientConfig::default()
            },
            CircuitBreakerConfig::new(threshold, reset_timeout, 1),
        )
    }

    #[tokio::test]
    async fn test_connection_is_opened_lazily_once() {
        let backend = InMemoryStore::new();
        let store = store_with(&backend, 3, Duration::from_secs(30));
        assert_eq!(backend.connect_attempts(), 0);

        store.set("k", "v", None).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));
        assert!(store.health_check().await);
        assert_eq!(backend.connect_attempts(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_cold_start_makes_one_connect_attempt() {
        let backend = InMemoryStore::new();
        let store = Arc::new(store_with(&backend, 3, Duration::from_secs(30)));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.health_check().await })
            })
            .collect();
        for handle in handles {
            assert!(handle.await.unwrap());
        }
        assert_eq!(backend.connect_attempts(), 1);
    }

    #[tokio::test]
    async fn test_threshold_failures_open_circuit_without_further_attempts() {
        let backend = InMemoryStore::new();
        backend.set_available(false);
        let store = store_with(&backend, 3, Duration::from_secs(30));

        for _ in 0..3 {
            assert!(matches!(
                store.get("k").await,
                Err(StoreError::Connection(_))
            ));
        }
        assert_eq!(store.circuit_state().await, CircuitState::Open);
        assert_eq!(backend.connect_attempts(), 3);

        for _ in 0..5 {
            assert_eq!(store.get("k").await, Err(StoreError::CircuitOpen));
        }
        assert_eq!(backend.connect_attempts(), 3);
        assert!(!store.health_check().await);
    }

    #[tokio::test]
    async fn test_half_open_probe_success_closes_circuit() {
        let backend = InMemoryStore::new();
        backend.set_available(false);
        let store = store_with(&backend, 1, Duration::from_millis(20));

        assert!(store.get("k").await.is_err());
        assert_eq!(store.circuit_state().await, CircuitState::Open);

        backend.set_available(true);
        tokio::time::sleep(Duration::from_millis(40)).await;

        assert!(store.health_check().await);
        assert_eq!(store.circuit_state().await, CircuitState::Closed);
        assert_eq!(backend.connect_attempts(), 2);
    }

    #[tokio::test]
    async fn test_half_open_probe_failure_reopens_with_one_attempt() {
        let backend = InMemoryStore::new();
        backend.set_available(false);
        let store = store_with(&backend, 1, Duration::from_millis(20));

        assert!(store.get("k").await.is_err());
        tokio::time::sleep(Duration::from_millis(40)).await;

        assert!(matches!(
            store.get("k").await,
            Err(StoreError::Connection(_))
        ));
        assert_eq!(store.circuit_state().await, CircuitState::Open);
        assert_eq!(backend.connect_attempts(), 2);

        assert_eq!(store.get("k").await, Err(StoreError::CircuitOpen));
        assert_eq!(backend.connect_attempts(), 2);
    }

    #[tokio::test]
    async fn test_command_errors_do_not_trip_the_breaker() {
        let backend = InMemoryStore::new();
        backend.insert("text", "v").await;
        let store = store_with(&backend, 1, Duration::from_secs(30));

        let err = store
            .execute_atomic(StorePipeline::new().cardinality("text"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Command(_)));
        assert_eq!(store.circuit_state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_slow_store_times_out_and_counts_as_failure() {
        let backend = InMemoryStore::new();
        backend.set_latency(Duration::from_millis(500));
        let store = store_with(&backend, 1, Duration::from_secs(30));

        assert!(matches!(
            store.get("k").await,
            Err(StoreError::Timeout(_))
        ));
        assert_eq!(store.circuit_state().await, CircuitState::Open);
    }

    #[tokio::test]
    async fn test_connection_is_reopened_after_transport_failure() {
        let backend = InMemoryStore::new();
        let store = store_with(&backend, 5, Duration::from_secs(30));

        assert!(store.health_check().await);
        backend.set_available(false);
        assert!(!store.health_check().await);
        backend.set_available(true);
        assert!(store.health_check().await);

        assert_eq!(backend.connect_attempts(), 2);
    }

    #[tokio::test]
    async fn test_connect_retries_with_backoff() {
        let backend = InMemoryStore::new();
        backend.set_available(false);
        let store = ResilientStore::new(
            Arc::new(backend.clone()),
            StoreClientConfig {
                operation_timeout: Duration::from_millis(200),
                connect_max_attempts: 3,
                connect_base_delay: Duration::from_millis(1),
                connect_max_delay: Duration::from_millis(1),
            },
            CircuitBreakerConfig::new(5, Duration::from_secs(30), 1),
        );

        assert!(store.get("k").await.is_err());
        assert_eq!(backend.connect_attempts(), 3);
        // One call, one breaker failure
        assert_eq!(store.breaker().failure_count().await, 1);
    }
}
