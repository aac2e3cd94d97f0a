//! Shared application state for Axum handlers.
//!
//! Holds the process-wide collaborators the route pipelines and handlers
//! share:
//!
//! - **Store**: one [`ResilientStore`] (and so one circuit breaker) per process
//! - **Authenticator**: platform tokens, external identity verifier, profile directory
//! - **Limiter**: sliding-window counter on the same store
//! - **Policies**: CORS allow-list and trusted proxies, parsed once at startup
//!
//! # Thread Safety
//!
//! Everything is behind `Arc` or is immutable after construction, so
//! `AppState` is cheap to clone into each handler.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::info;

use crate::auth::{
    Authenticator, DisabledIdentityVerifier, IdentityVerifier, JwksIdentityVerifier,
    PlatformTokens, StoreProfileDirectory,
};
use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::middleware::{CorsPolicy, SlidingWindowLimiter, TrustedProxyConfig};
use crate::store::ResilientStore;

/// Timeout for fetching the identity provider's key set.
const JWKS_FETCH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<ResilientStore>,
    pub authenticator: Arc<Authenticator>,
    pub limiter: Arc<SlidingWindowLimiter>,
    pub cors: CorsPolicy,
    pub trusted_proxies: Arc<TrustedProxyConfig>,
    /// Timestamp when the application started
    pub started_at: Instant,
}

impl AppState {
    /// Wire the state around an existing store and identity verifier.
    ///
    /// Profiles and permissions are read from the same store the limiter uses.
    pub fn new(
        config: Config,
        store: Arc<ResilientStore>,
        verifier: Arc<dyn IdentityVerifier>,
    ) -> Self {
        let tokens = Arc::new(PlatformTokens::new(
            &config.jwt_secret,
            config.platform_issuer.clone(),
            config.token_ttl,
        ));
        let directory = Arc::new(StoreProfileDirectory::new(store.clone()));
        let authenticator = Arc::new(Authenticator::new(tokens, verifier, directory));
        let limiter = Arc::new(SlidingWindowLimiter::new(store.clone()));
        let cors = CorsPolicy::from_origins(&config.cors_allowed_origins, config.is_production());
        let trusted_proxies = Arc::new(TrustedProxyConfig::new(&config.trusted_proxies));

        Self {
            config: Arc::new(config),
            store,
            authenticator,
            limiter,
            cors,
            trusted_proxies,
            started_at: Instant::now(),
        }
    }

    /// Build production state: Redis store, and a JWKS verifier when an
    /// identity provider is configured.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the Redis URL or the HTTP client for the
    /// key set cannot be set up. No connection is attempted here.
    pub fn from_config(config: Config) -> AppResult<Self> {
        let store = ResilientStore::from_config(&config)
            .map_err(|e| AppError::Config(format!("Invalid REDIS_URL: {e}")))?;

        let verifier: Arc<dyn IdentityVerifier> = match (
            &config.identity_jwks_url,
            &config.identity_issuer,
            &config.identity_audience,
        ) {
            (Some(url), Some(issuer), Some(audience)) => {
                info!(url = %url, issuer = %issuer, "External identity tokens enabled");
                Arc::new(
                    JwksIdentityVerifier::new(url, issuer, audience, JWKS_FETCH_TIMEOUT)
                        .map_err(|e| AppError::Config(e.to_string()))?,
                )
            }
            _ => {
                info!("No identity provider configured, accepting platform tokens only");
                Arc::new(DisabledIdentityVerifier)
            }
        };

        Ok(Self::new(config, Arc::new(store), verifier))
    }

    /// Get the application uptime in seconds.
    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
