//! Application configuration loaded from environment variables.
//!
//! # Configuration Hierarchy
//!
//! All configuration is loaded from environment variables with sensible defaults
//! for development. In production, configure via environment variables or a `.env` file.
//!
//! # Security Configuration
//!
//! - `APP_ENV`: `production` enables strict checks (TLS-only CORS origins,
//!   `Secure` cookies, HSTS, mandatory strong `JWT_SECRET`)
//! - `JWT_SECRET`: shared secret for platform-issued tokens
//! - `CORS_ALLOWED_ORIGINS`: comma-separated allow-list; `*` is never accepted
//! - `TRUSTED_PROXIES`: CIDR ranges allowed to set forwarded-for headers
//!
//! # Resilience Tuning
//!
//! - `CIRCUIT_BREAKER_FAILURE_THRESHOLD`: failures before the breaker opens (default: 5)
//! - `CIRCUIT_BREAKER_RESET_TIMEOUT_MS`: open period after the last failure (default: 30000)
//! - `CIRCUIT_BREAKER_HALF_OPEN_MAX_PROBES`: probes admitted while half-open (default: 1)
//! - `PIPELINE_STEP_TIMEOUT_MS`: wall-clock bound per pipeline step (default: 5000)
//! - `RATE_LIMIT_<CLASS>_WINDOW_MS` / `RATE_LIMIT_<CLASS>_MAX`: per-class quotas

use std::env;
use std::time::Duration;

use crate::error::{AppError, AppResult};
use crate::middleware::rate_limit::{PolicyClass, RateLimitPolicies, RateLimitPolicy};

/// Secret used when `JWT_SECRET` is unset. Rejected in production.
pub const DEV_JWT_SECRET: &str = "dev-only-insecure-secret-change-me";

/// Minimum `JWT_SECRET` length accepted in production.
const MIN_PRODUCTION_SECRET_LEN: usize = 32;

/// Application configuration loaded from environment variables.
///
/// # Example
///
/// ```rust,ignore
/// let config = Config::from_env()?;
/// println!("Server will listen on {}", config.server_addr());
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    // =========================================================================
    // Server Configuration
    // =========================================================================
    /// Server host address (default: "0.0.0.0")
    pub host: String,

    /// Server port (default: 3000)
    pub port: u16,

    /// Deployment environment (default: "development")
    pub environment: String,

    // =========================================================================
    // Store Connection Configuration
    // =========================================================================
    /// Redis connection URL (default: "redis://127.0.0.1:6379")
    pub redis_url: String,

    /// Bound on each store round-trip and connect attempt (default: 2s)
    pub store_operation_timeout: Duration,

    /// Connect attempts per call before giving up (default: 3)
    pub store_connect_max_attempts: u32,

    /// Base delay between connect attempts (exponential backoff applies)
    pub store_connect_base_delay: Duration,

    /// Maximum delay between connect attempts
    pub store_connect_max_delay: Duration,

    // =========================================================================
    // Circuit Breaker Configuration
    // =========================================================================
    /// Number of consecutive failures before opening the circuit (default: 5)
    pub circuit_breaker_failure_threshold: u32,

    /// How long after the last failure the circuit stays open (default: 30s)
    pub circuit_breaker_reset_timeout: Duration,

    /// Probes admitted while half-open (default: 1)
    pub circuit_breaker_half_open_max_probes: u32,

    // =========================================================================
    // Request Pipeline Configuration
    // =========================================================================
    /// Wall-clock bound per pipeline step (default: 5s)
    pub pipeline_step_timeout: Duration,

    /// Sliding-window quota per traffic class
    pub rate_limits: RateLimitPolicies,

    // =========================================================================
    // Authentication Configuration
    // =========================================================================
    /// Shared HS256 secret for platform-issued tokens
    pub jwt_secret: String,

    /// `iss` claim of platform-issued tokens (default: "api-gatekeeper")
    pub platform_issuer: String,

    /// Lifetime of platform-issued tokens (default: 1h)
    pub token_ttl: Duration,

    /// JWKS document of the external identity provider.
    /// When unset, only platform tokens are accepted.
    pub identity_jwks_url: Option<String>,

    /// Expected `iss` of external identity tokens
    pub identity_issuer: Option<String>,

    /// Expected `aud` of external identity tokens
    pub identity_audience: Option<String>,

    // =========================================================================
    // Security Configuration
    // =========================================================================
    /// Lifetime of the CSRF cookie (default: 1h)
    pub csrf_token_ttl: Duration,

    /// Allowed CORS origins, exact match
    /// Example: `https://app.example.com,https://admin.example.com`
    pub cors_allowed_origins: Vec<String>,

    /// Trusted proxy CIDR ranges for IP spoofing mitigation.
    /// Forwarded-for headers are only trusted if the connection
    /// originates from one of these networks.
    ///
    /// Format: Comma-separated CIDR notation (e.g., "10.0.0.0/8,172.16.0.0/12")
    /// Default: Empty (trust all sources - NOT recommended for production)
    pub trusted_proxies: Vec<String>,

    // =========================================================================
    // Observability Configuration
    // =========================================================================
    /// Log level (e.g., "info", "debug", "trace")
    pub log_level: String,

    /// Port for Prometheus metrics endpoint (default: 9090, 0 = disabled)
    pub metrics_port: u16,
}

impl Config {
    /// Load configuration from environment variables with sensible defaults.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if any value fails to parse or the combination
    /// is inconsistent.
    pub fn from_env() -> AppResult<Self> {
        // Load an .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let config = Self {
            // Server
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: Self::parse_env("PORT", 3000)?,
            environment: env::var("APP_ENV").unwrap_or_else(|_| "development".to_string()),

            // Store
            redis_url: env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
            store_operation_timeout: Duration::from_millis(Self::parse_env(
                "STORE_OPERATION_TIMEOUT_MS",
                2000,
            )?),
            store_connect_max_attempts: Self::parse_env("STORE_CONNECT_MAX_ATTEMPTS", 3)?,
            store_connect_base_delay: Duration::from_millis(Self::parse_env(
                "STORE_CONNECT_BASE_DELAY_MS",
                100,
            )?),
            store_connect_max_delay: Duration::from_millis(Self::parse_env(
                "STORE_CONNECT_MAX_DELAY_MS",
                2000,
            )?),

            // Circuit breaker
            circuit_breaker_failure_threshold: Self::parse_env(
                "CIRCUIT_BREAKER_FAILURE_THRESHOLD",
                5,
            )?,
            circuit_breaker_reset_timeout: Duration::from_millis(Self::parse_env(
                "CIRCUIT_BREAKER_RESET_TIMEOUT_MS",
                30_000,
            )?),
            circuit_breaker_half_open_max_probes: Self::parse_env(
                "CIRCUIT_BREAKER_HALF_OPEN_MAX_PROBES",
                1,
            )?,

            // Pipeline
            pipeline_step_timeout: Duration::from_millis(Self::parse_env(
                "PIPELINE_STEP_TIMEOUT_MS",
                5000,
            )?),
            rate_limits: Self::parse_rate_limits()?,

            // Authentication
            jwt_secret: env::var("JWT_SECRET").unwrap_or_else(|_| DEV_JWT_SECRET.to_string()),
            platform_issuer: env::var("PLATFORM_TOKEN_ISSUER")
                .unwrap_or_else(|_| "api-gatekeeper".to_string()),
            token_ttl: Duration::from_secs(Self::parse_env("TOKEN_TTL_SECS", 3600)?),
            identity_jwks_url: Self::optional_env("IDENTITY_JWKS_URL"),
            identity_issuer: Self::optional_env("IDENTITY_ISSUER"),
            identity_audience: Self::optional_env("IDENTITY_AUDIENCE"),

            // Security
            csrf_token_ttl: Duration::from_secs(Self::parse_env("CSRF_TOKEN_TTL_SECS", 3600)?),
            cors_allowed_origins: Self::parse_list("CORS_ALLOWED_ORIGINS", "http://localhost:3000"),
            trusted_proxies: Self::parse_list("TRUSTED_PROXIES", ""),

            // Observability
            log_level: env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
            metrics_port: Self::parse_env("METRICS_PORT", 9090)?,
        };

        // Validate configuration before returning
        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values for consistency and correctness.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if validation fails.
    pub fn validate(&self) -> AppResult<()> {
        if self.store_connect_base_delay > self.store_connect_max_delay {
            return Err(AppError::Config(format!(
                "STORE_CONNECT_BASE_DELAY_MS ({:?}) must be <= STORE_CONNECT_MAX_DELAY_MS ({:?})",
                self.store_connect_base_delay, self.store_connect_max_delay
            )));
        }

        if self.store_connect_max_attempts == 0 {
            return Err(AppError::Config(
                "STORE_CONNECT_MAX_ATTEMPTS must be greater than 0".to_string(),
            ));
        }

        if self.circuit_breaker_failure_threshold == 0 {
            return Err(AppError::Config(
                "CIRCUIT_BREAKER_FAILURE_THRESHOLD must be greater than 0".to_string(),
            ));
        }

        if self.circuit_breaker_half_open_max_probes == 0 {
            return Err(AppError::Config(
                "CIRCUIT_BREAKER_HALF_OPEN_MAX_PROBES must be greater than 0".to_string(),
            ));
        }

        if self.pipeline_step_timeout.is_zero() || self.store_operation_timeout.is_zero() {
            return Err(AppError::Config(
                "PIPELINE_STEP_TIMEOUT_MS and STORE_OPERATION_TIMEOUT_MS must be greater than 0"
                    .to_string(),
            ));
        }

        if self.jwt_secret.is_empty() {
            return Err(AppError::Config("JWT_SECRET must not be empty".to_string()));
        }

        if self.is_production()
            && (self.jwt_secret == DEV_JWT_SECRET
                || self.jwt_secret.len() < MIN_PRODUCTION_SECRET_LEN)
        {
            return Err(AppError::Config(format!(
                "JWT_SECRET must be set to at least {MIN_PRODUCTION_SECRET_LEN} characters in production"
            )));
        }

        if self.token_ttl.is_zero() || self.csrf_token_ttl.is_zero() {
            return Err(AppError::Config(
                "TOKEN_TTL_SECS and CSRF_TOKEN_TTL_SECS must be greater than 0".to_string(),
            ));
        }

        if self.identity_jwks_url.is_some()
            && (self.identity_issuer.is_none() || self.identity_audience.is_none())
        {
            return Err(AppError::Config(
                "IDENTITY_ISSUER and IDENTITY_AUDIENCE are required when IDENTITY_JWKS_URL is set"
                    .to_string(),
            ));
        }

        if self
            .identity_issuer
            .as_deref()
            .is_some_and(|iss| iss == self.platform_issuer)
        {
            return Err(AppError::Config(
                "IDENTITY_ISSUER must differ from PLATFORM_TOKEN_ISSUER".to_string(),
            ));
        }

        Ok(())
    }

    /// Get the full server address for binding.
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Whether production-only hardening applies.
    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }

    /// Check if trusted proxy validation is enabled.
    pub fn proxy_validation_enabled(&self) -> bool {
        !self.trusted_proxies.is_empty()
    }

    /// Check if Prometheus metrics export is enabled.
    pub fn metrics_enabled(&self) -> bool {
        self.metrics_port > 0
    }

    /// Get the metrics endpoint address.
    ///
    /// Returns `None` if metrics are disabled (port = 0).
    pub fn metrics_addr(&self) -> Option<std::net::SocketAddr> {
        if self.metrics_enabled() {
            Some(std::net::SocketAddr::from((
                [0, 0, 0, 0],
                self.metrics_port,
            )))
        } else {
            None
        }
    }

    /// Parse an environment variable into the specified type with a default value.
    fn parse_env<T>(name: &str, default: T) -> AppResult<T>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        match env::var(name) {
            Ok(val) => val
                .trim()
                .parse()
                .map_err(|e| AppError::Config(format!("Invalid {name}: {e}"))),
            Err(_) => Ok(default),
        }
    }

    fn optional_env(name: &str) -> Option<String> {
        env::var(name)
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    /// Parse a comma-separated list, dropping empty entries.
    fn parse_list(name: &str, default: &str) -> Vec<String> {
        env::var(name)
            .unwrap_or_else(|_| default.to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }

    /// Per-class overrides on top of the built-in policies.
    fn parse_rate_limits() -> AppResult<RateLimitPolicies> {
        let mut policies = RateLimitPolicies::default();

        for class in PolicyClass::ALL {
            let current = policies.get(class);
            let prefix = class.env_prefix();
            let window_ms: u64 = Self::parse_env(
                &format!("RATE_LIMIT_{prefix}_WINDOW_MS"),
                u64::try_from(current.window.as_millis()).unwrap_or(u64::MAX),
            )?;
            let max: u64 = Self::parse_env(&format!("RATE_LIMIT_{prefix}_MAX"), current.max)?;

            let policy = RateLimitPolicy::new(Duration::from_millis(window_ms), max)
                .map_err(|e| AppError::Config(format!("RATE_LIMIT_{prefix}: {e}")))?;
            policies.set(class, policy);
        }

        Ok(policies)
    }
}

/// Default configuration for testing and development.
///
/// Production deployments should use `Config::from_env()` instead.
impl Default for Config {
    fn default() -> Self {
        Self {
            // Server
            host: "0.0.0.0".to_string(),
            port: 3000,
            environment: "development".to_string(),
            // Store
            redis_url: "redis://127.0.0.1:6379".to_string(),
            store_operation_timeout: Duration::from_secs(2),
            store_connect_max_attempts: 3,
            store_connect_base_delay: Duration::from_millis(100),
            store_connect_max_delay: Duration::from_secs(2),
            // Circuit breaker
            circuit_breaker_failure_threshold: 5,
            circuit_breaker_reset_timeout: Duration::from_secs(30),
            circuit_breaker_half_open_max_probes: 1,
            // Pipeline
            pipeline_step_timeout: Duration::from_secs(5),
            rate_limits: RateLimitPolicies::default(),
            // Authentication
            jwt_secret: DEV_JWT_SECRET.to_string(),
            platform_issuer: "api-gatekeeper".to_string(),
            token_ttl: Duration::from_secs(3600),
            identity_jwks_url: None,
            identity_issuer: None,
            identity_audience: None,
            // Security
            csrf_token_ttl: Duration::from_secs(3600),
            cors_allowed_origins: vec!["http://localhost:3000".to_string()],
            trusted_proxies: vec![], // Empty = trust all (dev mode)
            // Observability
            log_level: "info".to_string(),
            metrics_port: 9090,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let config = Config::default();

        assert_eq!(config.port, 3000);
        assert!(!config.is_production());
        assert_eq!(config.circuit_breaker_failure_threshold, 5);
        assert_eq!(config.pipeline_step_timeout, Duration::from_secs(5));
        assert_eq!(config.rate_limits.get(PolicyClass::Login).max, 5);
        assert!(config.identity_jwks_url.is_none());
    }

    #[test]
    fn test_server_addr_format() {
        let config = Config {
            host: "localhost".to_string(),
            port: 8080,
            ..Config::default()
        };

        assert_eq!(config.server_addr(), "localhost:8080");
    }

    #[test]
    fn test_validate_valid_config() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_validate_delay_ordering() {
        let config = Config {
            store_connect_base_delay: Duration::from_secs(60),
            store_connect_max_delay: Duration::from_secs(30),
            ..Config::default()
        };

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("STORE_CONNECT_BASE_DELAY_MS"));
    }

    #[test]
    fn test_validate_zero_breaker_threshold() {
        let config = Config {
            circuit_breaker_failure_threshold: 0,
            ..Config::default()
        };

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("CIRCUIT_BREAKER_FAILURE_THRESHOLD"));
    }

    #[test]
    fn test_validate_rejects_dev_secret_in_production() {
        let config = Config {
            environment: "production".to_string(),
            ..Config::default()
        };
        assert!(config.validate().unwrap_err().to_string().contains("JWT_SECRET"));

        let config = Config {
            environment: "Production".to_string(),
            jwt_secret: "x".repeat(48),
            ..Config::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_identity_settings_come_together() {
        let config = Config {
            identity_jwks_url: Some("https://idp.example.com/jwks.json".to_string()),
            ..Config::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            identity_jwks_url: Some("https://idp.example.com/jwks.json".to_string()),
            identity_issuer: Some("https://idp.example.com".to_string()),
            identity_audience: Some("my-app".to_string()),
            ..Config::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_issuers_must_differ() {
        let config = Config {
            identity_issuer: Some("api-gatekeeper".to_string()),
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_metrics_addr() {
        assert!(Config::default().metrics_addr().is_some());

        let config = Config {
            metrics_port: 0,
            ..Config::default()
        };
        assert!(config.metrics_addr().is_none());
    }
}
