//! # API Gatekeeper
//!
//! The request trust boundary of a multi-tenant API, built on Axum:
//!
//! - **Authentication**: platform-issued HS256 tokens and external identity
//!   tokens (RS256 via JWKS), routed by issuer; roles from a profile store
//! - **Authorization**: required roles or resource ownership, failing closed
//! - **Browser hardening**: CORS allow-list, CSRF double-submit cookie,
//!   security headers
//! - **Rate limiting**: sliding window per caller, route and traffic class,
//!   failing open when the store is down
//! - **Resilience**: store access behind a circuit breaker with lazy,
//!   single-flight connection and bounded retries
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Axum HTTP Server                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Layers (Request ID → Trace)                                │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Route pipelines (CORS → headers → CSRF → auth → limit →    │
//! │                   authorize), bounded per step              │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Handlers (health, session, surveys, admin, ai)             │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ResilientStore (circuit breaker, retry, timeout)           │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Redis                                                      │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use api_gatekeeper::{AppState, Config, build_router};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_env()?;
//!     let state = AppState::from_config(config)?;
//!     let app = build_router(state);
//!
//!     // Start the server...
//!     Ok(())
//! }
//! ```
//!
//! ## Security Configuration
//!
//! ```bash
//! APP_ENV=production JWT_SECRET=... CORS_ALLOWED_ORIGINS=https://app.example.com cargo run
//! ```

pub mod auth;
pub mod config;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod models;
pub mod pipeline;
pub mod routes;
pub mod state;
pub mod store;
pub mod utils;

// Re-exports for convenience
pub use auth::{AuthenticatedIdentity, Authenticator};
pub use config::Config;
pub use error::{AppError, AppResult};
pub use pipeline::{Pipeline, RequestContext, Step, StepOutcome};
pub use routes::build_router;
pub use state::AppState;
pub use store::ResilientStore;
