//! Request pipeline steps and their axum glue.
//!
//! - **CORS**: allow-list with credential reflection and preflight handling
//! - **Security headers**: HSTS, nosniff, frame and referrer policy
//! - **CSRF**: double-submit cookie check on state-changing methods
//! - **Authentication**: dual-mode bearer resolution, required or optional
//! - **Rate limiting**: sliding window per caller, route and policy class
//! - **Authorization**: required roles or resource ownership
//! - **Request ID**: generated or propagated `X-Request-Id` (tower layer)
//!
//! # Architecture
//!
//! ```text
//! Request → RequestId → Trace → run_pipeline ─┬─ cors → headers → csrf → auth → limit → authorize ─→ Handler
//!                                             └─ early / error response (+ step headers)
//! ```
//!
//! # Security Considerations
//!
//! - CSRF tokens are compared in constant time
//! - Authorization fails closed; rate limiting fails open
//! - Trusted proxy configuration mitigates IP spoofing of rate-limit keys

pub mod authenticate;
pub mod authorize;
pub mod cors;
pub mod csrf;
pub mod ip;
pub mod layer;
pub mod rate_limit;
pub mod request_id;
pub mod security_headers;

pub use authenticate::AuthenticateStep;
pub use authorize::{OwnerLookup, RequireOwnership, RequireRoles, owner_lookup};
pub use cors::{CorsPolicy, CorsStep};
pub use csrf::CsrfStep;
pub use ip::{TrustedProxyConfig, UNKNOWN_IP, client_ip};
pub use layer::{Authenticated, MaybeAuthenticated, run_pipeline};
pub use rate_limit::{
    PolicyClass, RateLimitPolicies, RateLimitPolicy, RateLimitStep, SlidingWindowLimiter,
};
pub use request_id::{REQUEST_ID_HEADER, RequestIdLayer};
pub use security_headers::SecurityHeadersStep;
