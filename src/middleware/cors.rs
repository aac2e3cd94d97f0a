//! CORS allow-list enforcement.
//!
//! Origins come from `CORS_ALLOWED_ORIGINS`. Entries are rejected when they
//! cannot be used with credentialed requests:
//!
//! - `*` (or any entry containing a wildcard)
//! - anything that is not `http(s)://host[:port]`
//! - plain `http://` origins in production
//!
//! A request whose `Origin` is on the list gets it reflected back with
//! `Access-Control-Allow-Credentials: true`. A request with any other
//! `Origin` is refused with `CORS_ORIGIN_DENIED`. Requests without an
//! `Origin` header (same-origin, server-to-server) pass untouched.
//!
//! `OPTIONS` preflights are answered with 200 once the headers are set.

use std::collections::HashSet;

use async_trait::async_trait;
use axum::http::{HeaderValue, Method, StatusCode, header};
use tracing::{debug, warn};

use crate::error::AppError;
use crate::metrics;
use crate::pipeline::{RequestContext, Step, StepOutcome};

const ALLOWED_METHODS: &str = "GET, POST, PUT, PATCH, DELETE, OPTIONS";
const ALLOWED_HEADERS: &str = "authorization, content-type, x-csrf-token, x-request-id";
const EXPOSED_HEADERS: &str = "x-ratelimit-limit, x-ratelimit-remaining, retry-after, x-request-id";
const PREFLIGHT_MAX_AGE_SECS: &str = "600";

/// Validated set of allowed origins.
#[derive(Debug, Clone, Default)]
pub struct CorsPolicy {
    origins: HashSet<String>,
}

impl CorsPolicy {
    /// Build the allow-list, dropping (and logging) unusable entries.
    pub fn from_origins(origins: &[String], production: bool) -> Self {
        let origins = origins
            .iter()
            .filter_map(|origin| match validate_origin(origin, production) {
                Ok(origin) => Some(origin),
                Err(reason) => {
                    warn!(origin = %origin, reason, "Ignoring CORS origin");
                    None
                }
            })
            .collect::<HashSet<_>>();

        debug!(count = origins.len(), "CORS allow-list configured");
        Self { origins }
    }

    pub fn is_allowed(&self, origin: &str) -> bool {
        self.origins.contains(&normalize_origin(origin))
    }

    pub fn len(&self) -> usize {
        self.origins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.origins.is_empty()
    }
}

/// Scheme and host are case-insensitive; an origin carries nothing else
/// but the port.
fn normalize_origin(origin: &str) -> String {
    origin.trim().trim_end_matches('/').to_ascii_lowercase()
}

fn validate_origin(origin: &str, production: bool) -> Result<String, &'static str> {
    let origin = normalize_origin(origin);

    if origin.contains('*') {
        return Err("wildcard origins are not allowed");
    }

    let rest = if let Some(rest) = origin.strip_prefix("https://") {
        rest
    } else if let Some(rest) = origin.strip_prefix("http://") {
        if production {
            return Err("non-TLS origins are not allowed in production");
        }
        rest
    } else {
        return Err("origin must start with http:// or https://");
    };

    if rest.is_empty() || rest.contains('/') {
        return Err("origin must be scheme and host only");
    }

    Ok(origin)
}

/// Pipeline step applying a [`CorsPolicy`].
pub struct CorsStep {
    policy: CorsPolicy,
}

impl CorsStep {
    pub fn new(policy: CorsPolicy) -> Self {
        Self { policy }
    }
}

#[async_trait]
impl Step for CorsStep {
    fn name(&self) -> &'static str {
        "cors"
    }

    async fn run(&self, ctx: &mut RequestContext) -> StepOutcome {
        ctx.append_response_header(header::VARY, HeaderValue::from_static("origin"));

        if let Some(origin) = ctx.header(header::ORIGIN.as_str()) {
            if !self.policy.is_allowed(origin) {
                warn!(origin, path = %ctx.path, "Origin not allowed");
                metrics::record_cors_rejection();
                return AppError::CorsDenied(origin.to_string()).into();
            }

            let Ok(value) = HeaderValue::from_str(origin) else {
                return AppError::CorsDenied(origin.to_string()).into();
            };
            ctx.set_response_header(header::ACCESS_CONTROL_ALLOW_ORIGIN, value);
            ctx.set_response_header(
                header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
                HeaderValue::from_static("true"),
            );
            ctx.set_response_header(
                header::ACCESS_CONTROL_ALLOW_METHODS,
                HeaderValue::from_static(ALLOWED_METHODS),
            );
            ctx.set_response_header(
                header::ACCESS_CONTROL_ALLOW_HEADERS,
                HeaderValue::from_static(ALLOWED_HEADERS),
            );
            ctx.set_response_header(
                header::ACCESS_CONTROL_EXPOSE_HEADERS,
                HeaderValue::from_static(EXPOSED_HEADERS),
            );
        }

        if ctx.method == Method::OPTIONS {
            ctx.set_response_header(
                header::ACCESS_CONTROL_MAX_AGE,
                HeaderValue::from_static(PREFLIGHT_MAX_AGE_SECS),
            );
            return StepOutcome::respond(StatusCode::OK);
        }

        StepOutcome::Continue
    }
}
