//! Store-backed sliding-window rate limiting.
//!
//! # Algorithm
//!
//! Each key owns a sorted set of `(timestamp, unique member)` entries. Every
//! request runs one atomic batch (`MULTI`/`EXEC` on Redis):
//!
//! ```text
//! ZREMRANGEBYSCORE key -inf now-window       drop entries outside the window
//! ZADD             key now  member           record this request
//! ZCARD            key                       count requests in the window
//! PEXPIRE          key window                idle keys disappear
//! ```
//!
//! The window slides with every request; there are no fixed buckets. Because
//! the batch is atomic, concurrent requests on the same key cannot undercount.
//!
//! # Keys
//!
//! `ratelimit:{class}:{caller}:{path}` where `caller` is the authenticated
//! subject id, or the client address (see [`super::ip`]).
//!
//! # Response Headers
//!
//! - `X-RateLimit-Limit`: the policy maximum
//! - `X-RateLimit-Remaining`: `max(0, max - count)`
//! - `Retry-After` (429 only): the window length in seconds
//!
//! # Failure Mode
//!
//! Any store error, including an open circuit, lets the request through with
//! a warning. Quota enforcement must not take the API down with the store.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::http::{HeaderName, HeaderValue};
use chrono::Utc;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use super::ip::{TrustedProxyConfig, client_ip};
use crate::error::AppError;
use crate::metrics;
use crate::pipeline::{RequestContext, Step, StepOutcome};
use crate::store::{ResilientStore, StoreError, StorePipeline};

pub const RATE_LIMIT_LIMIT_HEADER: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const RATE_LIMIT_REMAINING_HEADER: HeaderName =
    HeaderName::from_static("x-ratelimit-remaining");

/// Error type for rate limit policy configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RateLimitConfigError {
    #[error("window must be at least 1ms")]
    ZeroWindow,
    #[error("max must be greater than 0")]
    ZeroMax,
}

/// Traffic classes with their own quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PolicyClass {
    Login,
    Signup,
    General,
    Write,
    Admin,
    Ai,
}

impl PolicyClass {
    pub const ALL: [PolicyClass; 6] = [
        PolicyClass::Login,
        PolicyClass::Signup,
        PolicyClass::General,
        PolicyClass::Write,
        PolicyClass::Admin,
        PolicyClass::Ai,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyClass::Login => "login",
            PolicyClass::Signup => "signup",
            PolicyClass::General => "general",
            PolicyClass::Write => "write",
            PolicyClass::Admin => "admin",
            PolicyClass::Ai => "ai",
        }
    }

    /// Upper-case name used in `RATE_LIMIT_<CLASS>_*` variables.
    pub fn env_prefix(&self) -> &'static str {
        match self {
            PolicyClass::Login => "LOGIN",
            PolicyClass::Signup => "SIGNUP",
            PolicyClass::General => "GENERAL",
            PolicyClass::Write => "WRITE",
            PolicyClass::Admin => "ADMIN",
            PolicyClass::Ai => "AI",
        }
    }
}

impl fmt::Display for PolicyClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// At most `max` requests per sliding `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitPolicy {
    pub window: Duration,
    pub max: u64,
}

impl RateLimitPolicy {
    pub fn new(window: Duration, max: u64) -> Result<Self, RateLimitConfigError> {
        if window.as_millis() == 0 {
            return Err(RateLimitConfigError::ZeroWindow);
        }
        if max == 0 {
            return Err(RateLimitConfigError::ZeroMax);
        }
        Ok(Self { window, max })
    }

    const fn preset(window_secs: u64, max: u64) -> Self {
        Self {
            window: Duration::from_secs(window_secs),
            max,
        }
    }

    fn window_ms(&self) -> i64 {
        i64::try_from(self.window.as_millis()).unwrap_or(i64::MAX)
    }

    /// `Retry-After` value for a rejected request.
    pub fn retry_after_secs(&self) -> u64 {
        self.window.as_secs().max(1)
    }
}

/// One policy per [`PolicyClass`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitPolicies {
    login: RateLimitPolicy,
    signup: RateLimitPolicy,
    general: RateLimitPolicy,
    write: RateLimitPolicy,
    admin: RateLimitPolicy,
    ai: RateLimitPolicy,
}

impl Default for RateLimitPolicies {
    fn default() -> Self {
        Self {
            login: RateLimitPolicy::preset(15 * 60, 5),
            signup: RateLimitPolicy::preset(60 * 60, 3),
            general: RateLimitPolicy::preset(15 * 60, 100),
            write: RateLimitPolicy::preset(60, 30),
            admin: RateLimitPolicy::preset(15 * 60, 50),
            ai: RateLimitPolicy::preset(60, 10),
        }
    }
}

impl RateLimitPolicies {
    pub fn get(&self, class: PolicyClass) -> RateLimitPolicy {
        *self.slot(class)
    }

    pub fn set(&mut self, class: PolicyClass, policy: RateLimitPolicy) {
        *self.slot_mut(class) = policy;
    }

    fn slot(&self, class: PolicyClass) -> &RateLimitPolicy {
        match class {
            PolicyClass::Login => &self.login,
            PolicyClass::Signup => &self.signup,
            PolicyClass::General => &self.general,
            PolicyClass::Write => &self.write,
            PolicyClass::Admin => &self.admin,
            PolicyClass::Ai => &self.ai,
        }
    }

    fn slot_mut(&mut self, class: PolicyClass) -> &mut RateLimitPolicy {
        match class {
            PolicyClass::Login => &mut self.login,
            PolicyClass::Signup => &mut self.signup,
            PolicyClass::General => &mut self.general,
            PolicyClass::Write => &mut self.write,
            PolicyClass::Admin => &mut self.admin,
            PolicyClass::Ai => &mut self.ai,
        }
    }
}

/// Outcome of one limiter check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub limit: u64,
    /// Requests in the window, including this one.
    pub count: u64,
    pub remaining: u64,
}

impl RateLimitDecision {
    pub fn allowed(&self) -> bool {
        self.count <= self.limit
    }
}

/// Sliding-window counter over the resilient store.
pub struct SlidingWindowLimiter {
    store: Arc<ResilientStore>,
}

impl SlidingWindowLimiter {
    pub fn new(store: Arc<ResilientStore>) -> Self {
        Self { store }
    }

    pub async fn check(
        &self,
        key: &str,
        policy: RateLimitPolicy,
    ) -> Result<RateLimitDecision, StoreError> {
        self.check_at(key, policy, Utc::now().timestamp_millis())
            .await
    }

    /// Record a request at `now_ms` and count the window ending there.
    pub async fn check_at(
        &self,
        key: &str,
        policy: RateLimitPolicy,
        now_ms: i64,
    ) -> Result<RateLimitDecision, StoreError> {
        let member = format!("{now_ms}-{}", Uuid::new_v4());
        let batch = StorePipeline::new()
            .remove_range_by_score(key, now_ms.saturating_sub(policy.window_ms()))
            .scored_add(key, now_ms, member)
            .cardinality(key)
            .expire(key, policy.window);

        let replies = self.store.execute_atomic(batch).await?;
        let count = replies
            .get(2)
            .copied()
            .ok_or_else(|| StoreError::Decode(format!("expected 4 replies, got {}", replies.len())))?;
        let count = u64::try_from(count).unwrap_or(0);

        Ok(RateLimitDecision {
            limit: policy.max,
            count,
            remaining: policy.max.saturating_sub(count),
        })
    }
}

/// Pipeline step enforcing one policy class.
pub struct RateLimitStep {
    limiter: Arc<SlidingWindowLimiter>,
    class: PolicyClass,
    policy: RateLimitPolicy,
    trusted_proxies: Arc<TrustedProxyConfig>,
}

impl RateLimitStep {
    pub fn new(
        limiter: Arc<SlidingWindowLimiter>,
        class: PolicyClass,
        policy: RateLimitPolicy,
        trusted_proxies: Arc<TrustedProxyConfig>,
    ) -> Self {
        Self {
            limiter,
            class,
            policy,
            trusted_proxies,
        }
    }

    /// Limiter key for this request. Keyed on the route template so every
    /// resource behind one route shares a quota.
    pub fn key(&self, ctx: &RequestContext) -> String {
        let caller = match &ctx.identity {
            Some(identity) => identity.subject_id.clone(),
            None => client_ip(&ctx.headers, ctx.peer, &self.trusted_proxies).into_owned(),
        };
        format!("ratelimit:{}:{}:{}", self.class, caller, ctx.route)
    }
}

#[async_trait]
impl Step for RateLimitStep {
    fn name(&self) -> &'static str {
        "rate_limit"
    }

    async fn run(&self, ctx: &mut RequestContext) -> StepOutcome {
        let key = self.key(ctx);

        let decision = match self.limiter.check(&key, self.policy).await {
            Ok(decision) => decision,
            Err(e) => {
                warn!(
                    class = %self.class,
                    key = %key,
                    error = %e,
                    "Rate limiter unavailable, allowing request"
                );
                metrics::record_rate_limit_decision(self.class.as_str(), "fail_open");
                return StepOutcome::Continue;
            }
        };

        ctx.set_response_header(RATE_LIMIT_LIMIT_HEADER, HeaderValue::from(decision.limit));
        ctx.set_response_header(
            RATE_LIMIT_REMAINING_HEADER,
            HeaderValue::from(decision.remaining),
        );

        if decision.allowed() {
            debug!(class = %self.class, count = decision.count, "Rate limit check passed");
            metrics::record_rate_limit_decision(self.class.as_str(), "allowed");
            return StepOutcome::Continue;
        }

        warn!(
            class = %self.class,
            key = %key,
            count = decision.count,
            limit = decision.limit,
            "Rate limit exceeded"
        );
        metrics::record_rate_limit_decision(self.class.as_str(), "rejected");
        AppError::QuotaExceeded {
            retry_after_secs: self.policy.retry_after_secs(),
        }
        .into()
    }
}
