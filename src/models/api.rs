use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::auth::AuthenticatedIdentity;

/// Success envelope: `{"success": true, "data": ...}`.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: T,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data,
        }
    }
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// `ok` or `degraded`
    pub status: &'static str,
    /// `up` or `down`
    pub store: &'static str,
    /// `CLOSED`, `OPEN` or `HALF_OPEN`
    pub circuit_state: &'static str,
    pub version: &'static str,
    pub uptime_secs: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct CsrfTokenResponse {
    pub csrf_token: String,
    pub expires_in: u64,
}

/// Public view of the caller.
#[derive(Debug, Serialize)]
pub struct UserView {
    pub subject_id: String,
    pub email: Option<String>,
    pub email_verified: bool,
    pub roles: BTreeSet<String>,
}

impl From<AuthenticatedIdentity> for UserView {
    fn from(identity: AuthenticatedIdentity) -> Self {
        Self {
            subject_id: identity.subject_id,
            email: identity.email,
            email_verified: identity.email_verified,
            roles: identity.roles,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub token: String,
    pub token_type: &'static str,
    pub expires_in: u64,
    pub user: UserView,
}

#[derive(Debug, Serialize)]
pub struct SignupResponse {
    pub created: bool,
    pub user: UserView,
}

#[derive(Debug, Serialize)]
pub struct MeResponse {
    pub authenticated: bool,
    pub user: Option<UserView>,
}

#[derive(Debug, Deserialize)]
pub struct CreateSurveyRequest {
    pub title: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SurveyResponse {
    pub id: String,
    pub title: String,
    pub owner_id: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct SuggestionRequest {
    pub topic: String,
    #[serde(default = "default_suggestion_count")]
    pub count: usize,
}

fn default_suggestion_count() -> usize {
    3
}

#[derive(Debug, Serialize)]
pub struct SuggestionResponse {
    pub topic: String,
    pub suggestions: Vec<String>,
}

/// Breaker counters for the admin stats endpoint.
#[derive(Debug, Serialize)]
pub struct CircuitStats {
    pub state: &'static str,
    pub failure_count: u32,
    pub times_opened: u32,
    pub requests_rejected: u64,
    pub failure_threshold: u32,
    pub reset_timeout_ms: u64,
}

#[derive(Debug, Serialize)]
pub struct RateLimitView {
    pub class: &'static str,
    pub window_ms: u64,
    pub max: u64,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub store_up: bool,
    pub circuit_breaker: CircuitStats,
    pub rate_limits: Vec<RateLimitView>,
    pub uptime_secs: u64,
}
