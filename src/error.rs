use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::store::StoreError;

/// Why a credential could not be turned into an identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailure {
    /// No bearer credential on the request.
    Missing,
    /// Signature mismatch, unknown issuer, revoked or otherwise rejected.
    Invalid,
    /// Signature valid but the token is past its expiry.
    Expired,
    /// Not a decodable token, or required claims are absent.
    Malformed,
    /// Credential valid but the account is blocked.
    Blocked,
}

impl AuthFailure {
    pub fn code(&self) -> &'static str {
        match self {
            AuthFailure::Missing => "AUTH_MISSING",
            AuthFailure::Invalid => "AUTH_INVALID",
            AuthFailure::Expired => "AUTH_EXPIRED",
            AuthFailure::Malformed => "AUTH_MALFORMED",
            AuthFailure::Blocked => "AUTH_BLOCKED",
        }
    }

    fn message(&self) -> &'static str {
        match self {
            AuthFailure::Missing => "Authentication required",
            AuthFailure::Invalid => "Invalid authentication token",
            AuthFailure::Expired => "Authentication token has expired",
            AuthFailure::Malformed => "Malformed authentication token",
            AuthFailure::Blocked => "This account has been blocked",
        }
    }
}

impl std::fmt::Display for AuthFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let reason = match self {
            AuthFailure::Missing => "missing",
            AuthFailure::Invalid => "invalid",
            AuthFailure::Expired => "expired",
            AuthFailure::Malformed => "malformed",
            AuthFailure::Blocked => "blocked",
        };
        f.write_str(reason)
    }
}

/// Double-submit token check failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CsrfFailure {
    /// Cookie or header value absent.
    Missing,
    /// Both present but not equal.
    Invalid,
}

/// Application-wide error types with appropriate HTTP status codes.
///
/// Every variant maps to exactly one status and one stable error code. Only
/// operational errors echo their message to the client; `Internal` and
/// `Config` are masked and tagged with a correlation id instead.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Authentication failed: {0}")]
    Authentication(AuthFailure),

    #[error("Access denied: {0}")]
    Authorization(String),

    #[error("CSRF validation failed: {0:?}")]
    Csrf(CsrfFailure),

    #[error("Origin not allowed: {0}")]
    CorsDenied(String),

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Rate limit exceeded")]
    QuotaExceeded { retry_after_secs: u64 },

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Internal server error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl AppError {
    /// HTTP status for this error kind.
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Authentication(_) => StatusCode::UNAUTHORIZED,
            AppError::Authorization(_) | AppError::Csrf(_) | AppError::CorsDenied(_) => {
                StatusCode::FORBIDDEN
            }
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::QuotaExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            AppError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Internal(_) | AppError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Authentication(reason) => reason.code(),
            AppError::Authorization(_) => "FORBIDDEN",
            AppError::Csrf(CsrfFailure::Missing) => "CSRF_TOKEN_MISSING",
            AppError::Csrf(CsrfFailure::Invalid) => "CSRF_TOKEN_INVALID",
            AppError::CorsDenied(_) => "CORS_ORIGIN_DENIED",
            AppError::Validation(_) => "VALIDATION_ERROR",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::QuotaExceeded { .. } => "RATE_LIMIT_EXCEEDED",
            AppError::ServiceUnavailable(_) => "SERVICE_UNAVAILABLE",
            AppError::Internal(_) | AppError::Config(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether the error is an expected operational outcome whose message is
    /// safe to show to the caller.
    pub fn is_operational(&self) -> bool {
        !matches!(self, AppError::Internal(_) | AppError::Config(_))
    }

    /// Render the error envelope, attaching `correlation_id` to masked errors.
    ///
    /// This is the single place where errors become responses.
    pub fn into_response_with_correlation(self, correlation_id: &str) -> Response {
        let status = self.status();
        let code = self.code();

        let (message, details) = match &self {
            AppError::Authentication(reason) => {
                tracing::debug!(reason = %reason, "Authentication rejected");
                (reason.message().to_string(), None)
            }
            AppError::Authorization(msg) => (msg.clone(), None),
            AppError::Csrf(CsrfFailure::Missing) => ("CSRF token missing".to_string(), None),
            AppError::Csrf(CsrfFailure::Invalid) => ("CSRF token invalid".to_string(), None),
            AppError::CorsDenied(_) => ("Origin not allowed".to_string(), None),
            AppError::Validation(msg) | AppError::NotFound(msg) => (msg.clone(), None),
            AppError::QuotaExceeded { retry_after_secs } => (
                "Too many requests. Please retry later.".to_string(),
                Some(serde_json::json!({ "retry_after_secs": retry_after_secs })),
            ),
            AppError::ServiceUnavailable(_) => (
                "Service is temporarily unavailable. Please try again later.".to_string(),
                None,
            ),
            AppError::Internal(_) | AppError::Config(_) => {
                // Log the full error details server-side for debugging
                // but only expose sanitized messages to clients
                tracing::error!(error = %self, correlation_id, "Request failed");
                (
                    "An internal error occurred. Please contact support if the issue persists."
                        .to_string(),
                    Some(serde_json::json!({ "correlation_id": correlation_id })),
                )
            }
        };

        if self.is_operational() {
            tracing::warn!(status = status.as_u16(), code, error = %self, "Request rejected");
        }

        let body = ErrorEnvelope {
            success: false,
            error: ErrorBody {
                code,
                message,
                details,
            },
        };

        let mut response = (status, axum::Json(body)).into_response();
        if let AppError::QuotaExceeded { retry_after_secs } = self
            && let Ok(value) = HeaderValue::from_str(&retry_after_secs.to_string())
        {
            response.headers_mut().insert("retry-after", value);
        }
        if status == StatusCode::UNAUTHORIZED {
            response
                .headers_mut()
                .insert("www-authenticate", HeaderValue::from_static("Bearer"));
        }
        response
    }
}

/// Error response body for API endpoints.
#[derive(Serialize)]
pub struct ErrorEnvelope {
    pub success: bool,
    pub error: ErrorBody,
}

#[derive(Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        // Handlers without access to the request id still get a unique id
        // so masked errors can be found in the logs.
        let correlation_id = Uuid::new_v4().to_string();
        self.into_response_with_correlation(&correlation_id)
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::CircuitOpen | StoreError::Connection(_) | StoreError::Timeout(_) => {
                AppError::ServiceUnavailable(err.to_string())
            }
            StoreError::Command(_) | StoreError::Decode(_) => AppError::Internal(err.to_string()),
        }
    }
}

/// Convenience type alias for Results with AppError.
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            AppError::Authentication(AuthFailure::Expired).status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            AppError::Authorization("nope".into()).status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            AppError::Csrf(CsrfFailure::Missing).status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            AppError::QuotaExceeded {
                retry_after_secs: 3
            }
            .status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            AppError::ServiceUnavailable("breaker".into()).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            AppError::Validation("bad".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError::NotFound("/nope".into()).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(AppError::NotFound("/nope".into()).code(), "NOT_FOUND");
    }

    #[test]
    fn test_auth_failure_codes_are_distinct() {
        let codes = [
            AuthFailure::Missing,
            AuthFailure::Invalid,
            AuthFailure::Expired,
            AuthFailure::Malformed,
            AuthFailure::Blocked,
        ]
        .map(|f| f.code());
        let unique: std::collections::HashSet<_> = codes.iter().collect();
        assert_eq!(unique.len(), codes.len());
    }

    #[tokio::test]
    async fn test_envelope_shape_for_operational_error() {
        let response =
            AppError::Csrf(CsrfFailure::Invalid).into_response_with_correlation("req-1");
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let json = body_json(response).await;
        assert_eq!(json["success"], false);
        assert_eq!(json["error"]["code"], "CSRF_TOKEN_INVALID");
        assert!(json["error"].get("details").is_none());
    }

    #[tokio::test]
    async fn test_internal_error_is_masked_with_correlation_id() {
        let response = AppError::Internal("db password is hunter2".into())
            .into_response_with_correlation("corr-42");
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let json = body_json(response).await;
        assert_eq!(json["error"]["code"], "INTERNAL_ERROR");
        assert!(!json["error"]["message"].as_str().unwrap().contains("hunter2"));
        assert_eq!(json["error"]["details"]["correlation_id"], "corr-42");
    }

    #[tokio::test]
    async fn test_quota_exceeded_sets_retry_after() {
        let response = AppError::QuotaExceeded {
            retry_after_secs: 17,
        }
        .into_response_with_correlation("x");
        assert_eq!(response.headers().get("retry-after").unwrap(), "17");
    }

    #[test]
    fn test_store_errors_map_to_unavailable() {
        let err: AppError = StoreError::CircuitOpen.into();
        assert_eq!(err.status(), StatusCode::SERVICE_UNAVAILABLE);

        let err: AppError = StoreError::Command("WRONGTYPE".into()).into();
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
