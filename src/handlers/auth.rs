//! Session endpoints.
//!
//! - `GET /api/csrf-token` - issue a double-submit token (cookie + body)
//! - `POST /api/auth/login` - exchange any accepted credential for a platform token
//! - `POST /api/auth/signup` - create the caller's profile record on first use
//! - `GET /api/me` - describe the caller, or report anonymous access

use axum::Json;
use axum::extract::State;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use serde_json::json;
use tracing::{info, instrument};

use crate::auth::{BASE_ROLE, StoreProfileDirectory};
use crate::error::{AppError, AppResult};
use crate::middleware::csrf;
use crate::middleware::{Authenticated, MaybeAuthenticated};
use crate::models::{
    ApiResponse, CsrfTokenResponse, LoginResponse, MeResponse, SignupResponse, UserView,
};
use crate::state::AppState;

/// Issue a CSRF token.
///
/// The same value is returned in the body and in a `csrf-token` cookie; the
/// client echoes it in `X-CSRF-Token` on state-changing requests.
#[instrument(skip(state))]
pub async fn csrf_token(State(state): State<AppState>) -> AppResult<Response> {
    let token = csrf::issue_token();
    let ttl = state.config.csrf_token_ttl;
    let cookie = csrf::set_cookie_value(&token, ttl, state.config.is_production());
    let cookie = HeaderValue::from_str(&cookie)
        .map_err(|e| AppError::Internal(format!("CSRF cookie not a valid header: {e}")))?;

    let body = Json(ApiResponse::ok(CsrfTokenResponse {
        csrf_token: token,
        expires_in: ttl.as_secs(),
    }));

    Ok(([(header::SET_COOKIE, cookie)], body).into_response())
}

/// Issue a platform token for the authenticated caller.
///
/// # Response Body
///
/// ```json
/// {
///   "success": true,
///   "data": {
///     "token": "eyJ...",
///     "token_type": "Bearer",
///     "expires_in": 3600,
///     "user": { "subject_id": "u1", "email": "a@b.c", "email_verified": true, "roles": ["user"] }
///   }
/// }
/// ```
#[instrument(skip_all, fields(subject_id = %identity.subject_id))]
pub async fn login(
    State(state): State<AppState>,
    Authenticated(identity): Authenticated,
) -> AppResult<Json<ApiResponse<LoginResponse>>> {
    let issued = state
        .authenticator
        .tokens()
        .issue(
            &identity.subject_id,
            identity.email.as_deref().unwrap_or_default(),
            identity.email_verified,
        )
        .map_err(|e| AppError::Internal(format!("Failed to sign platform token: {e}")))?;

    info!("Issued platform token");

    Ok(Json(ApiResponse::ok(LoginResponse {
        token: issued.token,
        token_type: "Bearer",
        expires_in: issued.expires_in,
        user: identity.into(),
    })))
}

/// Create the caller's profile with the base role if it does not exist yet.
///
/// Returns 201 when a profile was created and 200 when one already existed.
#[instrument(skip_all, fields(subject_id = %identity.subject_id))]
pub async fn signup(
    State(state): State<AppState>,
    Authenticated(identity): Authenticated,
) -> AppResult<(StatusCode, Json<ApiResponse<SignupResponse>>)> {
    let key = StoreProfileDirectory::profile_key(&identity.subject_id);

    if state.store.get(&key).await?.is_some() {
        return Ok((
            StatusCode::OK,
            Json(ApiResponse::ok(SignupResponse {
                created: false,
                user: identity.into(),
            })),
        ));
    }

    let profile = json!({
        "email": identity.email,
        "role": BASE_ROLE,
        "blocked": false,
        "created_at": Utc::now(),
    });
    state.store.set(&key, &profile.to_string(), None).await?;

    info!("Created user profile");

    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::ok(SignupResponse {
            created: true,
            user: identity.into(),
        })),
    ))
}

/// Describe the caller. Anonymous requests succeed with `authenticated: false`.
#[instrument(skip_all)]
pub async fn me(MaybeAuthenticated(identity): MaybeAuthenticated) -> Json<ApiResponse<MeResponse>> {
    Json(ApiResponse::ok(MeResponse {
        authenticated: identity.is_some(),
        user: identity.map(UserView::from),
    }))
}
