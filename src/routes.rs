//! Application routing with per-route-group pipelines.
//!
//! # Layers (outermost first)
//!
//! ```text
//! Request
//!    │
//!    ▼
//! ┌──────────────────┐
//! │   Request ID     │ ← Adds X-Request-Id header
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │     Tracing      │ ← HTTP request/response logging
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │  Route pipeline  │ ← CORS → headers → CSRF → auth → limit → authorize
//! └────────┬─────────┘
//!          ▼
//!      Handler
//! ```
//!
//! # Route Groups
//!
//! | Route | Pipeline |
//! |---|---|
//! | `GET /health`, `GET /ready` | none |
//! | `GET /api/csrf-token` | CORS, headers, general limit |
//! | `POST /api/auth/login` | CORS, headers, CSRF, auth, login limit |
//! | `POST /api/auth/signup` | CORS, headers, CSRF, auth, signup limit |
//! | `GET /api/me` | CORS, headers, optional auth, general limit |
//! | `POST /api/surveys` | CORS, headers, CSRF, auth, write limit |
//! | `DELETE /api/surveys/{id}` | CORS, headers, CSRF, auth, write limit, ownership |
//! | `GET /api/admin/stats` | CORS, headers, auth, admin limit, role `admin` |
//! | `POST /api/ai/suggestions` | CORS, headers, CSRF, auth, ai limit |
//!
//! Authentication runs before rate limiting so authenticated callers are
//! limited per subject rather than per IP.

use std::sync::Arc;

use axum::Router;
use axum::middleware::from_fn_with_state;
use axum::routing::{delete, get, post};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::auth::ADMIN_ROLE;
use crate::handlers;
use crate::handlers::surveys::survey_owner_key;
use crate::middleware::{
    AuthenticateStep, CorsStep, CsrfStep, PolicyClass, RateLimitStep, RequestIdLayer,
    RequireOwnership, RequireRoles, SecurityHeadersStep, owner_lookup, run_pipeline,
};
use crate::pipeline::{Pipeline, PipelineBuilder, RequestContext, Step};
use crate::state::AppState;

/// Build the application router with all routes and pipelines configured.
pub fn build_router(state: AppState) -> Router {
    let guards = Guards::new(&state);

    let monitoring = Router::new()
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check));

    let csrf_token = guarded(
        Router::new().route("/api/csrf-token", get(handlers::csrf_token)),
        guards.public().step(guards.rate_limit(PolicyClass::General)).build(),
    );

    let login = guarded(
        Router::new().route("/api/auth/login", post(handlers::login)),
        guards
            .protected()
            .step(guards.rate_limit(PolicyClass::Login))
            .build(),
    );

    let signup = guarded(
        Router::new().route("/api/auth/signup", post(handlers::signup)),
        guards
            .protected()
            .step(guards.rate_limit(PolicyClass::Signup))
            .build(),
    );

    let me = guarded(
        Router::new().route("/api/me", get(handlers::me)),
        guards
            .public()
            .step(AuthenticateStep::optional(state.authenticator.clone()))
            .step(guards.rate_limit(PolicyClass::General))
            .build(),
    );

    let create_survey = guarded(
        Router::new().route("/api/surveys", post(handlers::create_survey)),
        guards
            .protected()
            .step(guards.rate_limit(PolicyClass::Write))
            .build(),
    );

    let store = state.store.clone();
    let delete_survey = guarded(
        Router::new().route("/api/surveys/{id}", delete(handlers::delete_survey)),
        guards
            .protected()
            .step(guards.rate_limit(PolicyClass::Write))
            .step(RequireOwnership::new(owner_lookup(
                move |ctx: &RequestContext| {
                    let store = store.clone();
                    let id = ctx.segment(2).map(str::to_string);
                    async move {
                        match id {
                            Some(id) => store.get(&survey_owner_key(&id)).await,
                            None => Ok(None),
                        }
                    }
                },
            )))
            .build(),
    );

    // No CSRF: read-only
    let admin = guarded(
        Router::new().route("/api/admin/stats", get(handlers::stats)),
        guards
            .public()
            .step(AuthenticateStep::required(state.authenticator.clone()))
            .step(guards.rate_limit(PolicyClass::Admin))
            .step(RequireRoles::any_of([ADMIN_ROLE]))
            .build(),
    );

    let ai = guarded(
        Router::new().route("/api/ai/suggestions", post(handlers::suggest_questions)),
        guards.protected().step(guards.rate_limit(PolicyClass::Ai)).build(),
    );

    info!(
        step_timeout_ms = state.config.pipeline_step_timeout.as_millis(),
        cors_origins = state.cors.len(),
        trusted_proxies = state.config.trusted_proxies.len(),
        "Route pipelines configured"
    );

    monitoring
        .merge(csrf_token)
        .merge(login)
        .merge(signup)
        .merge(me)
        .merge(create_survey)
        .merge(delete_survey)
        .merge(admin)
        .merge(ai)
        .fallback(handlers::not_found)
        .layer(TraceLayer::new_for_http())
        .layer(RequestIdLayer::new())
        .with_state(state)
}

/// Mount `pipeline` in front of every route of `router`.
///
/// Applied with `layer` rather than `route_layer` so preflight requests to
/// POST/DELETE-only routes still reach the CORS step. `layer` also wraps the
/// group's fallback, which `build_router` replaces with a bare 404 after
/// merging.
fn guarded(router: Router<AppState>, pipeline: Pipeline) -> Router<AppState> {
    router.layer(from_fn_with_state(pipeline, run_pipeline))
}

/// Steps shared by several pipelines.
struct Guards {
    state: AppState,
    cors: Arc<dyn Step>,
    headers: Arc<dyn Step>,
}

impl Guards {
    fn new(state: &AppState) -> Self {
        Self {
            state: state.clone(),
            cors: Arc::new(CorsStep::new(state.cors.clone())),
            headers: Arc::new(SecurityHeadersStep),
        }
    }

    /// CORS and security headers.
    fn public(&self) -> PipelineBuilder {
        Pipeline::builder(self.state.config.pipeline_step_timeout)
            .shared_step(self.cors.clone())
            .shared_step(self.headers.clone())
    }

    /// CORS, security headers, CSRF and required authentication.
    fn protected(&self) -> PipelineBuilder {
        self.public()
            .step(CsrfStep)
            .step(AuthenticateStep::required(self.state.authenticator.clone()))
    }

    fn rate_limit(&self, class: PolicyClass) -> RateLimitStep {
        RateLimitStep::new(
            self.state.limiter.clone(),
            class,
            self.state.config.rate_limits.get(class),
            self.state.trusted_proxies.clone(),
        )
    }
}
