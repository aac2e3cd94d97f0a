//! Bridges [`Pipeline`]s into axum.
//!
//! Each route group gets its own pipeline, mounted with
//! `axum::middleware::from_fn_with_state(pipeline, run_pipeline)`. On
//! `Continue` the resolved identity is stored in the request extensions,
//! where the [`Authenticated`] and [`MaybeAuthenticated`] extractors find it.
//! Headers the steps accumulated are merged into whatever response ends the
//! request, including early and error responses.

use std::convert::Infallible;
use std::net::SocketAddr;

use axum::Json;
use axum::extract::{ConnectInfo, FromRequestParts, MatchedPath, Request, State};
use axum::http::HeaderMap;
use axum::http::request::Parts;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use super::request_id::request_id;
use crate::auth::AuthenticatedIdentity;
use crate::error::{AppError, AuthFailure};
use crate::pipeline::{Pipeline, RequestContext, StepOutcome};

/// axum middleware running `pipeline` before the handler.
pub async fn run_pipeline(State(pipeline): State<Pipeline>, req: Request, next: Next) -> Response {
    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let request_id = request_id(req.headers()).unwrap_or_default().to_string();
    let path = req.uri().path();
    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map_or(path, MatchedPath::as_str)
        .to_string();

    let mut ctx = RequestContext::new(req.method().clone(), path, req.headers().clone())
        .with_route(route)
        .with_peer(peer)
        .with_request_id(request_id);

    let mut response = match pipeline.execute(&mut ctx).await {
        StepOutcome::Continue => {
            let mut req = req;
            if let Some(identity) = ctx.identity.take() {
                req.extensions_mut().insert(identity);
            }
            next.run(req).await
        }
        StepOutcome::Respond { status, body } => match body {
            Some(body) => (status, Json(body)).into_response(),
            None => status.into_response(),
        },
        StepOutcome::Error(err) => err.into_response_with_correlation(&ctx.request_id),
    };

    merge_headers(response.headers_mut(), ctx.response_headers);
    response
}

/// Copy step headers onto the response. Step values replace handler values
/// of the same name.
fn merge_headers(target: &mut HeaderMap, headers: HeaderMap) {
    target.extend(headers);
}

/// Extractor for handlers behind a required-authentication pipeline.
///
/// Rejects with 401 when no identity was attached, e.g. because the
/// authentication step timed out and was skipped.
#[derive(Debug, Clone)]
pub struct Authenticated(pub AuthenticatedIdentity);

impl<S: Send + Sync> FromRequestParts<S> for Authenticated {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<AuthenticatedIdentity>()
            .cloned()
            .map(Authenticated)
            .ok_or(AppError::Authentication(AuthFailure::Missing))
    }
}

/// Extractor for handlers behind an optional-authentication pipeline.
#[derive(Debug, Clone)]
pub struct MaybeAuthenticated(pub Option<AuthenticatedIdentity>);

impl<S: Send + Sync> FromRequestParts<S> for MaybeAuthenticated {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(MaybeAuthenticated(
            parts.extensions.get::<AuthenticatedIdentity>().cloned(),
        ))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::middleware::SecurityHeadersStep;
    use crate::pipeline::Step;
    use async_trait::async_trait;
    use axum::Router;
    use axum::body::Body;
    use axum::http::{HeaderValue, StatusCode};
    use axum::routing::get;
    use std::time::Duration;
    use tower::ServiceExt;

    struct AttachIdentity;

    #[async_trait]
    impl Step for AttachIdentity {
        fn name(&self) -> &'static str {
            "attach_identity"
        }

        async fn run(&self, ctx: &mut RequestContext) -> StepOutcome {
            ctx.identity = Some(AuthenticatedIdentity::new("u1", ["user".to_string()]));
            ctx.set_response_header(
                "x-ratelimit-limit".parse().unwrap(),
                HeaderValue::from_static("10"),
            );
            StepOutcome::Continue
        }
    }

    struct Reject;

    #[async_trait]
    impl Step for Reject {
        fn name(&self) -> &'static str {
            "reject"
        }

        async fn run(&self, _ctx: &mut RequestContext) -> StepOutcome {
            AppError::Authorization("nope".to_string()).into()
        }
    }

    async fn whoami(Authenticated(identity): Authenticated) -> String {
        identity.subject_id
    }

    async fn maybe(MaybeAuthenticated(identity): MaybeAuthenticated) -> String {
        identity.map(|i| i.subject_id).unwrap_or_else(|| "anonymous".to_string())
    }

    fn app(pipeline: Pipeline) -> Router {
        Router::new()
            .route("/whoami", get(whoami))
            .route("/maybe", get(maybe))
            .layer(axum::middleware::from_fn_with_state(pipeline, run_pipeline))
    }

    async fn body_text(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn get_req(uri: &str) -> Request {
        axum::http::Request::builder()
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_identity_reaches_handler_and_headers_merged() {
        let pipeline = Pipeline::builder(Duration::from_secs(1))
            .step(AttachIdentity)
            .step(SecurityHeadersStep)
            .build();

        let response = app(pipeline).oneshot(get_req("/whoami")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-ratelimit-limit"], "10");
        assert_eq!(response.headers()["x-content-type-options"], "nosniff");
        assert_eq!(body_text(response).await, "u1");
    }

    #[tokio::test]
    async fn test_handler_rejects_without_identity() {
        let pipeline = Pipeline::builder(Duration::from_secs(1)).build();
        let response = app(pipeline.clone()).oneshot(get_req("/whoami")).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app(pipeline).oneshot(get_req("/maybe")).await.unwrap();
        assert_eq!(body_text(response).await, "anonymous");
    }

    #[tokio::test]
    async fn test_timed_out_ownership_check_never_reaches_handler() {
        use crate::middleware::{RequireOwnership, owner_lookup};
        use axum::routing::delete;

        let lookup = owner_lookup(|_ctx: &RequestContext| async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(Some("owner".to_string()))
        });
        let pipeline = Pipeline::builder(Duration::from_millis(50))
            .step(AttachIdentity)
            .step(RequireOwnership::new(lookup))
            .build();
        let app = Router::new()
            .route("/items/{id}", delete(|| async { StatusCode::NO_CONTENT }))
            .layer(axum::middleware::from_fn_with_state(pipeline, run_pipeline));

        let request = axum::http::Request::builder()
            .method("DELETE")
            .uri("/items/1")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(body_text(response).await.contains("SERVICE_UNAVAILABLE"));
    }

    #[tokio::test]
    async fn test_matched_route_reaches_steps() {
        struct EchoRoute;

        #[async_trait]
        impl Step for EchoRoute {
            fn name(&self) -> &'static str {
                "echo_route"
            }

            async fn run(&self, ctx: &mut RequestContext) -> StepOutcome {
                ctx.set_response_header(
                    "x-route".parse().unwrap(),
                    HeaderValue::from_str(&ctx.route).unwrap(),
                );
                StepOutcome::Continue
            }
        }

        let pipeline = Pipeline::builder(Duration::from_secs(1))
            .step(EchoRoute)
            .build();
        let app = Router::new()
            .route("/items/{id}", get(|| async { "ok" }))
            .layer(axum::middleware::from_fn_with_state(pipeline, run_pipeline));

        let response = app.oneshot(get_req("/items/42")).await.unwrap();
        assert_eq!(response.headers()["x-route"], "/items/{id}");
    }

    #[tokio::test]
    async fn test_error_response_keeps_step_headers() {
        let pipeline = Pipeline::builder(Duration::from_secs(1))
            .step(SecurityHeadersStep)
            .step(Reject)
            .build();

        let response = app(pipeline).oneshot(get_req("/whoami")).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(response.headers()["x-frame-options"], "DENY");
        assert!(body_text(response).await.contains("FORBIDDEN"));
    }
}
