//! Role-based authorization steps.
//!
//! Both steps expect the authentication step to have run earlier in the same
//! pipeline; without an identity they answer 401.
//!
//! - [`RequireRoles`]: caller holds any of the listed roles (case-insensitive)
//! - [`RequireOwnership`]: caller is an admin, or owns the resource named by
//!   an injected lookup
//!
//! Unlike rate limiting, authorization fails closed: if the owner cannot be
//! looked up, or the step times out, the request is refused.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::auth::AuthenticatedIdentity;
use crate::error::{AppError, AuthFailure};
use crate::pipeline::{RequestContext, Step, StepOutcome};
use crate::store::StoreError;

/// Future returned by an [`OwnerLookup`].
pub type OwnerFuture = Pin<Box<dyn Future<Output = Result<Option<String>, StoreError>> + Send>>;

/// Resolves the owner id of the resource a request targets.
///
/// `Ok(None)` means the resource (or its owner record) does not exist.
pub type OwnerLookup = Arc<dyn Fn(&RequestContext) -> OwnerFuture + Send + Sync>;

/// Wrap an async function as an [`OwnerLookup`].
pub fn owner_lookup<F, Fut>(lookup: F) -> OwnerLookup
where
    F: Fn(&RequestContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<String>, StoreError>> + Send + 'static,
{
    Arc::new(move |ctx: &RequestContext| -> OwnerFuture { Box::pin(lookup(ctx)) })
}

fn identity(ctx: &RequestContext) -> Result<&AuthenticatedIdentity, AppError> {
    ctx.identity
        .as_ref()
        .ok_or(AppError::Authentication(AuthFailure::Missing))
}

/// Grants access when the caller holds any of `roles`.
pub struct RequireRoles {
    roles: Vec<String>,
}

impl RequireRoles {
    pub fn any_of<I, S>(roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            roles: roles.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl Step for RequireRoles {
    fn name(&self) -> &'static str {
        "require_roles"
    }

    fn fail_closed(&self) -> bool {
        true
    }

    async fn run(&self, ctx: &mut RequestContext) -> StepOutcome {
        let identity = match identity(ctx) {
            Ok(identity) => identity,
            Err(e) => return e.into(),
        };

        if identity.has_any_role(&self.roles) {
            return StepOutcome::Continue;
        }

        warn!(
            subject_id = %identity.subject_id,
            required = ?self.roles,
            path = %ctx.path,
            "Insufficient role"
        );
        AppError::Authorization("Insufficient permissions".to_string()).into()
    }
}

/// Grants access to admins and to the resource owner.
pub struct RequireOwnership {
    lookup: OwnerLookup,
}

impl RequireOwnership {
    pub fn new(lookup: OwnerLookup) -> Self {
        Self { lookup }
    }
}

#[async_trait]
impl Step for RequireOwnership {
    fn name(&self) -> &'static str {
        "require_ownership"
    }

    fn fail_closed(&self) -> bool {
        true
    }

    async fn run(&self, ctx: &mut RequestContext) -> StepOutcome {
        let identity = match identity(ctx) {
            Ok(identity) => identity,
            Err(e) => return e.into(),
        };
        if identity.is_admin() {
            debug!(subject_id = %identity.subject_id, "Admin bypasses ownership check");
            return StepOutcome::Continue;
        }

        let owner = match (self.lookup)(ctx).await {
            Ok(owner) => owner,
            Err(e) => {
                warn!(path = %ctx.path, error = %e, "Owner lookup failed, denying");
                return AppError::from(e).into();
            }
        };

        if owner.as_deref() == Some(identity.subject_id.as_str()) {
            return StepOutcome::Continue;
        }

        warn!(
            subject_id = %identity.subject_id,
            path = %ctx.path,
            "Caller does not own resource"
        );
        AppError::Authorization("You do not own this resource".to_string()).into()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::pipeline::Pipeline;
    use axum::http::{HeaderMap, Method};
    use std::time::Duration;

    fn ctx_with_roles(roles: &[&str]) -> RequestContext {
        let mut ctx = RequestContext::new(Method::DELETE, "/api/surveys/s1", HeaderMap::new());
        ctx.identity = Some(AuthenticatedIdentity::new(
            "user-1",
            roles.iter().map(|r| r.to_string()),
        ));
        ctx
    }

    fn fixed_owner(owner: Option<&'static str>) -> OwnerLookup {
        owner_lookup(move |_ctx: &RequestContext| async move { Ok(owner.map(str::to_string)) })
    }

    fn slow_owner(owner: &'static str, delay: Duration) -> OwnerLookup {
        owner_lookup(move |_ctx: &RequestContext| async move {
            tokio::time::sleep(delay).await;
            Ok(Some(owner.to_string()))
        })
    }

    fn failing_lookup() -> OwnerLookup {
        owner_lookup(|_ctx: &RequestContext| async { Err(StoreError::CircuitOpen) })
    }

    #[tokio::test]
    async fn test_role_match_is_case_insensitive() {
        for required in ["admin", "Admin", "ADMIN"] {
            let step = RequireRoles::any_of([required]);
            let mut ctx = ctx_with_roles(&["admin"]);
            assert!(matches!(step.run(&mut ctx).await, StepOutcome::Continue));

            let mut ctx = ctx_with_roles(&["user"]);
            assert!(matches!(
                step.run(&mut ctx).await,
                StepOutcome::Error(AppError::Authorization(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_any_role_grants() {
        let step = RequireRoles::any_of(["editor", "moderator"]);
        let mut ctx = ctx_with_roles(&["user", "Moderator"]);
        assert!(matches!(step.run(&mut ctx).await, StepOutcome::Continue));
    }

    #[tokio::test]
    async fn test_no_identity_is_unauthenticated() {
        let step = RequireRoles::any_of(["user"]);
        let mut ctx = RequestContext::new(Method::GET, "/", HeaderMap::new());
        assert!(matches!(
            step.run(&mut ctx).await,
            StepOutcome::Error(AppError::Authentication(AuthFailure::Missing))
        ));
    }

    #[tokio::test]
    async fn test_owner_allowed_others_denied() {
        let step = RequireOwnership::new(fixed_owner(Some("user-1")));
        let mut ctx = ctx_with_roles(&["user"]);
        assert!(matches!(step.run(&mut ctx).await, StepOutcome::Continue));

        let step = RequireOwnership::new(fixed_owner(Some("user-2")));
        let mut ctx = ctx_with_roles(&["user"]);
        assert!(matches!(
            step.run(&mut ctx).await,
            StepOutcome::Error(AppError::Authorization(_))
        ));

        let step = RequireOwnership::new(fixed_owner(None));
        let mut ctx = ctx_with_roles(&["user"]);
        assert!(matches!(
            step.run(&mut ctx).await,
            StepOutcome::Error(AppError::Authorization(_))
        ));
    }

    #[tokio::test]
    async fn test_admin_bypasses_lookup() {
        let step = RequireOwnership::new(failing_lookup());
        let mut ctx = ctx_with_roles(&["ADMIN"]);
        assert!(matches!(step.run(&mut ctx).await, StepOutcome::Continue));
    }

    #[tokio::test]
    async fn test_slow_owner_lookup_refuses_in_pipeline() {
        let pipeline = Pipeline::builder(Duration::from_millis(50))
            .step(RequireOwnership::new(slow_owner(
                "user-2",
                Duration::from_millis(200),
            )))
            .build();

        let mut ctx = ctx_with_roles(&["user"]);
        assert!(matches!(
            pipeline.execute(&mut ctx).await,
            StepOutcome::Error(AppError::ServiceUnavailable(_))
        ));
    }

    #[test]
    fn test_authorization_steps_fail_closed() {
        assert!(RequireRoles::any_of(["admin"]).fail_closed());
        assert!(RequireOwnership::new(fixed_owner(None)).fail_closed());
    }

    #[tokio::test]
    async fn test_lookup_failure_denies() {
        let step = RequireOwnership::new(failing_lookup());
        let mut ctx = ctx_with_roles(&["user"]);
        assert!(matches!(
            step.run(&mut ctx).await,
            StepOutcome::Error(AppError::ServiceUnavailable(_))
        ));
    }
}
