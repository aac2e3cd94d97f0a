//! Pipeline step resolving the bearer credential into an identity.

use std::sync::Arc;

use async_trait::async_trait;
use axum::http::header;

use crate::auth::{AuthMode, Authenticator};
use crate::error::AppError;
use crate::pipeline::{RequestContext, Step, StepOutcome};

pub struct AuthenticateStep {
    authenticator: Arc<Authenticator>,
    mode: AuthMode,
}

impl AuthenticateStep {
    pub fn required(authenticator: Arc<Authenticator>) -> Self {
        Self {
            authenticator,
            mode: AuthMode::Required,
        }
    }

    pub fn optional(authenticator: Arc<Authenticator>) -> Self {
        Self {
            authenticator,
            mode: AuthMode::Optional,
        }
    }
}

#[async_trait]
impl Step for AuthenticateStep {
    fn name(&self) -> &'static str {
        match self.mode {
            AuthMode::Required => "authenticate",
            AuthMode::Optional => "authenticate_optional",
        }
    }

    async fn run(&self, ctx: &mut RequestContext) -> StepOutcome {
        let authorization = ctx.header(header::AUTHORIZATION.as_str());

        match self.mode {
            AuthMode::Required => match self.authenticator.authenticate(authorization).await {
                Ok(identity) => {
                    ctx.identity = Some(identity);
                    StepOutcome::Continue
                }
                Err(failure) => AppError::Authentication(failure).into(),
            },
            AuthMode::Optional => {
                ctx.identity = self.authenticator.authenticate_optional(authorization).await;
                StepOutcome::Continue
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::auth::{
        DisabledIdentityVerifier, PlatformTokens, PermissionsRecord, ProfileDirectory,
        UserProfile,
    };
    use crate::error::AuthFailure;
    use crate::store::StoreError;
    use axum::http::{HeaderMap, Method};
    use std::time::Duration;

    struct EmptyDirectory;

    #[async_trait]
    impl ProfileDirectory for EmptyDirectory {
        async fn permissions(&self, _: &str) -> Result<Option<PermissionsRecord>, StoreError> {
            Ok(None)
        }

        async fn profile(&self, _: &str) -> Result<Option<UserProfile>, StoreError> {
            Ok(None)
        }
    }

    fn authenticator() -> Arc<Authenticator> {
        Arc::new(Authenticator::new(
            Arc::new(PlatformTokens::new(
                "step-test-secret-that-is-long-enough",
                "api-gatekeeper",
                Duration::from_secs(60),
            )),
            Arc::new(DisabledIdentityVerifier),
            Arc::new(EmptyDirectory),
        ))
    }

    fn ctx(authorization: Option<&str>) -> RequestContext {
        let mut headers = HeaderMap::new();
        if let Some(value) = authorization {
            headers.insert(header::AUTHORIZATION, value.parse().unwrap());
        }
        RequestContext::new(Method::GET, "/api/me", headers)
    }

    #[tokio::test]
    async fn test_required_attaches_identity() {
        let auth = authenticator();
        let token = auth.tokens().issue("u1", "u1@x", true).unwrap().token;
        let step = AuthenticateStep::required(auth);

        let mut ctx = ctx(Some(&format!("Bearer {token}")));
        assert!(matches!(step.run(&mut ctx).await, StepOutcome::Continue));
        assert_eq!(ctx.identity.unwrap().subject_id, "u1");
    }

    #[tokio::test]
    async fn test_required_rejects_missing() {
        let step = AuthenticateStep::required(authenticator());
        let mut ctx = ctx(None);
        assert!(matches!(
            step.run(&mut ctx).await,
            StepOutcome::Error(AppError::Authentication(AuthFailure::Missing))
        ));
        assert!(ctx.identity.is_none());
    }

    #[tokio::test]
    async fn test_optional_continues_anonymously() {
        let step = AuthenticateStep::optional(authenticator());
        for header in [None, Some("Bearer junk")] {
            let mut ctx = ctx(header);
            assert!(matches!(step.run(&mut ctx).await, StepOutcome::Continue));
            assert!(ctx.identity.is_none());
        }
    }
}
