//! Dual-mode bearer authentication.
//!
//! A bearer credential is one of two kinds, told apart by its `iss` claim
//! (read without verifying the signature):
//!
//! - **Platform tokens** (`iss` == configured platform issuer): HS256 tokens
//!   this service signed itself, verified with the shared secret.
//! - **External identity tokens** (any other issuer): handed to the
//!   [`IdentityVerifier`] and nothing else.
//!
//! A token is only ever checked by one of the two verifiers.
//!
//! After verification the role set is resolved through the
//! [`ProfileDirectory`]:
//!
//! 1. `permissions:{uid}` roles, if present and non-empty
//! 2. else the profile's `role` field (string or list)
//! 3. else [`BASE_ROLE`]
//!
//! Directory failures never fail authentication: the caller gets the base role
//! and a warning is logged. A profile with `blocked: true` is rejected with
//! [`AuthFailure::Blocked`].

mod directory;
mod identity;
mod token;

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use crate::error::AuthFailure;
use crate::metrics;

pub use directory::{
    PermissionsRecord, ProfileDirectory, RoleField, StoreProfileDirectory, UserProfile,
};
pub use identity::{
    DisabledIdentityVerifier, IdentityVerificationError, IdentityVerifier, JwksIdentityVerifier,
};
pub use token::{IssuedToken, PlatformClaims, PlatformTokens, peek_issuer};

/// Role granted when no role record exists (or lookup failed).
pub const BASE_ROLE: &str = "user";

/// Role that passes every role and ownership check.
pub const ADMIN_ROLE: &str = "admin";

/// The caller, as resolved for this request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthenticatedIdentity {
    pub subject_id: String,
    pub email: Option<String>,
    /// Lower-cased role names.
    pub roles: BTreeSet<String>,
    pub email_verified: bool,
}

impl AuthenticatedIdentity {
    pub fn new(subject_id: impl Into<String>, roles: impl IntoIterator<Item = String>) -> Self {
        Self {
            subject_id: subject_id.into(),
            email: None,
            roles: normalize_roles(roles),
            email_verified: false,
        }
    }

    /// Case-insensitive role membership.
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.contains(&role.trim().to_lowercase())
    }

    /// True if the caller holds at least one of `roles`.
    pub fn has_any_role<S: AsRef<str>>(&self, roles: &[S]) -> bool {
        roles.iter().any(|r| self.has_role(r.as_ref()))
    }

    pub fn is_admin(&self) -> bool {
        self.has_role(ADMIN_ROLE)
    }
}

/// Result of verifying a credential, before role resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedSubject {
    pub subject_id: String,
    pub email: Option<String>,
    pub email_verified: bool,
}

/// Whether a missing or bad credential rejects the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    Required,
    /// Attach an identity when possible, otherwise continue anonymously.
    Optional,
}

fn normalize_roles(roles: impl IntoIterator<Item = String>) -> BTreeSet<String> {
    roles
        .into_iter()
        .map(|r| r.trim().to_lowercase())
        .filter(|r| !r.is_empty())
        .collect()
}

/// Token from an `Authorization: Bearer <token>` value.
pub fn bearer_token(authorization: &str) -> Option<&str> {
    let (scheme, token) = authorization.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

/// Resolves bearer credentials into identities.
pub struct Authenticator {
    tokens: Arc<PlatformTokens>,
    verifier: Arc<dyn IdentityVerifier>,
    directory: Arc<dyn ProfileDirectory>,
}

impl Authenticator {
    pub fn new(
        tokens: Arc<PlatformTokens>,
        verifier: Arc<dyn IdentityVerifier>,
        directory: Arc<dyn ProfileDirectory>,
    ) -> Self {
        Self {
            tokens,
            verifier,
            directory,
        }
    }

    pub fn tokens(&self) -> &PlatformTokens {
        &self.tokens
    }

    /// Resolve the `Authorization` header value into an identity.
    pub async fn authenticate(
        &self,
        authorization: Option<&str>,
    ) -> Result<AuthenticatedIdentity, AuthFailure> {
        let result = self.resolve(authorization).await;
        if let Err(failure) = &result {
            metrics::record_auth_failure(failure.code());
            debug!(reason = %failure, "Authentication failed");
        }
        result
    }

    /// Like [`authenticate`](Self::authenticate) but any failure yields `None`.
    pub async fn authenticate_optional(
        &self,
        authorization: Option<&str>,
    ) -> Option<AuthenticatedIdentity> {
        authorization?;
        match self.resolve(authorization).await {
            Ok(identity) => Some(identity),
            Err(failure) => {
                debug!(reason = %failure, "Optional authentication failed, continuing anonymously");
                None
            }
        }
    }

    async fn resolve(
        &self,
        authorization: Option<&str>,
    ) -> Result<AuthenticatedIdentity, AuthFailure> {
        let token = authorization
            .and_then(bearer_token)
            .ok_or(AuthFailure::Missing)?;

        let subject = self.verify(token).await?;
        let profile = self.lookup_profile(&subject.subject_id).await;

        if profile.as_ref().is_some_and(|p| p.blocked) {
            warn!(subject_id = %subject.subject_id, "Blocked account attempted access");
            return Err(AuthFailure::Blocked);
        }

        let roles = self.resolve_roles(&subject.subject_id, profile).await;

        Ok(AuthenticatedIdentity {
            subject_id: subject.subject_id,
            email: subject.email,
            roles,
            email_verified: subject.email_verified,
        })
    }

    /// Route the token to exactly one verifier by its issuer claim.
    async fn verify(&self, token: &str) -> Result<VerifiedSubject, AuthFailure> {
        let issuer = peek_issuer(token);

        // A token that does not even decode never reaches a verifier.
        if issuer.is_none() && jsonwebtoken::decode_header(token).is_err() {
            return Err(AuthFailure::Malformed);
        }

        if issuer.as_deref() == Some(self.tokens.issuer()) {
            let claims = self.tokens.verify(token)?;
            return Ok(VerifiedSubject {
                subject_id: claims.uid,
                email: Some(claims.email),
                email_verified: claims.email_verified,
            });
        }

        self.verifier
            .verify(token)
            .await
            .map_err(|e| e.reason())
    }

    async fn lookup_profile(&self, subject_id: &str) -> Option<UserProfile> {
        match self.directory.profile(subject_id).await {
            Ok(profile) => profile,
            Err(e) => {
                warn!(subject_id, error = %e, "Profile lookup failed, ignoring");
                None
            }
        }
    }

    async fn resolve_roles(
        &self,
        subject_id: &str,
        profile: Option<UserProfile>,
    ) -> BTreeSet<String> {
        let base = || BTreeSet::from([BASE_ROLE.to_string()]);

        match self.directory.permissions(subject_id).await {
            Ok(Some(record)) if !record.roles.is_empty() => {
                let roles = normalize_roles(record.roles);
                if roles.is_empty() { base() } else { roles }
            }
            Ok(_) => {
                let roles = normalize_roles(
                    profile
                        .and_then(|p| p.role)
                        .map(RoleField::into_roles)
                        .unwrap_or_default(),
                );
                if roles.is_empty() { base() } else { roles }
            }
            Err(e) => {
                warn!(subject_id, error = %e, "Role lookup failed, granting base role");
                base()
            }
        }
    }
}
