//! External identity verification.
//!
//! Tokens not issued by this service are handed to an [`IdentityVerifier`].
//! The production implementation checks RS256 signatures against the
//! provider's JWKS document; the key set is cached and refetched when a token
//! names a key id that is not in the cache (provider key rotation).

use std::time::Duration;

use async_trait::async_trait;
use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, decode_header};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument};

use super::VerifiedSubject;
use crate::error::AuthFailure;

/// Failure reported by an identity verifier.
///
/// Verifiers describe failures in free text; [`IdentityVerificationError::reason`]
/// maps the message onto an [`AuthFailure`].
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct IdentityVerificationError {
    pub message: String,
}

impl IdentityVerificationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn reason(&self) -> AuthFailure {
        let message = self.message.to_lowercase();
        if message.contains("expired") {
            AuthFailure::Expired
        } else if ["malformed", "decod", "argument", "format"]
            .iter()
            .any(|needle| message.contains(needle))
        {
            AuthFailure::Malformed
        } else {
            AuthFailure::Invalid
        }
    }
}

/// Verifies tokens issued by an external identity provider.
#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<VerifiedSubject, IdentityVerificationError>;
}

/// Used when no identity provider is configured: every external token fails.
pub struct DisabledIdentityVerifier;

#[async_trait]
impl IdentityVerifier for DisabledIdentityVerifier {
    async fn verify(&self, _token: &str) -> Result<VerifiedSubject, IdentityVerificationError> {
        Err(IdentityVerificationError::new(
            "identity provider not configured",
        ))
    }
}

#[derive(Debug, Deserialize)]
struct ExternalClaims {
    sub: String,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    email_verified: bool,
}

/// RS256 verifier backed by a remote JWKS document.
pub struct JwksIdentityVerifier {
    http: reqwest::Client,
    jwks_url: String,
    issuer: String,
    audience: String,
    keys: RwLock<Option<JwkSet>>,
}

impl JwksIdentityVerifier {
    pub fn new(
        jwks_url: impl Into<String>,
        issuer: impl Into<String>,
        audience: impl Into<String>,
        fetch_timeout: Duration,
    ) -> Result<Self, IdentityVerificationError> {
        let http = reqwest::Client::builder()
            .timeout(fetch_timeout)
            .build()
            .map_err(|e| IdentityVerificationError::new(format!("http client: {e}")))?;

        Ok(Self {
            http,
            jwks_url: jwks_url.into(),
            issuer: issuer.into(),
            audience: audience.into(),
            keys: RwLock::new(None),
        })
    }

    async fn fetch_keys(&self) -> Result<JwkSet, IdentityVerificationError> {
        let response = self
            .http
            .get(&self.jwks_url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| IdentityVerificationError::new(format!("key fetch failed: {e}")))?;

        let set = response
            .json::<JwkSet>()
            .await
            .map_err(|e| IdentityVerificationError::new(format!("key set decode failed: {e}")))?;

        info!(url = %self.jwks_url, keys = set.keys.len(), "Fetched identity provider keys");
        Ok(set)
    }

    /// Key for `kid`, refreshing the cache once if it is unknown.
    async fn decoding_key(&self, kid: &str) -> Result<DecodingKey, IdentityVerificationError> {
        if let Some(set) = self.keys.read().await.as_ref()
            && let Some(jwk) = set.find(kid)
        {
            return DecodingKey::from_jwk(jwk)
                .map_err(|e| IdentityVerificationError::new(format!("unusable key: {e}")));
        }

        debug!(kid, "Unknown key id, refreshing key set");
        let set = self.fetch_keys().await?;
        let key = set
            .find(kid)
            .ok_or_else(|| IdentityVerificationError::new(format!("no key for kid {kid}")))
            .and_then(|jwk| {
                DecodingKey::from_jwk(jwk)
                    .map_err(|e| IdentityVerificationError::new(format!("unusable key: {e}")))
            });
        *self.keys.write().await = Some(set);
        key
    }
}

#[async_trait]
impl IdentityVerifier for JwksIdentityVerifier {
    #[instrument(skip_all)]
    async fn verify(&self, token: &str) -> Result<VerifiedSubject, IdentityVerificationError> {
        let header = decode_header(token)
            .map_err(|e| IdentityVerificationError::new(format!("malformed token header: {e}")))?;
        if header.alg != Algorithm::RS256 {
            return Err(IdentityVerificationError::new(format!(
                "unexpected signing algorithm {:?}",
                header.alg
            )));
        }
        let kid = header
            .kid
            .ok_or_else(|| IdentityVerificationError::new("malformed token: no key id"))?;

        let key = self.decoding_key(&kid).await?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_issuer(&[&self.issuer]);
        validation.set_audience(&[&self.audience]);

        let data = decode::<ExternalClaims>(token, &key, &validation).map_err(|e| {
            use jsonwebtoken::errors::ErrorKind;
            match e.kind() {
                ErrorKind::ExpiredSignature => IdentityVerificationError::new("token expired"),
                ErrorKind::InvalidToken
                | ErrorKind::Base64(_)
                | ErrorKind::Json(_)
                | ErrorKind::Utf8(_) => {
                    IdentityVerificationError::new(format!("malformed token: {e}"))
                }
                _ => IdentityVerificationError::new(format!("verification failed: {e}")),
            }
        })?;

        let claims = data.claims;
        Ok(VerifiedSubject {
            subject_id: claims.sub,
            email: claims.email,
            email_verified: claims.email_verified,
        })
    }
}
