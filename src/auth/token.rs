//! Platform-issued (self-signed) tokens.
//!
//! HS256 with a shared secret. Required claims: `sub`, `uid`, `email`, `iat`,
//! `exp`, `iss`.

use std::time::Duration;

use chrono::Utc;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};

use crate::error::AuthFailure;

/// Claims carried by platform tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformClaims {
    pub sub: String,
    pub uid: String,
    pub email: String,
    pub iat: i64,
    pub exp: i64,
    pub iss: String,
    #[serde(default)]
    pub email_verified: bool,
}

/// A freshly signed token.
#[derive(Debug, Clone, Serialize)]
pub struct IssuedToken {
    pub token: String,
    pub expires_in: u64,
}

/// Signs and verifies platform tokens.
pub struct PlatformTokens {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    issuer: String,
    ttl: Duration,
}

impl PlatformTokens {
    pub fn new(secret: &str, issuer: impl Into<String>, ttl: Duration) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            issuer: issuer.into(),
            ttl,
        }
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// Sign a token for `uid` valid for the configured TTL.
    pub fn issue(
        &self,
        uid: &str,
        email: &str,
        email_verified: bool,
    ) -> Result<IssuedToken, jsonwebtoken::errors::Error> {
        let now = Utc::now().timestamp();
        let ttl_secs = self.ttl.as_secs();
        let claims = PlatformClaims {
            sub: uid.to_string(),
            uid: uid.to_string(),
            email: email.to_string(),
            iat: now,
            exp: now.saturating_add(i64::try_from(ttl_secs).unwrap_or(i64::MAX)),
            iss: self.issuer.clone(),
            email_verified,
        };

        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)?;
        Ok(IssuedToken {
            token,
            expires_in: ttl_secs,
        })
    }

    /// Verify signature, expiry and issuer.
    pub fn verify(&self, token: &str) -> Result<PlatformClaims, AuthFailure> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[&self.issuer]);
        validation.set_required_spec_claims(&["exp", "iss", "sub"]);
        validation.leeway = 0;

        decode::<PlatformClaims>(token, &self.decoding_key, &validation)
            .map(|data| data.claims)
            .map_err(|e| classify(e.kind()))
    }
}

fn classify(kind: &ErrorKind) -> AuthFailure {
    match kind {
        ErrorKind::ExpiredSignature => AuthFailure::Expired,
        ErrorKind::InvalidToken
        | ErrorKind::Base64(_)
        | ErrorKind::Json(_)
        | ErrorKind::Utf8(_)
        | ErrorKind::MissingRequiredClaim(_) => AuthFailure::Malformed,
        _ => AuthFailure::Invalid,
    }
}

#[derive(Deserialize)]
struct IssuerOnly {
    #[serde(default)]
    iss: Option<String>,
}

/// Read the `iss` claim without checking the signature.
///
/// Only used to route a token to the right verifier; the chosen verifier
/// then checks everything. `None` if the token is not a decodable JWT.
pub fn peek_issuer(token: &str) -> Option<String> {
    let mut validation = Validation::default();
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();

    decode::<IssuerOnly>(token, &DecodingKey::from_secret(&[]), &validation)
        .ok()
        .and_then(|data| data.claims.iss)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    const SECRET: &str = "test-secret-at-least-thirty-two-bytes!!";

    fn tokens() -> PlatformTokens {
        PlatformTokens::new(SECRET, "api-gatekeeper", Duration::from_secs(600))
    }

    fn sign(claims: serde_json::Value, secret: &str) -> String {
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn test_issue_then_verify() {
        let tokens = tokens();
        let issued = tokens.issue("user-1", "a@example.com", true).unwrap();
        assert_eq!(issued.expires_in, 600);

        let claims = tokens.verify(&issued.token).unwrap();
        assert_eq!(claims.uid, "user-1");
        assert_eq!(claims.sub, "user-1");
        assert_eq!(claims.email, "a@example.com");
        assert!(claims.email_verified);
        assert_eq!(peek_issuer(&issued.token).as_deref(), Some("api-gatekeeper"));
    }

    #[test]
    fn test_expired_token() {
        let now = Utc::now().timestamp();
        let token = sign(
            json!({"sub": "u", "uid": "u", "email": "e@x", "iat": now - 100, "exp": now - 50, "iss": "api-gatekeeper"}),
            SECRET,
        );
        assert_eq!(tokens().verify(&token).unwrap_err(), AuthFailure::Expired);
    }

    #[test]
    fn test_wrong_secret_is_invalid() {
        let now = Utc::now().timestamp();
        let token = sign(
            json!({"sub": "u", "uid": "u", "email": "e@x", "iat": now, "exp": now + 60, "iss": "api-gatekeeper"}),
            "some-other-secret",
        );
        assert_eq!(tokens().verify(&token).unwrap_err(), AuthFailure::Invalid);
    }

    #[test]
    fn test_missing_claim_is_malformed() {
        let now = Utc::now().timestamp();
        let token = sign(
            json!({"sub": "u", "iat": now, "exp": now + 60, "iss": "api-gatekeeper"}),
            SECRET,
        );
        assert_eq!(tokens().verify(&token).unwrap_err(), AuthFailure::Malformed);
    }

    #[test]
    fn test_garbage_is_malformed() {
        assert_eq!(
            tokens().verify("not-a-jwt").unwrap_err(),
            AuthFailure::Malformed
        );
        assert_eq!(peek_issuer("not-a-jwt"), None);
    }

    #[test]
    fn test_peek_issuer_ignores_signature_and_expiry() {
        let token = sign(
            json!({"iss": "https://idp.example.com", "aud": "app", "exp": 1}),
            "unrelated",
        );
        assert_eq!(
            peek_issuer(&token).as_deref(),
            Some("https://idp.example.com")
        );

        let token = sign(json!({"sub": "no-issuer"}), "unrelated");
        assert_eq!(peek_issuer(&token), None);
    }
}
