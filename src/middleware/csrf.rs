//! Double-submit CSRF protection.
//!
//! The client obtains a token from `GET /api/csrf-token`, which sets it in the
//! `csrf-token` cookie. For every state-changing request it must echo the same
//! value in the `x-csrf-token` header. A cross-site attacker can make the
//! browser send the cookie but cannot read it to forge the header.
//!
//! The cookie is readable by scripts (no `HttpOnly`) since the client
//! has to copy it into the header.
//!
//! Requests signed by an external webhook sender (`x-webhook-signature`) are
//! authenticated by that signature instead and skip this check.

use std::time::Duration;

use async_trait::async_trait;
use axum::http::{HeaderMap, header};
use subtle::ConstantTimeEq;
use tracing::warn;

use crate::error::{AppError, CsrfFailure};
use crate::metrics;
use crate::pipeline::{RequestContext, Step, StepOutcome};

pub const CSRF_COOKIE: &str = "csrf-token";
pub const CSRF_HEADER: &str = "x-csrf-token";
pub const WEBHOOK_SIGNATURE_HEADER: &str = "x-webhook-signature";

/// Token length in bytes before hex encoding.
const TOKEN_BYTES: usize = 32;

/// Fresh 256-bit token, hex-encoded.
pub fn issue_token() -> String {
    let bytes: [u8; TOKEN_BYTES] = rand::random();
    hex::encode(bytes)
}

/// `Set-Cookie` value delivering `token`.
pub fn set_cookie_value(token: &str, max_age: Duration, secure: bool) -> String {
    let mut cookie = format!(
        "{CSRF_COOKIE}={token}; Max-Age={}; Path=/; SameSite=Strict",
        max_age.as_secs()
    );
    if secure {
        cookie.push_str("; Secure");
    }
    cookie
}

/// Value of cookie `name` across all `Cookie` headers.
pub fn cookie_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| key.trim() == name)
        .map(|(_, value)| value.trim())
        .filter(|value| !value.is_empty())
}

/// Compare the cookie and header tokens.
pub fn validate(headers: &HeaderMap) -> Result<(), CsrfFailure> {
    let cookie = cookie_value(headers, CSRF_COOKIE);
    let header = headers
        .get(CSRF_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty());

    let (Some(cookie), Some(header)) = (cookie, header) else {
        return Err(CsrfFailure::Missing);
    };

    if bool::from(cookie.as_bytes().ct_eq(header.as_bytes())) {
        Ok(())
    } else {
        Err(CsrfFailure::Invalid)
    }
}

/// Pipeline step validating the double-submit pair on state-changing requests.
pub struct CsrfStep;

#[async_trait]
impl Step for CsrfStep {
    fn name(&self) -> &'static str {
        "csrf"
    }

    async fn run(&self, ctx: &mut RequestContext) -> StepOutcome {
        if !ctx.is_state_changing() || ctx.headers.contains_key(WEBHOOK_SIGNATURE_HEADER) {
            return StepOutcome::Continue;
        }

        match validate(&ctx.headers) {
            Ok(()) => StepOutcome::Continue,
            Err(failure) => {
                let error = AppError::Csrf(failure);
                warn!(
                    method = %ctx.method,
                    path = %ctx.path,
                    code = error.code(),
                    "CSRF validation failed"
                );
                metrics::record_csrf_rejection(error.code());
                error.into()
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::http::Method;

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(*name, value.parse().unwrap());
        }
        map
    }

    #[test]
    fn test_token_is_256_bit_hex() {
        let a = issue_token();
        let b = issue_token();
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn test_cookie_attributes() {
        let cookie = set_cookie_value("abc", Duration::from_secs(3600), true);
        assert_eq!(
            cookie,
            "csrf-token=abc; Max-Age=3600; Path=/; SameSite=Strict; Secure"
        );
        assert!(!cookie.contains("HttpOnly"));

        let cookie = set_cookie_value("abc", Duration::from_secs(60), false);
        assert!(!cookie.contains("Secure"));
    }

    #[test]
    fn test_cookie_parsing() {
        let h = headers(&[
            ("cookie", "session=1; csrf-token=tok123 ; theme=dark"),
            ("cookie", "other=2"),
        ]);
        assert_eq!(cookie_value(&h, "csrf-token"), Some("tok123"));
        assert_eq!(cookie_value(&h, "other"), Some("2"));
        assert_eq!(cookie_value(&h, "missing"), None);

        let h = headers(&[("cookie", "csrf-token=")]);
        assert_eq!(cookie_value(&h, "csrf-token"), None);
    }

    #[test]
    fn test_validate() {
        assert_eq!(validate(&HeaderMap::new()), Err(CsrfFailure::Missing));
        assert_eq!(
            validate(&headers(&[("cookie", "csrf-token=a")])),
            Err(CsrfFailure::Missing)
        );
        assert_eq!(
            validate(&headers(&[("x-csrf-token", "a")])),
            Err(CsrfFailure::Missing)
        );
        assert_eq!(
            validate(&headers(&[("cookie", "csrf-token=a"), ("x-csrf-token", "b")])),
            Err(CsrfFailure::Invalid)
        );
        assert_eq!(
            validate(&headers(&[("cookie", "csrf-token=ab"), ("x-csrf-token", "a")])),
            Err(CsrfFailure::Invalid)
        );
        assert_eq!(
            validate(&headers(&[("cookie", "csrf-token=a"), ("x-csrf-token", "a")])),
            Ok(())
        );
    }

    #[tokio::test]
    async fn test_safe_methods_skip_check() {
        for method in [Method::GET, Method::HEAD, Method::OPTIONS] {
            let mut ctx = RequestContext::new(method, "/", HeaderMap::new());
            assert!(matches!(CsrfStep.run(&mut ctx).await, StepOutcome::Continue));
        }
    }

    #[tokio::test]
    async fn test_state_changing_methods_checked() {
        for method in [Method::POST, Method::PUT, Method::PATCH, Method::DELETE] {
            let mut ctx = RequestContext::new(method.clone(), "/", HeaderMap::new());
            assert!(
                matches!(
                    CsrfStep.run(&mut ctx).await,
                    StepOutcome::Error(AppError::Csrf(CsrfFailure::Missing))
                ),
                "{method}"
            );
        }
    }

    #[tokio::test]
    async fn test_webhook_signature_bypasses() {
        let mut ctx = RequestContext::new(
            Method::POST,
            "/api/webhooks/billing",
            headers(&[("x-webhook-signature", "t=1,v1=abc")]),
        );
        assert!(matches!(CsrfStep.run(&mut ctx).await, StepOutcome::Continue));
    }
}
