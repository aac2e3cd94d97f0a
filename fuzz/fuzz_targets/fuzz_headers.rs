//! Fuzz testing for request header and token parsing.
//!
//! Everything here runs on attacker-controlled input before any credential
//! is checked, so none of it may panic:
//!
//! - `bearer_token`: `Authorization` header parsing
//! - `peek_issuer`: unverified issuer extraction used for token routing
//! - `cookie_value` / `csrf::validate`: `Cookie` and `X-CSRF-Token` parsing
//! - `CidrRange::parse`: trusted proxy configuration entries
//! - `client_ip`: `X-Forwarded-For` / `X-Real-IP` resolution
//!
//! # Running the Fuzz Tests
//!
//! ```bash
//! # Install cargo-fuzz (requires nightly)
//! cargo +nightly install cargo-fuzz
//!
//! # Run the header fuzz target
//! cargo +nightly fuzz run fuzz_headers
//!
//! # Run with a time limit (e.g., 60 seconds)
//! cargo +nightly fuzz run fuzz_headers -- -max_total_time=60
//! ```

#![no_main]

use std::net::SocketAddr;

use api_gatekeeper::auth::{bearer_token, peek_issuer};
use api_gatekeeper::middleware::csrf::{self, CSRF_COOKIE};
use api_gatekeeper::middleware::ip::{CidrRange, TrustedProxyConfig, client_ip};
use axum::http::{HeaderMap, HeaderValue, header};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(s) = std::str::from_utf8(data) else {
        return;
    };

    if let Some(token) = bearer_token(s) {
        let _ = peek_issuer(token);
    }
    let _ = peek_issuer(s);

    let _ = CidrRange::parse(s);

    let Ok(value) = HeaderValue::from_str(s) else {
        return;
    };

    let mut headers = HeaderMap::new();
    headers.insert(header::COOKIE, value.clone());
    headers.insert(csrf::CSRF_HEADER, value.clone());
    headers.insert("x-forwarded-for", value.clone());
    headers.insert("x-real-ip", value);

    let _ = csrf::cookie_value(&headers, CSRF_COOKIE);
    let _ = csrf::validate(&headers);

    let peer = SocketAddr::from(([10, 0, 0, 1], 443));
    let trusted = TrustedProxyConfig::new(&["10.0.0.0/8".to_string()]);
    let _ = client_ip(&headers, Some(peer), &trusted);
    let _ = client_ip(&headers, None, &TrustedProxyConfig::default());
});
