//! Per-request state shared between pipeline steps.

use std::net::SocketAddr;

use axum::http::{HeaderMap, HeaderName, HeaderValue, Method};

use crate::auth::AuthenticatedIdentity;

/// What steps may read about the request, and the only place they may leave
/// state for later steps.
///
/// Created fresh for every request; nothing here outlives it.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub method: Method,
    pub path: String,
    /// Route template the path matched, e.g. `/api/surveys/{id}`. Equal to
    /// `path` outside a router.
    pub route: String,
    pub headers: HeaderMap,
    /// Socket address of the immediate peer, when the server recorded it.
    pub peer: Option<SocketAddr>,
    pub request_id: String,
    /// Set by the authentication step.
    pub identity: Option<AuthenticatedIdentity>,
    /// Headers merged into whatever response ends the request.
    pub response_headers: HeaderMap,
}

impl RequestContext {
    pub fn new(method: Method, path: impl Into<String>, headers: HeaderMap) -> Self {
        let path = path.into();
        Self {
            method,
            route: path.clone(),
            path,
            headers,
            peer: None,
            request_id: String::new(),
            identity: None,
            response_headers: HeaderMap::new(),
        }
    }

    pub fn with_route(mut self, route: impl Into<String>) -> Self {
        self.route = route.into();
        self
    }

    pub fn with_peer(mut self, peer: Option<SocketAddr>) -> Self {
        self.peer = peer;
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }

    /// Header value as UTF-8, ignoring values that are not.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Whether the method can change server state.
    pub fn is_state_changing(&self) -> bool {
        matches!(
            self.method,
            Method::POST | Method::PUT | Method::PATCH | Method::DELETE
        )
    }

    /// `n`-th non-empty path segment, e.g. `segment(2)` of `/api/surveys/42` is `42`.
    pub fn segment(&self, n: usize) -> Option<&str> {
        self.path.split('/').filter(|s| !s.is_empty()).nth(n)
    }

    pub fn set_response_header(&mut self, name: HeaderName, value: HeaderValue) {
        self.response_headers.insert(name, value);
    }

    /// Add a value without replacing earlier ones (e.g. `Vary`, `Set-Cookie`).
    pub fn append_response_header(&mut self, name: HeaderName, value: HeaderValue) {
        self.response_headers.append(name, value);
    }
}
