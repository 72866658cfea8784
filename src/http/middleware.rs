//! Rate limiting middleware for axum routers.
//!
//! The middleware derives the caller identity and the normalized endpoint
//! from the request, asks the [`RateLimiter`] for a decision, and either
//! forwards the request or answers `429 Too Many Requests`.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json, Router,
};
use serde_json::json;
use tracing::debug;

use crate::ratelimit::{Decision, RateLimiter};

/// Header carrying the original client address behind a proxy.
pub const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";

/// Identity used when neither a forwarded address nor a peer address is known.
pub const UNKNOWN_CLIENT: &str = "unknown";

/// Maps a request path to the endpoint key used for rate limiting.
pub type PathSanitizer = fn(&str) -> String;

/// Keep only the first path segment: `/ping/abc?x=1` becomes `/ping`.
pub fn first_path_segment(path: &str) -> String {
    let path = path.split(['?', '#']).next().unwrap_or_default();
    let segment = path
        .trim()
        .trim_start_matches('/')
        .split('/')
        .next()
        .unwrap_or_default();
    format!("/{segment}")
}

/// Resolve the caller identity from `X-Forwarded-For`, falling back to the peer address.
///
/// The header is client-controlled. It only identifies callers when the
/// service sits behind a proxy you control that overwrites it; exposed
/// directly, a caller can rotate the header to get a fresh budget per request.
pub fn client_identity(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    let forwarded = headers
        .get(FORWARDED_FOR_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty());

    match (forwarded, peer) {
        (Some(client), _) => client.to_string(),
        (None, Some(addr)) => addr.ip().to_string(),
        (None, None) => UNKNOWN_CLIENT.to_string(),
    }
}

/// Shared state handed to [`rate_limit_middleware`].
#[derive(Clone)]
pub struct RateLimitState {
    limiter: Arc<RateLimiter>,
    sanitizer: PathSanitizer,
}

impl RateLimitState {
    /// Create state that normalizes paths with [`first_path_segment`].
    pub fn new(limiter: Arc<RateLimiter>) -> Self {
        Self {
            limiter,
            sanitizer: first_path_segment,
        }
    }

    /// Use a different path normalization.
    pub fn with_sanitizer(mut self, sanitizer: PathSanitizer) -> Self {
        self.sanitizer = sanitizer;
        self
    }
}

/// Response returned to rejected callers.
pub fn rate_limit_exceeded_response() -> Response {
    (
        StatusCode::TOO_MANY_REQUESTS,
        Json(json!({ "error": "Rate limit exceeded" })),
    )
        .into_response()
}

/// axum middleware applying the rate limiter to every request.
pub async fn rate_limit_middleware(
    State(state): State<RateLimitState>,
    request: Request,
    next: Next,
) -> Response {
    let endpoint = (state.sanitizer)(request.uri().path());
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let user_id = client_identity(request.headers(), peer);

    match state.limiter.intercept(&endpoint, &user_id).await {
        Decision::Continue => next.run(request).await,
        Decision::Reject => {
            debug!(endpoint = %endpoint, user_id = %user_id, "Rejecting request");
            rate_limit_exceeded_response()
        }
    }
}

/// Install [`rate_limit_middleware`] on every route of `router`.
pub fn with_rate_limit(router: Router, state: RateLimitState) -> Router {
    router.layer(axum::middleware::from_fn_with_state(
        state,
        rate_limit_middleware,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_first_path_segment() {
        assert_eq!(first_path_segment("/ping"), "/ping");
        assert_eq!(first_path_segment("/ping/123"), "/ping");
        assert_eq!(first_path_segment("/ping?user=1"), "/ping");
        assert_eq!(first_path_segment("/"), "/");
        assert_eq!(first_path_segment(""), "/");
        assert_eq!(first_path_segment("//ping"), "/ping");
    }

    #[test]
    fn test_identity_prefers_forwarded_header() {
        let mut headers = HeaderMap::new();
        headers.insert(
            FORWARDED_FOR_HEADER,
            HeaderValue::from_static("203.0.113.7, 10.0.0.1"),
        );
        let peer: SocketAddr = "10.0.0.1:5555".parse().unwrap();

        assert_eq!(client_identity(&headers, Some(peer)), "203.0.113.7");
    }

    #[test]
    fn test_identity_falls_back_to_peer() {
        let peer: SocketAddr = "10.0.0.1:5555".parse().unwrap();
        assert_eq!(client_identity(&HeaderMap::new(), Some(peer)), "10.0.0.1");

        let mut headers = HeaderMap::new();
        headers.insert(FORWARDED_FOR_HEADER, HeaderValue::from_static("  "));
        assert_eq!(client_identity(&headers, Some(peer)), "10.0.0.1");
    }

    #[test]
    fn test_identity_follows_caller_supplied_header() {
        let peer: SocketAddr = "198.51.100.9:5555".parse().unwrap();
        let identities: Vec<String> = ["a", "b"]
            .into_iter()
            .map(|spoofed| {
                let mut headers = HeaderMap::new();
                headers.insert(FORWARDED_FOR_HEADER, HeaderValue::from_static(spoofed));
                client_identity(&headers, Some(peer))
            })
            .collect();

        // Same peer, different header: distinct identities, hence distinct budgets.
        assert_eq!(identities, vec!["a", "b"]);
    }

    #[test]
    fn test_identity_unknown_without_sources() {
        assert_eq!(client_identity(&HeaderMap::new(), None), UNKNOWN_CLIENT);
    }
}
