use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::extract::ConnectInfo;
use axum::http::{Request, StatusCode};
use axum::routing::get;
use axum::Router;
use chrono::{TimeZone, Utc};
use serde_json::Value;
use tower::ServiceExt;

use slidegate::clock::ManualClock;
use slidegate::http::{with_rate_limit, HttpServer, RateLimitState};
use slidegate::ratelimit::{EndpointConfig, RateLimiter, RateLimiterConfig};
use slidegate::store::MemoryStore;

fn demo_limiter() -> (Arc<RateLimiter>, ManualClock) {
    let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap());
    let store = Arc::new(MemoryStore::with_clock(Arc::new(clock.clone())));
    let limiter = RateLimiter::new(RateLimiterConfig::demo(), store).with_clock(Arc::new(clock.clone()));
    (Arc::new(limiter), clock)
}

fn request(path: &str, forwarded_for: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().uri(path);
    if let Some(ip) = forwarded_for {
        builder = builder.header("X-Forwarded-For", ip);
    }
    builder.body(Body::empty()).unwrap()
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_ping_is_limited_per_client() {
    let (limiter, _) = demo_limiter();
    let app = HttpServer::new("127.0.0.1:0".parse().unwrap(), limiter).router();

    for i in 1..=5 {
        let response = app.clone().oneshot(request("/ping", Some("203.0.113.1"))).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK, "Request {} should pass", i);
        assert_eq!(json_body(response).await["message"], "pong");
    }

    let response = app.clone().oneshot(request("/ping", Some("203.0.113.1"))).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(json_body(response).await["error"], "Rate limit exceeded");

    // A different forwarded client has its own budget.
    let response = app.clone().oneshot(request("/ping", Some("203.0.113.2"))).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_query_and_subpaths_share_endpoint_budget() {
    let (limiter, clock) = demo_limiter();
    let app = Router::new()
        .route("/ping", get(|| async { "pong" }))
        .route("/ping/{id}", get(|| async { "pong" }));
    let app = with_rate_limit(app, RateLimitState::new(limiter));

    for path in ["/ping", "/ping?x=1", "/ping/a", "/ping/b?y=2", "/ping"] {
        let response = app.clone().oneshot(request(path, Some("198.51.100.9"))).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK, "{path} should pass");
    }
    let response = app.clone().oneshot(request("/ping/c", Some("198.51.100.9"))).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

    clock.advance(Duration::from_secs(65));
    let response = app.clone().oneshot(request("/ping", Some("198.51.100.9"))).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_peer_address_used_without_forwarded_header() {
    let (limiter, _) = demo_limiter();
    let app = HttpServer::new("127.0.0.1:0".parse().unwrap(), limiter).router();
    let peer: SocketAddr = "192.0.2.10:40000".parse().unwrap();

    let send = |app: Router, port: u16| {
        let mut req = request("/ping", None);
        let addr = SocketAddr::new(peer.ip(), port);
        req.extensions_mut().insert(ConnectInfo(addr));
        app.oneshot(req)
    };

    // Different source ports of the same host share one budget.
    for port in 40000..40005 {
        assert_eq!(send(app.clone(), port).await.unwrap().status(), StatusCode::OK);
    }
    assert_eq!(
        send(app.clone(), 40005).await.unwrap().status(),
        StatusCode::TOO_MANY_REQUESTS
    );
}

#[tokio::test]
async fn test_root_uses_default_limits() {
    let (limiter, _) = demo_limiter();
    let app = HttpServer::new("127.0.0.1:0".parse().unwrap(), limiter).router();

    for _ in 0..10 {
        let response = app.clone().oneshot(request("/", Some("203.0.113.5"))).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
    let response = app.clone().oneshot(request("/", Some("203.0.113.5"))).await.unwrap();
    assert_eq!(
        json_body(response).await["message"],
        "Welcome to the rate limiter example!"
    );
}

#[tokio::test]
async fn test_unlimited_route_passes_through() {
    let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap());
    let config = RateLimiterConfig::new().with_endpoint(
        "/limited",
        EndpointConfig::new(1, Duration::from_secs(60), Duration::from_secs(1)),
    );
    let store = Arc::new(MemoryStore::with_clock(Arc::new(clock.clone())));
    let limiter = Arc::new(RateLimiter::new(config, store).with_clock(Arc::new(clock)));

    let app = Router::new()
        .route("/open", get(|| async { "ok" }))
        .route("/limited", get(|| async { "ok" }));
    let app = with_rate_limit(app, RateLimitState::new(limiter));

    for _ in 0..25 {
        let response = app.clone().oneshot(request("/open", Some("198.51.100.1"))).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
    let first = app.clone().oneshot(request("/limited", Some("198.51.100.1"))).await.unwrap();
    let second = app.clone().oneshot(request("/limited", Some("198.51.100.1"))).await.unwrap();
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn test_custom_sanitizer_keys_full_path() {
    let (limiter, _) = demo_limiter();
    let app = Router::new().route("/ping/{id}", get(|| async { "pong" }));
    let state = RateLimitState::new(limiter).with_sanitizer(|path| path.to_string());
    let app = with_rate_limit(app, state);

    // "/ping/1" is not a configured endpoint once the full path is the key.
    for _ in 0..10 {
        let response = app.clone().oneshot(request("/ping/1", Some("203.0.113.9"))).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
