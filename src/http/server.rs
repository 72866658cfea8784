//! HTTP server exposing the demo routes behind the rate limiter.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{routing::get, Json, Router};
use serde_json::{json, Value};
use tracing::{error, info};

use super::middleware::{first_path_segment, with_rate_limit, PathSanitizer, RateLimitState};
use crate::error::{Result, SlidegateError};
use crate::ratelimit::RateLimiter;

/// HTTP server for the rate limited demo service.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    /// The rate limiter instance
    rate_limiter: Arc<RateLimiter>,
    /// Path normalization used for endpoint keys
    sanitizer: PathSanitizer,
}

impl HttpServer {
    /// Create a new HTTP server.
    pub fn new(addr: SocketAddr, rate_limiter: Arc<RateLimiter>) -> Self {
        Self {
            addr,
            rate_limiter,
            sanitizer: first_path_segment,
        }
    }

    /// Use a different path normalization.
    pub fn with_sanitizer(mut self, sanitizer: PathSanitizer) -> Self {
        self.sanitizer = sanitizer;
        self
    }

    /// Build the router with the rate limit middleware installed.
    pub fn router(&self) -> Router {
        let state = RateLimitState::new(self.rate_limiter.clone()).with_sanitizer(self.sanitizer);
        let routes = Router::new().route("/ping", get(ping)).route("/", get(root));
        with_rate_limit(routes, state)
    }

    /// Start the HTTP server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        let app = self.router();

        info!(addr = %self.addr, "Starting HTTP server with graceful shutdown");

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await
        .map_err(|e| {
            error!(error = %e, "HTTP server failed");
            SlidegateError::Server(e.to_string())
        })
    }
}

async fn ping() -> Json<Value> {
    Json(json!({ "message": "pong" }))
}

async fn root() -> Json<Value> {
    Json(json!({ "message": "Welcome to the rate limiter example!" }))
}
