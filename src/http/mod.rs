//! HTTP glue: rate limiting middleware and the demo server.

mod middleware;
mod server;

pub use middleware::{
    client_identity, first_path_segment, rate_limit_exceeded_response, rate_limit_middleware,
    with_rate_limit, PathSanitizer, RateLimitState, FORWARDED_FOR_HEADER, UNKNOWN_CLIENT,
};
pub use server::HttpServer;
