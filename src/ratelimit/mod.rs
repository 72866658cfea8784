//! Rate limiting decisions and endpoint rules.

mod limiter;
mod rules;

pub use limiter::{Decision, RateLimiter, ADMIT_ON_STORE_ERROR, DEFAULT_STORE_TIMEOUT};
pub use rules::{
    EndpointConfig, RateLimiterConfig, DEFAULT_MAX_REQUESTS, DEFAULT_SLIDING_WINDOW_INTERVAL,
    DEFAULT_TIME_WINDOW,
};
