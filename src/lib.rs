//! Slidegate - Sliding Window Rate Limiting
//!
//! This crate implements per-user, per-endpoint admission control using a
//! sliding window counter. Requests are folded into fixed-width time buckets
//! held by a pluggable counter store (in-memory or Redis), and the limiter
//! admits a request while the sum of live buckets stays below the endpoint's
//! limit. Store failures always fail open.

pub mod clock;
pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
pub mod store;
