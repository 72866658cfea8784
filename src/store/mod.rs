//! Counter stores holding time-bucketed request counters.
//!
//! A store keeps one counter per `(user, endpoint, bucket boundary)` and lets
//! the backend expire old buckets. The rate limiter only ever sees the
//! aggregate across live buckets.

mod key;
mod memory;
mod redis_store;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

pub use key::{truncate_to_interval, BucketKey, DEFAULT_KEY_PREFIX};
pub use memory::MemoryStore;
pub use redis_store::{RedisStore, DEFAULT_SCAN_BATCH_SIZE};

/// Identifies a rate limit subject.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimiterKey {
    /// Caller identity, e.g. the forwarded client address
    pub user_id: String,
    /// Normalized route identifier
    pub endpoint: String,
}

impl RateLimiterKey {
    /// Create a new key.
    pub fn new(user_id: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            endpoint: endpoint.into(),
        }
    }
}

impl fmt::Display for RateLimiterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.user_id, self.endpoint)
    }
}

/// Errors that can occur in counter store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("Window interval must be greater than zero")]
    InvalidInterval,
    #[error("Store operation timed out after {0:?}")]
    Timeout(Duration),
}

/// Result type alias for counter store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// A backend that stores time-bucketed counters.
///
/// Implementations must make the per-bucket increment atomic; no other
/// synchronization is provided by callers.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Sum every live bucket belonging to `key`.
    ///
    /// Returns `0` when no buckets exist.
    async fn get(&self, key: &RateLimiterKey) -> StoreResult<u64>;

    /// Increment the bucket that `timestamp` falls into.
    ///
    /// The timestamp is floored to a multiple of `window_interval`. A bucket
    /// created by this call expires `ttl` after creation.
    async fn set(
        &self,
        key: &RateLimiterKey,
        timestamp: DateTime<Utc>,
        window_interval: Duration,
        ttl: Duration,
    ) -> StoreResult<()>;
}
