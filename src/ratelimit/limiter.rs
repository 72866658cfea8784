//! Core rate limiter implementation.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, trace};

use super::rules::RateLimiterConfig;
use crate::clock::{Clock, SystemClock};
use crate::store::{CounterStore, RateLimiterKey, StoreError, StoreResult};

/// Admit the request when the counter store cannot be consulted.
///
/// A store outage must never turn into an outage of the protected service,
/// so every store error or timeout resolves to admission. Do not flip this.
pub const ADMIT_ON_STORE_ERROR: bool = true;

/// Default upper bound on a single store call.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(250);

/// What the host pipeline should do with a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Pass the request on to downstream handlers
    Continue,
    /// Short-circuit with a "too many requests" response
    Reject,
}

impl From<bool> for Decision {
    fn from(allowed: bool) -> Self {
        if allowed {
            Decision::Continue
        } else {
            Decision::Reject
        }
    }
}

/// Sliding-window rate limiter over an external counter store.
///
/// The limiter holds no mutable state; it can be shared across tasks behind
/// an `Arc` and called concurrently. Reads and writes against the store are
/// not combined atomically, so a burst of concurrent requests may overshoot
/// `max_requests` by the number of requests in flight.
pub struct RateLimiter {
    config: RateLimiterConfig,
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    store_timeout: Duration,
}

impl RateLimiter {
    /// Create a new rate limiter using the system clock.
    pub fn new(config: RateLimiterConfig, store: Arc<dyn CounterStore>) -> Self {
        Self {
            config,
            store,
            clock: Arc::new(SystemClock),
            store_timeout: DEFAULT_STORE_TIMEOUT,
        }
    }

    /// Timestamp requests with `clock` instead of the system clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Bound every store call by `timeout`.
    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    /// Decide whether `user_id` may call `endpoint` now.
    ///
    /// Admitted requests are recorded in the current bucket; rejected ones
    /// are not counted.
    pub async fn allow_request(&self, endpoint: &str, user_id: &str) -> bool {
        let Some(limits) = self.config.get(endpoint) else {
            trace!(endpoint = %endpoint, "Endpoint not rate limited");
            return true;
        };

        let key = RateLimiterKey::new(user_id, endpoint);
        let now = self.clock.now();

        let count = match self.bounded(self.store.get(&key)).await {
            Ok(count) => count,
            Err(e) => {
                error!(key = %key, error = %e, "Failed to read rate limit counters");
                return ADMIT_ON_STORE_ERROR;
            }
        };

        trace!(
            key = %key,
            count,
            limit = limits.max_requests,
            "Checking rate limit"
        );

        if count == 0 || count < limits.max_requests {
            let recorded = self
                .bounded(self.store.set(
                    &key,
                    now,
                    limits.sliding_window_interval,
                    limits.time_window,
                ))
                .await;
            if let Err(e) = recorded {
                error!(key = %key, error = %e, "Failed to record request");
            }
            return true;
        }

        debug!(
            key = %key,
            count,
            limit = limits.max_requests,
            "Rate limit exceeded"
        );
        false
    }

    /// Request-interception hook for a host pipeline.
    pub async fn intercept(&self, endpoint: &str, user_id: &str) -> Decision {
        self.allow_request(endpoint, user_id).await.into()
    }

    async fn bounded<T>(&self, call: impl Future<Output = StoreResult<T>>) -> StoreResult<T> {
        tokio::time::timeout(self.store_timeout, call)
            .await
            .unwrap_or(Err(StoreError::Timeout(self.store_timeout)))
    }
}
