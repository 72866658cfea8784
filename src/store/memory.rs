//! In-process counter store.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{debug, trace};

use super::key::truncate_to_interval;
use super::{CounterStore, RateLimiterKey, StoreError, StoreResult};
use crate::clock::{Clock, SystemClock};

#[derive(Debug, Clone, Copy)]
struct Bucket {
    count: u64,
    expires_at: DateTime<Utc>,
}

impl Bucket {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

/// A counter store backed by a concurrent hash map.
///
/// Buckets are grouped per subject, so a lookup only touches the caller's
/// own buckets. Expired buckets are invisible to reads; they are dropped when
/// their subject is next written or by [`MemoryStore::purge_expired`].
pub struct MemoryStore {
    subjects: DashMap<RateLimiterKey, HashMap<i64, Bucket>>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    /// Create a store using the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a store that evaluates expiry against `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            subjects: DashMap::new(),
            clock,
        }
    }

    /// Drop every expired bucket, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut removed = 0;
        self.subjects.retain(|subject, buckets| {
            let before = buckets.len();
            buckets.retain(|_, bucket| bucket.is_live(now));
            let purged = before - buckets.len();
            if purged > 0 {
                trace!(key = %subject, purged, "Purged expired buckets for subject");
            }
            removed += purged;
            !buckets.is_empty()
        });
        if removed > 0 {
            debug!(removed, subjects = self.subjects.len(), "Purged expired buckets");
        }
        removed
    }

    /// Number of live buckets across all subjects.
    pub fn bucket_count(&self) -> usize {
        let now = self.clock.now();
        self.subjects
            .iter()
            .map(|entry| entry.value().values().filter(|b| b.is_live(now)).count())
            .sum()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn get(&self, key: &RateLimiterKey) -> StoreResult<u64> {
        let now = self.clock.now();

        let count: u64 = self
            .subjects
            .get(key)
            .map(|buckets| {
                buckets
                    .values()
                    .filter(|b| b.is_live(now))
                    .map(|b| b.count)
                    .sum()
            })
            .unwrap_or(0);

        trace!(key = %key, count, "Aggregated buckets");
        Ok(count)
    }

    async fn set(
        &self,
        key: &RateLimiterKey,
        timestamp: DateTime<Utc>,
        window_interval: Duration,
        ttl: Duration,
    ) -> StoreResult<()> {
        let boundary_ms =
            truncate_to_interval(timestamp, window_interval).ok_or(StoreError::InvalidInterval)?;
        let now = self.clock.now();
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        let expires_at = now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC);

        // The subject's entry guard holds its shard lock, so increment and expiry are applied together.
        let mut buckets = self.subjects.entry(key.clone()).or_default();
        buckets.retain(|_, bucket| bucket.is_live(now));
        let bucket = buckets.entry(boundary_ms).or_insert(Bucket {
            count: 0,
            expires_at,
        });
        bucket.count += 1;

        trace!(
            key = %key,
            boundary_ms,
            count = bucket.count,
            "Incremented bucket"
        );
        Ok(())
    }
}
