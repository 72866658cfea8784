//! Redis-backed counter store.
//!
//! Buckets are plain string counters. Reads enumerate a subject's buckets
//! with `SCAN ... MATCH` and sum them with `MGET`; writes run a Lua script
//! that increments and, on creation only, sets the TTL, so a new bucket never
//! lives without an expiry.

use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::Script;
use tracing::{debug, info, trace};

use super::key::{BucketKey, DEFAULT_KEY_PREFIX};
use super::{CounterStore, RateLimiterKey, StoreError, StoreResult};

/// Number of keys requested per `SCAN` iteration by default.
pub const DEFAULT_SCAN_BATCH_SIZE: usize = 100;

/// Increments `KEYS[1]` and sets its TTL to `ARGV[1]` seconds when the
/// increment created it. Returns the new count.
const INCREMENT_SCRIPT: &str = r"
local count = redis.call('INCR', KEYS[1])
if count == 1 then
    redis.call('EXPIRE', KEYS[1], ARGV[1])
end
return count
";

/// A counter store backed by a Redis server.
///
/// The connection manager is cloneable and reconnects on failure, so one
/// store can be shared by every concurrent decision.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    increment: Script,
    scan_batch_size: usize,
    key_prefix: String,
}

impl RedisStore {
    /// Connect to the Redis server at `url`.
    pub async fn connect(url: &str, scan_batch_size: usize) -> StoreResult<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        info!(url = %url, scan_batch_size, "Connected to Redis counter store");
        Ok(Self::from_connection(conn, scan_batch_size))
    }

    /// Wrap an existing connection manager.
    pub fn from_connection(conn: ConnectionManager, scan_batch_size: usize) -> Self {
        Self {
            conn,
            increment: Script::new(INCREMENT_SCRIPT),
            scan_batch_size: scan_batch_size.max(1),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
        }
    }

    /// Use a different key namespace.
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }
}

/// TTL in whole seconds, rounded up and never below one.
fn ttl_seconds(ttl: Duration) -> i64 {
    let secs = ttl.as_secs().saturating_add(u64::from(ttl.subsec_nanos() > 0));
    i64::try_from(secs.max(1)).unwrap_or(i64::MAX)
}

/// Filters `SCAN` pages down to the bucket keys of one subject.
///
/// `SCAN` may return a key more than once while the keyspace changes, and a
/// `MATCH` glob can admit keys that are not buckets of this subject. Each key
/// is parsed back and kept at most once.
struct ScanAggregator<'a> {
    prefix: &'a str,
    subject: &'a RateLimiterKey,
    seen: HashSet<String>,
}

impl<'a> ScanAggregator<'a> {
    fn new(prefix: &'a str, subject: &'a RateLimiterKey) -> Self {
        Self {
            prefix,
            subject,
            seen: HashSet::new(),
        }
    }

    /// Keys from `page` that belong to the subject and were not admitted before.
    fn admit(&mut self, page: Vec<String>) -> Vec<String> {
        let (prefix, subject) = (self.prefix, self.subject);
        page.into_iter()
            .filter(|key| match BucketKey::from_store_key(prefix, key) {
                Some(bucket)
                    if bucket.user_id == subject.user_id && bucket.endpoint == subject.endpoint =>
                {
                    true
                }
                _ => {
                    debug!(key = %key, subject = %subject, "Skipping foreign key from scan");
                    false
                }
            })
            .filter(|key| self.seen.insert(key.clone()))
            .collect()
    }

    fn bucket_count(&self) -> usize {
        self.seen.len()
    }
}

/// Sum the values of `keys`, reading at most `batch` keys per call to `read`.
///
/// Missing values (keys that expired since the scan) count as zero.
async fn sum_in_batches<F, Fut>(keys: &[String], batch: usize, mut read: F) -> StoreResult<u64>
where
    F: FnMut(Vec<String>) -> Fut,
    Fut: Future<Output = StoreResult<Vec<Option<u64>>>>,
{
    let mut total: u64 = 0;
    for chunk in keys.chunks(batch.max(1)) {
        let values = read(chunk.to_vec()).await?;
        total = total.saturating_add(values.into_iter().flatten().sum());
    }
    Ok(total)
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn get(&self, key: &RateLimiterKey) -> StoreResult<u64> {
        let pattern = BucketKey::match_pattern(&self.key_prefix, key);
        let mut conn = self.conn.clone();
        let mut aggregator = ScanAggregator::new(&self.key_prefix, key);
        let mut cursor: u64 = 0;
        let mut total: u64 = 0;

        loop {
            let (next, page): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(self.scan_batch_size)
                .arg("TYPE")
                .arg("string")
                .query_async(&mut conn)
                .await?;

            let fresh = aggregator.admit(page);
            let sum = sum_in_batches(&fresh, self.scan_batch_size, |chunk| {
                let mut conn = self.conn.clone();
                async move {
                    let values: Vec<Option<u64>> = redis::cmd("MGET")
                        .arg(chunk)
                        .query_async(&mut conn)
                        .await?;
                    Ok(values)
                }
            })
            .await?;
            total = total.saturating_add(sum);

            if next == 0 {
                break;
            }
            cursor = next;
        }

        trace!(
            key = %key,
            buckets = aggregator.bucket_count(),
            count = total,
            "Aggregated buckets"
        );
        Ok(total)
    }

    async fn set(
        &self,
        key: &RateLimiterKey,
        timestamp: DateTime<Utc>,
        window_interval: Duration,
        ttl: Duration,
    ) -> StoreResult<()> {
        let bucket = BucketKey::for_timestamp(key, timestamp, window_interval)
            .ok_or(StoreError::InvalidInterval)?;
        let store_key = bucket.to_store_key(&self.key_prefix);
        let ttl_secs = ttl_seconds(ttl);
        let mut conn = self.conn.clone();

        let count: i64 = self
            .increment
            .key(&store_key)
            .arg(ttl_secs)
            .invoke_async(&mut conn)
            .await?;

        if count == 1 {
            debug!(key = %key, bucket = %store_key, ttl_secs, "Created bucket");
        } else {
            trace!(key = %key, bucket = %store_key, count, "Incremented bucket");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    fn subject() -> RateLimiterKey {
        RateLimiterKey::new("u1", "/ping")
    }

    fn bucket(user: &str, boundary_ms: i64) -> String {
        BucketKey::new(&RateLimiterKey::new(user, "/ping"), boundary_ms)
            .to_store_key(DEFAULT_KEY_PREFIX)
    }

    #[test]
    fn test_ttl_seconds_rounds_up() {
        assert_eq!(ttl_seconds(Duration::from_secs(60)), 60);
        assert_eq!(ttl_seconds(Duration::from_millis(60_001)), 61);
        assert_eq!(ttl_seconds(Duration::from_millis(500)), 1);
        assert_eq!(ttl_seconds(Duration::ZERO), 1);
    }

    #[test]
    fn test_ttl_seconds_saturates() {
        assert_eq!(ttl_seconds(Duration::MAX), i64::MAX);
    }

    #[test]
    fn test_increment_script_sets_ttl_only_on_create() {
        // Plain EXPIRE guarded by the creating increment works on every Redis version.
        assert!(!INCREMENT_SCRIPT.contains("NX"));
        let incr = INCREMENT_SCRIPT.find("'INCR'").unwrap();
        let guard = INCREMENT_SCRIPT.find("if count == 1 then").unwrap();
        let expire = INCREMENT_SCRIPT.find("'EXPIRE', KEYS[1], ARGV[1]").unwrap();
        assert!(incr < guard && guard < expire);
        assert_eq!(INCREMENT_SCRIPT.matches("redis.call").count(), 2);
    }

    #[test]
    fn test_aggregator_drops_keys_repeated_across_pages() {
        let subject = subject();
        let mut aggregator = ScanAggregator::new(DEFAULT_KEY_PREFIX, &subject);

        let first = aggregator.admit(vec![bucket("u1", 0), bucket("u1", 5_000)]);
        let second = aggregator.admit(vec![bucket("u1", 5_000), bucket("u1", 10_000)]);
        let third = aggregator.admit(vec![bucket("u1", 0)]);

        assert_eq!(first.len(), 2);
        assert_eq!(second, vec![bucket("u1", 10_000)]);
        assert!(third.is_empty());
        assert_eq!(aggregator.bucket_count(), 3);
    }

    #[test]
    fn test_aggregator_skips_keys_of_other_subjects() {
        let subject = subject();
        let mut aggregator = ScanAggregator::new(DEFAULT_KEY_PREFIX, &subject);

        let admitted = aggregator.admit(vec![
            bucket("u1", 0),
            bucket("u10", 0),
            BucketKey::new(&RateLimiterKey::new("u1", "/pingpong"), 0)
                .to_store_key(DEFAULT_KEY_PREFIX),
            format!("{DEFAULT_KEY_PREFIX}#u1#/ping#notanumber"),
            "unrelated".to_string(),
        ]);

        assert_eq!(admitted, vec![bucket("u1", 0)]);
    }

    #[tokio::test]
    async fn test_sum_is_independent_of_batch_size() {
        let keys: Vec<String> = (0..3).map(|i| bucket("u1", i * 5_000)).collect();
        let values = |chunk: &[String]| -> Vec<Option<u64>> {
            chunk
                .iter()
                .map(|k| keys.iter().position(|x| x == k).map(|i| i as u64 + 1))
                .collect()
        };

        let reads = RefCell::new(0);
        let small = sum_in_batches(&keys, 1, |chunk| {
            *reads.borrow_mut() += 1;
            let out = values(&chunk);
            async move { Ok(out) }
        })
        .await
        .unwrap();
        assert_eq!(small, 6);
        assert_eq!(*reads.borrow(), 3);

        *reads.borrow_mut() = 0;
        let large = sum_in_batches(&keys, 100, |chunk| {
            *reads.borrow_mut() += 1;
            let out = values(&chunk);
            async move { Ok(out) }
        })
        .await
        .unwrap();
        assert_eq!(large, 6);
        assert_eq!(*reads.borrow(), 1);
    }

    #[tokio::test]
    async fn test_sum_counts_missing_values_as_zero() {
        let keys = vec![bucket("u1", 0), bucket("u1", 5_000)];
        let total = sum_in_batches(&keys, 10, |_| async { Ok(vec![Some(4), None]) })
            .await
            .unwrap();
        assert_eq!(total, 4);

        let empty = sum_in_batches(&[], 10, |_| async { Ok(vec![Some(99)]) })
            .await
            .unwrap();
        assert_eq!(empty, 0);
    }
}
