//! Bucket key derivation.
//!
//! Store keys have the form `{prefix}#{user}#{endpoint}#{boundary_ms}`. The
//! user and endpoint components are percent-escaped so that `#` never occurs
//! inside them, which keeps the subject prefix unambiguous.

use std::time::Duration;

use chrono::{DateTime, Utc};

use super::RateLimiterKey;

/// Namespace prepended to every store key unless configured otherwise.
pub const DEFAULT_KEY_PREFIX: &str = "ratelimit";

const DELIMITER: char = '#';

/// Floor `timestamp` to a multiple of `interval`, in Unix milliseconds.
///
/// Returns `None` when the interval is shorter than one millisecond.
pub fn truncate_to_interval(timestamp: DateTime<Utc>, interval: Duration) -> Option<i64> {
    let interval_ms = i64::try_from(interval.as_millis()).unwrap_or(i64::MAX);
    if interval_ms == 0 {
        return None;
    }
    let ts = timestamp.timestamp_millis();
    Some(ts - ts.rem_euclid(interval_ms))
}

/// A single time bucket for a rate limit subject.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketKey {
    pub user_id: String,
    pub endpoint: String,
    /// Bucket start in Unix milliseconds.
    pub boundary_ms: i64,
}

impl BucketKey {
    pub fn new(key: &RateLimiterKey, boundary_ms: i64) -> Self {
        Self {
            user_id: key.user_id.clone(),
            endpoint: key.endpoint.clone(),
            boundary_ms,
        }
    }

    /// Key of the bucket containing `timestamp`, or `None` for a sub-millisecond interval.
    pub fn for_timestamp(
        key: &RateLimiterKey,
        timestamp: DateTime<Utc>,
        interval: Duration,
    ) -> Option<Self> {
        truncate_to_interval(timestamp, interval).map(|boundary| Self::new(key, boundary))
    }

    /// Literal prefix shared by every bucket of `key`.
    pub fn subject_prefix(prefix: &str, key: &RateLimiterKey) -> String {
        format!(
            "{prefix}{DELIMITER}{}{DELIMITER}{}{DELIMITER}",
            encode_component(&key.user_id),
            encode_component(&key.endpoint)
        )
    }

    /// Glob pattern (Redis `MATCH` syntax) matching every bucket of `key`.
    pub fn match_pattern(prefix: &str, key: &RateLimiterKey) -> String {
        format!("{}*", escape_glob(&Self::subject_prefix(prefix, key)))
    }

    /// Render the key as stored in the backend.
    pub fn to_store_key(&self, prefix: &str) -> String {
        let subject = RateLimiterKey::new(self.user_id.as_str(), self.endpoint.as_str());
        format!("{}{}", Self::subject_prefix(prefix, &subject), self.boundary_ms)
    }

    /// Parse a store key produced by [`BucketKey::to_store_key`].
    pub fn from_store_key(prefix: &str, key: &str) -> Option<Self> {
        let rest = key.strip_prefix(prefix)?.strip_prefix(DELIMITER)?;
        let mut parts = rest.split(DELIMITER);
        let user_id = decode_component(parts.next()?)?;
        let endpoint = decode_component(parts.next()?)?;
        let boundary_ms = parts.next()?.parse().ok()?;
        if parts.next().is_some() {
            return None;
        }

        Some(Self {
            user_id,
            endpoint,
            boundary_ms,
        })
    }
}

/// Backslash-escape glob metacharacters.
fn escape_glob(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

fn encode_component(raw: &str) -> String {
    let mut encoded = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '%' => encoded.push_str("%25"),
            DELIMITER => encoded.push_str("%23"),
            _ => encoded.push(c),
        }
    }
    encoded
}

fn decode_component(encoded: &str) -> Option<String> {
    let mut decoded = String::with_capacity(encoded.len());
    let mut rest = encoded;
    while let Some(pos) = rest.find('%') {
        decoded.push_str(&rest[..pos]);
        let code = rest.get(pos + 1..pos + 3)?;
        match code {
            "25" => decoded.push('%'),
            "23" => decoded.push(DELIMITER),
            _ => return None,
        }
        rest = &rest[pos + 3..];
    }
    decoded.push_str(rest);
    Some(decoded)
}
