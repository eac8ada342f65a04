//! Cache entry management with TTL support

use crate::cache::types::{CacheKey, EntrySource};
use crate::clock::{add_std, millis_between};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

/// A cache entry with TTL and access bookkeeping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry<V> {
    /// The cache key
    pub key: CacheKey,

    /// The cached value
    pub value: V,

    /// Time-to-live in milliseconds; zero never expires
    pub ttl_ms: u64,

    /// When the entry was created
    pub created: DateTime<Utc>,

    /// Last access time
    pub accessed: DateTime<Utc>,

    /// Number of reads served from this entry
    pub access_count: u64,

    /// Estimated footprint in bytes
    pub size: usize,

    /// Tier holding the authoritative copy
    pub source: EntrySource,

    /// Tags for group invalidation
    pub tags: BTreeSet<String>,
}

impl<V> CacheEntry<V> {
    /// Create a memory-tier entry created at `now`
    pub fn new(key: CacheKey, value: V, ttl: Duration, now: DateTime<Utc>) -> Self {
        Self {
            key,
            value,
            ttl_ms: ttl.as_millis() as u64,
            created: now,
            accessed: now,
            access_count: 0,
            size: 0,
            source: EntrySource::Memory,
            tags: BTreeSet::new(),
        }
    }

    /// Attach tags
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    /// Set the estimated size
    pub fn with_size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    /// TTL as a duration
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    /// Whether the entry never expires
    pub fn is_eternal(&self) -> bool {
        self.ttl_ms == 0
    }

    /// Expired once `now - created >= ttl` (for `ttl > 0`)
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.ttl_ms > 0 && millis_between(self.created, now) >= self.ttl_ms
    }

    /// Absolute expiry instant, `None` for eternal entries
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        if self.is_eternal() {
            None
        } else {
            Some(add_std(self.created, self.ttl()))
        }
    }

    /// Time left before expiry; `None` if eternal or already expired
    pub fn time_until_expiration(&self, now: DateTime<Utc>) -> Option<Duration> {
        let expires_at = self.expires_at()?;
        if now >= expires_at {
            None
        } else {
            (expires_at - now).to_std().ok()
        }
    }

    /// Record a read. `accessed` never moves before `created`.
    pub fn mark_accessed(&mut self, now: DateTime<Utc>) {
        self.accessed = now.max(self.created);
        self.access_count += 1;
    }

    /// Age of the entry
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        Duration::from_millis(millis_between(self.created, now))
    }

    /// Check if entry has a specific tag
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }

    /// Convert the payload, keeping all bookkeeping
    pub fn map_value<U, F: FnOnce(V) -> U>(self, f: F) -> CacheEntry<U> {
        CacheEntry {
            key: self.key,
            value: f(self.value),
            ttl_ms: self.ttl_ms,
            created: self.created,
            accessed: self.accessed,
            access_count: self.access_count,
            size: self.size,
            source: self.source,
            tags: self.tags,
        }
    }
}

impl<V: Serialize> CacheEntry<V> {
    /// Estimate the footprint as key length plus serialized payload length
    pub fn estimate_size(key: &str, value: &V) -> crate::error::Result<usize> {
        Ok(key.len() + serde_json::to_vec(value)?.len())
    }
}
