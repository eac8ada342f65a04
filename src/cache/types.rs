//! Core type definitions for the cache system

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::CacheError;

/// Cache key type
pub type CacheKey = String;

/// Statistics for the bounded in-memory store
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct CacheStats {
    /// Total number of cache hits
    pub hits: u64,

    /// Total number of cache misses (including expired lookups)
    pub misses: u64,

    /// Number of entries currently in cache
    pub entries: usize,

    /// Sum of live entries' estimated sizes in bytes
    pub memory_usage: usize,

    /// Configured memory cap in bytes
    pub max_memory_size: usize,

    /// Entries removed to satisfy capacity
    pub evictions: u64,

    /// Entries removed because their TTL elapsed
    pub expirations: u64,

    /// Entries removed by delete, tag or pattern invalidation
    pub invalidations: u64,
}

impl CacheStats {
    /// Hit rate as a fraction in `[0, 1]`; zero when nothing has been requested
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    /// Miss rate as a fraction; zero when nothing has been requested
    pub fn miss_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.misses as f64 / total as f64
        }
    }

    /// Memory usage over the cap
    pub fn utilization(&self) -> f64 {
        if self.max_memory_size == 0 {
            0.0
        } else {
            self.memory_usage as f64 / self.max_memory_size as f64
        }
    }

    /// Total lookups served
    pub fn total_requests(&self) -> u64 {
        self.hits + self.misses
    }
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CacheStats {{ hits: {}, misses: {}, hit_rate: {:.2}%, entries: {}, memory: {}/{} bytes, evictions: {} }}",
            self.hits,
            self.misses,
            self.hit_rate() * 100.0,
            self.entries,
            self.memory_usage,
            self.max_memory_size,
            self.evictions
        )
    }
}

/// Tier currently holding the authoritative copy of an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntrySource {
    /// Bounded in-memory store
    Memory,
    /// Session-scoped persistent store
    PersistentSession,
    /// Long-lived persistent store
    PersistentLocal,
}

impl fmt::Display for EntrySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntrySource::Memory => write!(f, "memory"),
            EntrySource::PersistentSession => write!(f, "persistent_session"),
            EntrySource::PersistentLocal => write!(f, "persistent_local"),
        }
    }
}

/// Concrete persistent store an entry is written to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageTarget {
    /// Cleared with the session
    Session,
    /// Survives restarts
    Local,
}

impl StorageTarget {
    pub fn source(self) -> EntrySource {
        match self {
            StorageTarget::Session => EntrySource::PersistentSession,
            StorageTarget::Local => EntrySource::PersistentLocal,
        }
    }
}

/// Victim selection policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EvictionStrategy {
    /// Least recently accessed first
    #[default]
    Lru,
    /// Lowest access count first
    Lfu,
    /// Expired, then soonest to expire
    TtlFirst,
    /// Largest entries first
    SizeFirst,
}

impl fmt::Display for EvictionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvictionStrategy::Lru => write!(f, "lru"),
            EvictionStrategy::Lfu => write!(f, "lfu"),
            EvictionStrategy::TtlFirst => write!(f, "ttl"),
            EvictionStrategy::SizeFirst => write!(f, "size"),
        }
    }
}

impl FromStr for EvictionStrategy {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "lru" => Ok(EvictionStrategy::Lru),
            "lfu" => Ok(EvictionStrategy::Lfu),
            "ttl" | "ttl_first" => Ok(EvictionStrategy::TtlFirst),
            "size" | "size_first" => Ok(EvictionStrategy::SizeFirst),
            other => Err(CacheError::Config(format!(
                "unknown eviction strategy '{}'",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_stats_hit_rate() {
        let stats = CacheStats {
            hits: 80,
            misses: 20,
            ..Default::default()
        };

        assert_eq!(stats.hit_rate(), 0.8);
        assert!((stats.miss_rate() - 0.2).abs() < f64::EPSILON);
    }

    #[test]
    fn test_cache_stats_zero_requests() {
        let stats = CacheStats::default();
        assert_eq!(stats.hit_rate(), 0.0);
        assert_eq!(stats.miss_rate(), 0.0);
        assert_eq!(stats.utilization(), 0.0);
    }

    #[test]
    fn test_cache_stats_display() {
        let stats = CacheStats {
            hits: 100,
            misses: 50,
            entries: 75,
            memory_usage: 1024,
            max_memory_size: 4096,
            evictions: 10,
            expirations: 5,
            invalidations: 3,
        };

        let display = format!("{}", stats);
        assert!(display.contains("hits: 100"));
        assert!(display.contains("1024/4096"));
        assert_eq!(stats.utilization(), 0.25);
    }

    #[test]
    fn test_eviction_strategy_parse() {
        assert_eq!("LRU".parse::<EvictionStrategy>().unwrap(), EvictionStrategy::Lru);
        assert_eq!("ttl".parse::<EvictionStrategy>().unwrap(), EvictionStrategy::TtlFirst);
        assert_eq!(
            "size_first".parse::<EvictionStrategy>().unwrap(),
            EvictionStrategy::SizeFirst
        );
        assert!("random".parse::<EvictionStrategy>().is_err());
    }

    #[test]
    fn test_storage_target_source() {
        assert_eq!(StorageTarget::Session.source(), EntrySource::PersistentSession);
        assert_eq!(StorageTarget::Local.source(), EntrySource::PersistentLocal);
        assert_eq!(EntrySource::Memory.to_string(), "memory");
    }
}
