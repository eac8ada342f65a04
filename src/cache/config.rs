//! Configuration for the cache system

use crate::cache::types::EvictionStrategy;
use crate::error::{CacheError, Result};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

/// Configuration for the memory store and the tiered manager
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// TTL applied when a caller does not pass one. Zero means never expires.
    pub default_ttl: Duration,

    /// Maximum total estimated size of live entries in bytes
    pub max_memory_size: usize,

    /// Maximum number of entries in the memory store
    pub max_entries: usize,

    /// Policy used when the store is under pressure
    pub eviction_strategy: EvictionStrategy,

    /// Fraction of resident entries removed per eviction pass (minimum one entry)
    pub eviction_ratio: f64,

    /// TTL jitter factor (0.0 - 1.0), applied to the default TTL only
    pub ttl_jitter: f64,

    /// Enable the background sweep of expired entries
    pub enable_auto_cleanup: bool,

    /// Interval of the background sweep
    pub cleanup_interval: Duration,

    /// Write entries through to the persistent tier
    pub enable_persistence: bool,

    /// Consult the persistent tier on a memory miss
    pub fallback_to_storage: bool,

    /// Compress persisted payloads with the configured codec
    pub enable_compression: bool,

    /// Prefix of every key this cache writes to persistent storage
    pub key_prefix: String,

    /// Entries whose TTL is at most this long go to the session store
    pub session_ttl_threshold: Duration,

    /// Optional wall-clock budget for batch operations
    pub batch_timeout: Option<Duration>,

    /// Number of access timings kept for the rolling average
    pub access_history_len: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(300),
            max_memory_size: 50 * 1024 * 1024,
            max_entries: 10_000,
            eviction_strategy: EvictionStrategy::Lru,
            eviction_ratio: 0.10,
            ttl_jitter: 0.0,
            enable_auto_cleanup: true,
            cleanup_interval: Duration::from_secs(60),
            enable_persistence: true,
            fallback_to_storage: true,
            enable_compression: false,
            key_prefix: "kb-cache:".to_string(),
            session_ttl_threshold: Duration::from_secs(3600),
            batch_timeout: None,
            access_history_len: 100,
        }
    }
}

impl CacheConfig {
    /// Create a new builder for cache configuration
    pub fn builder() -> CacheConfigBuilder {
        CacheConfigBuilder::default()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_entries == 0 {
            return Err(CacheError::Config(
                "max_entries must be greater than 0".to_string(),
            ));
        }

        if self.max_memory_size == 0 {
            return Err(CacheError::Config(
                "max_memory_size must be greater than 0".to_string(),
            ));
        }

        if !(self.eviction_ratio > 0.0 && self.eviction_ratio <= 1.0) {
            return Err(CacheError::Config(
                "eviction_ratio must be in (0.0, 1.0]".to_string(),
            ));
        }

        if self.ttl_jitter < 0.0 || self.ttl_jitter > 1.0 {
            return Err(CacheError::Config(
                "ttl_jitter must be between 0.0 and 1.0".to_string(),
            ));
        }

        if self.enable_auto_cleanup && self.cleanup_interval.is_zero() {
            return Err(CacheError::Config(
                "cleanup_interval must be non-zero when auto cleanup is enabled".to_string(),
            ));
        }

        if self.access_history_len == 0 {
            return Err(CacheError::Config(
                "access_history_len must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Default TTL with jitter applied. A zero TTL stays zero.
    pub fn ttl_with_jitter(&self) -> Duration {
        if self.ttl_jitter == 0.0 || self.default_ttl.is_zero() {
            return self.default_ttl;
        }

        let base_ms = self.default_ttl.as_millis() as f64;
        let jitter_range = base_ms * self.ttl_jitter;
        let jitter = (rand::random::<f64>() * 2.0 - 1.0) * jitter_range;
        let final_ms = (base_ms + jitter).max(1.0);

        Duration::from_millis(final_ms as u64)
    }

    /// Load configuration from the environment (and a `.env` file if present).
    ///
    /// Recognised variables: `KB_CACHE_DEFAULT_TTL_MS`, `KB_CACHE_MAX_MEMORY_BYTES`,
    /// `KB_CACHE_MAX_ENTRIES`, `KB_CACHE_EVICTION_STRATEGY`, `KB_CACHE_EVICTION_RATIO`,
    /// `KB_CACHE_ENABLE_PERSISTENCE`, `KB_CACHE_ENABLE_COMPRESSION`, `KB_CACHE_KEY_PREFIX`.
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build a configuration from an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = lookup("KB_CACHE_DEFAULT_TTL_MS") {
            config.default_ttl = Duration::from_millis(parse_var("KB_CACHE_DEFAULT_TTL_MS", &v)?);
        }
        if let Some(v) = lookup("KB_CACHE_MAX_MEMORY_BYTES") {
            config.max_memory_size = parse_var("KB_CACHE_MAX_MEMORY_BYTES", &v)?;
        }
        if let Some(v) = lookup("KB_CACHE_MAX_ENTRIES") {
            config.max_entries = parse_var("KB_CACHE_MAX_ENTRIES", &v)?;
        }
        if let Some(v) = lookup("KB_CACHE_EVICTION_STRATEGY") {
            config.eviction_strategy = EvictionStrategy::from_str(&v)?;
        }
        if let Some(v) = lookup("KB_CACHE_EVICTION_RATIO") {
            config.eviction_ratio = parse_var("KB_CACHE_EVICTION_RATIO", &v)?;
        }
        if let Some(v) = lookup("KB_CACHE_ENABLE_PERSISTENCE") {
            config.enable_persistence = parse_var("KB_CACHE_ENABLE_PERSISTENCE", &v)?;
        }
        if let Some(v) = lookup("KB_CACHE_ENABLE_COMPRESSION") {
            config.enable_compression = parse_var("KB_CACHE_ENABLE_COMPRESSION", &v)?;
        }
        if let Some(v) = lookup("KB_CACHE_KEY_PREFIX") {
            config.key_prefix = v;
        }

        config.validate()?;
        debug!("Loaded cache config from environment: {:?}", config);
        Ok(config)
    }
}

fn parse_var<T: FromStr>(name: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse::<T>()
        .map_err(|_| CacheError::Config(format!("{} has an invalid value '{}'", name, raw)))
}

/// Builder for cache configuration
#[derive(Debug, Default)]
pub struct CacheConfigBuilder {
    default_ttl: Option<Duration>,
    max_memory_size: Option<usize>,
    max_entries: Option<usize>,
    eviction_strategy: Option<EvictionStrategy>,
    eviction_ratio: Option<f64>,
    ttl_jitter: Option<f64>,
    enable_auto_cleanup: Option<bool>,
    cleanup_interval: Option<Duration>,
    enable_persistence: Option<bool>,
    fallback_to_storage: Option<bool>,
    enable_compression: Option<bool>,
    key_prefix: Option<String>,
    session_ttl_threshold: Option<Duration>,
    batch_timeout: Option<Duration>,
}

impl CacheConfigBuilder {
    /// Set default TTL for cache entries
    pub fn default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = Some(ttl);
        self
    }

    /// Set the memory cap in bytes
    pub fn max_memory_size(mut self, bytes: usize) -> Self {
        self.max_memory_size = Some(bytes);
        self
    }

    /// Set maximum number of cache entries
    pub fn max_entries(mut self, max: usize) -> Self {
        self.max_entries = Some(max);
        self
    }

    /// Set the pressure eviction policy
    pub fn eviction_strategy(mut self, strategy: EvictionStrategy) -> Self {
        self.eviction_strategy = Some(strategy);
        self
    }

    /// Set the fraction of entries removed per eviction pass
    pub fn eviction_ratio(mut self, ratio: f64) -> Self {
        self.eviction_ratio = Some(ratio);
        self
    }

    /// Set TTL jitter factor (0.0 - 1.0)
    pub fn ttl_jitter(mut self, jitter: f64) -> Self {
        self.ttl_jitter = Some(jitter);
        self
    }

    /// Enable or disable automatic cleanup
    pub fn enable_auto_cleanup(mut self, enable: bool) -> Self {
        self.enable_auto_cleanup = Some(enable);
        self
    }

    /// Set cleanup interval
    pub fn cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = Some(interval);
        self
    }

    /// Enable or disable write-through to the persistent tier
    pub fn enable_persistence(mut self, enable: bool) -> Self {
        self.enable_persistence = Some(enable);
        self
    }

    /// Enable or disable persistent lookups on memory miss
    pub fn fallback_to_storage(mut self, enable: bool) -> Self {
        self.fallback_to_storage = Some(enable);
        self
    }

    /// Enable or disable payload compression
    pub fn enable_compression(mut self, enable: bool) -> Self {
        self.enable_compression = Some(enable);
        self
    }

    /// Set the persistent key prefix
    pub fn key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = Some(prefix.into());
        self
    }

    /// Set the TTL threshold separating session and long-lived storage
    pub fn session_ttl_threshold(mut self, threshold: Duration) -> Self {
        self.session_ttl_threshold = Some(threshold);
        self
    }

    /// Set the batch operation timeout
    pub fn batch_timeout(mut self, timeout: Duration) -> Self {
        self.batch_timeout = Some(timeout);
        self
    }

    /// Build the cache configuration
    pub fn build(self) -> CacheConfig {
        let defaults = CacheConfig::default();

        CacheConfig {
            default_ttl: self.default_ttl.unwrap_or(defaults.default_ttl),
            max_memory_size: self.max_memory_size.unwrap_or(defaults.max_memory_size),
            max_entries: self.max_entries.unwrap_or(defaults.max_entries),
            eviction_strategy: self
                .eviction_strategy
                .unwrap_or(defaults.eviction_strategy),
            eviction_ratio: self.eviction_ratio.unwrap_or(defaults.eviction_ratio),
            ttl_jitter: self.ttl_jitter.unwrap_or(defaults.ttl_jitter),
            enable_auto_cleanup: self
                .enable_auto_cleanup
                .unwrap_or(defaults.enable_auto_cleanup),
            cleanup_interval: self.cleanup_interval.unwrap_or(defaults.cleanup_interval),
            enable_persistence: self
                .enable_persistence
                .unwrap_or(defaults.enable_persistence),
            fallback_to_storage: self
                .fallback_to_storage
                .unwrap_or(defaults.fallback_to_storage),
            enable_compression: self
                .enable_compression
                .unwrap_or(defaults.enable_compression),
            key_prefix: self.key_prefix.unwrap_or(defaults.key_prefix),
            session_ttl_threshold: self
                .session_ttl_threshold
                .unwrap_or(defaults.session_ttl_threshold),
            batch_timeout: self.batch_timeout.or(defaults.batch_timeout),
            access_history_len: defaults.access_history_len,
        }
    }
}

/// Preset configurations for common use cases
impl CacheConfig {
    /// Short-lived, frequently changing data
    pub fn realtime() -> Self {
        Self {
            default_ttl: Duration::from_secs(30),
            max_memory_size: 10 * 1024 * 1024,
            max_entries: 2_000,
            cleanup_interval: Duration::from_secs(15),
            enable_persistence: false,
            fallback_to_storage: false,
            ..Default::default()
        }
    }

    /// Memory-constrained environments
    pub fn small() -> Self {
        Self {
            default_ttl: Duration::from_secs(120),
            max_memory_size: 5 * 1024 * 1024,
            max_entries: 1_000,
            enable_compression: true,
            ..Default::default()
        }
    }

    /// Large knowledge bases with long-lived search results
    pub fn large() -> Self {
        Self {
            default_ttl: Duration::from_secs(1800),
            max_memory_size: 500 * 1024 * 1024,
            max_entries: 200_000,
            enable_compression: true,
            ..Default::default()
        }
    }
}
