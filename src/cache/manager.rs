//! Tiered cache manager
//!
//! Presents one get/set/delete API over the bounded [`MemoryStore`] and an
//! optional persistent tier made of two [`PersistentStorage`] instances
//! (session-scoped and long-lived).
//!
//! Persistent failures never fail a call whose memory-tier part succeeded:
//! they are logged, counted in [`ManagerStats::storage_errors`], and the
//! lookup degrades to a miss.

use crate::cache::{
    codec::{Codec, GzipCodec, NoopCodec},
    config::CacheConfig,
    entry::CacheEntry,
    memory::MemoryStore,
    pattern::KeyPattern,
    storage::{FileStorage, InMemoryStorage, PersistentStorage, StorageQuota},
    types::{CacheKey, CacheStats, EntrySource, EvictionStrategy, StorageTarget},
};
use crate::clock::{system_clock, SharedClock};
use crate::error::{CacheError, Result};
use crate::metrics::MetricsCollector;
use crate::scheduler::ScheduledTask;
use async_trait::async_trait;
use futures::future::join_all;
use futures::stream::{self, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashSet, VecDeque};
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const RECORD_RAW: u8 = 0;
const RECORD_COMPRESSED: u8 = 1;

/// Per-call options for [`TieredCacheManager::set`]
#[derive(Debug, Clone, Default)]
pub struct SetOptions {
    /// TTL override; zero never expires
    pub ttl: Option<Duration>,
    /// Tags for group invalidation
    pub tags: Vec<String>,
    /// `Some(false)` keeps the entry memory-only
    pub persist: Option<bool>,
    /// Pin the persistent destination instead of choosing by TTL
    pub target: Option<StorageTarget>,
    /// Override the configured compression setting
    pub compress: Option<bool>,
}

impl SetOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn memory_only(mut self) -> Self {
        self.persist = Some(false);
        self
    }

    pub fn target(mut self, target: StorageTarget) -> Self {
        self.target = Some(target);
        self
    }

    pub fn compress(mut self, compress: bool) -> Self {
        self.compress = Some(compress);
        self
    }

    fn validate(&self) -> Result<()> {
        if self.persist == Some(false) && self.target.is_some() {
            return Err(CacheError::InvalidOptions(
                "a storage target was pinned for a memory-only entry".to_string(),
            ));
        }
        if self.tags.iter().any(|t| t.trim().is_empty()) {
            return Err(CacheError::InvalidOptions("tags must not be blank".to_string()));
        }
        Ok(())
    }
}

/// The two persistent stores behind the memory tier
#[derive(Clone)]
pub struct PersistentTier {
    pub session: Arc<dyn PersistentStorage>,
    pub local: Arc<dyn PersistentStorage>,
}

impl PersistentTier {
    pub fn new(session: Arc<dyn PersistentStorage>, local: Arc<dyn PersistentStorage>) -> Self {
        Self { session, local }
    }

    /// Both stores backed by process memory
    pub fn in_memory() -> Self {
        Self {
            session: Arc::new(InMemoryStorage::new("session")),
            local: Arc::new(InMemoryStorage::new("local")),
        }
    }

    /// Session store in memory, long-lived store on disk under `dir`
    pub async fn on_disk(dir: impl Into<PathBuf>) -> Result<Self> {
        Ok(Self {
            session: Arc::new(InMemoryStorage::new("session")),
            local: Arc::new(FileStorage::open("local", dir).await?),
        })
    }

    fn store(&self, target: StorageTarget) -> &Arc<dyn PersistentStorage> {
        match target {
            StorageTarget::Session => &self.session,
            StorageTarget::Local => &self.local,
        }
    }
}

/// Source of values for [`TieredCacheManager::prefetch`]
#[async_trait]
pub trait Loader: Send + Sync {
    /// Fetch the value for a key; `None` means nothing to cache
    async fn load(&self, key: &str) -> Result<Option<Value>>;
}

/// Options for a background prefetch
#[derive(Clone)]
pub struct PrefetchOptions {
    pub keys: Vec<CacheKey>,
    pub loader: Arc<dyn Loader>,
    /// Maximum loads in flight
    pub concurrency: usize,
    /// Options applied to every loaded entry
    pub set_options: SetOptions,
    /// Skip keys already resident in memory
    pub skip_cached: bool,
}

impl PrefetchOptions {
    pub fn new(keys: Vec<CacheKey>, loader: Arc<dyn Loader>) -> Self {
        Self {
            keys,
            loader,
            concurrency: 4,
            set_options: SetOptions::default(),
            skip_cached: true,
        }
    }
}

/// Outcome of a prefetch or warm run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PopulateSummary {
    pub loaded: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Outcome of [`TieredCacheManager::optimize`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptimizeReport {
    pub expired_removed: usize,
    pub evicted: usize,
}

/// Manager-level statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ManagerStats {
    /// Memory store counters
    pub memory: CacheStats,
    /// Lookups answered by either tier
    pub hits: u64,
    /// Lookups answered by neither tier
    pub misses: u64,
    pub persistent_hits: u64,
    pub persistent_misses: u64,
    /// Persistent hits copied into memory
    pub promotions: u64,
    /// Persistent reads/writes that failed and were degraded
    pub storage_errors: u64,
    /// Mean of the most recent access timings
    pub avg_access_time_ms: f64,
}

impl ManagerStats {
    pub fn total_requests(&self) -> u64 {
        self.hits + self.misses
    }

    /// Overall hit rate; zero before the first lookup
    pub fn hit_rate(&self) -> f64 {
        let total = self.total_requests();
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Default)]
struct ManagerCounters {
    hits: u64,
    misses: u64,
    persistent_hits: u64,
    persistent_misses: u64,
    promotions: u64,
    storage_errors: u64,
    access_times: VecDeque<f64>,
}

/// Builder for [`TieredCacheManager`]
pub struct TieredCacheManagerBuilder {
    config: CacheConfig,
    persistent: Option<PersistentTier>,
    codec: Option<Arc<dyn Codec>>,
    clock: Option<SharedClock>,
    metrics: Option<Arc<MetricsCollector>>,
}

impl TieredCacheManagerBuilder {
    /// Attach the persistent tier
    pub fn persistent(mut self, tier: PersistentTier) -> Self {
        self.persistent = Some(tier);
        self
    }

    /// Codec used when compression is enabled (gzip by default)
    pub fn codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = Some(codec);
        self
    }

    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Report hits and misses to a metrics collector
    pub fn metrics(mut self, collector: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(collector);
        self
    }

    /// Validate the config, build the manager and start its cleanup sweep
    pub fn build(self) -> Result<Arc<TieredCacheManager>> {
        self.config.validate()?;

        let clock = self.clock.unwrap_or_else(system_clock);
        let codec: Arc<dyn Codec> = match self.codec {
            Some(codec) => codec,
            None if self.config.enable_compression => Arc::new(GzipCodec::default()),
            None => Arc::new(NoopCodec),
        };
        let memory = Arc::new(MemoryStore::new(self.config.clone(), clock.clone()));
        let cleanup_task = memory.start_cleanup();

        info!(
            "Tiered cache manager ready (persistent tier: {}, codec: {})",
            self.persistent.is_some() && self.config.enable_persistence,
            codec.name()
        );

        Ok(Arc::new(TieredCacheManager {
            config: self.config,
            clock,
            memory,
            persistent: self.persistent,
            codec,
            metrics: self.metrics,
            counters: Mutex::new(ManagerCounters::default()),
            cleanup_task: Mutex::new(cleanup_task),
        }))
    }
}

/// Memory-first cache with persistent fallback and promotion
pub struct TieredCacheManager {
    config: CacheConfig,
    clock: SharedClock,
    memory: Arc<MemoryStore<Value>>,
    persistent: Option<PersistentTier>,
    codec: Arc<dyn Codec>,
    metrics: Option<Arc<MetricsCollector>>,
    counters: Mutex<ManagerCounters>,
    cleanup_task: Mutex<Option<ScheduledTask>>,
}

impl TieredCacheManager {
    /// Start building a manager
    pub fn builder(config: CacheConfig) -> TieredCacheManagerBuilder {
        TieredCacheManagerBuilder {
            config,
            persistent: None,
            codec: None,
            clock: None,
            metrics: None,
        }
    }

    /// Memory-only manager with the given config
    pub fn new(config: CacheConfig) -> Result<Arc<Self>> {
        Self::builder(config).build()
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// The underlying memory store
    pub fn memory(&self) -> &Arc<MemoryStore<Value>> {
        &self.memory
    }

    fn persistence(&self) -> Option<&PersistentTier> {
        if self.config.enable_persistence {
            self.persistent.as_ref()
        } else {
            None
        }
    }

    fn storage_key(&self, key: &str) -> String {
        format!("{}{}", self.config.key_prefix, key)
    }

    fn logical_key<'a>(&self, storage_key: &'a str) -> Option<&'a str> {
        storage_key.strip_prefix(self.config.key_prefix.as_str())
    }

    /// Session store for short TTLs, long-lived store for long or infinite ones
    fn select_target(&self, ttl: Duration) -> StorageTarget {
        if ttl.is_zero() || ttl > self.config.session_ttl_threshold {
            StorageTarget::Local
        } else {
            StorageTarget::Session
        }
    }

    // ---- single-key operations ----

    /// Look a key up in memory, then in the persistent tier.
    ///
    /// A persistent hit is promoted into memory. Values that do not
    /// deserialize into `T` are reported as misses.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.get_value(key).await?;
        match serde_json::from_value(value) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!("Cached value for {} has an unexpected shape: {}", key, e);
                None
            }
        }
    }

    /// Untyped lookup
    pub async fn get_value(&self, key: &str) -> Option<Value> {
        let started = tokio::time::Instant::now();
        let (value, tier) = self.lookup(key).await;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

        {
            let mut counters = self.counters.lock().await;
            if value.is_some() {
                counters.hits += 1;
            } else {
                counters.misses += 1;
            }
            counters.access_times.push_back(elapsed_ms);
            while counters.access_times.len() > self.config.access_history_len {
                counters.access_times.pop_front();
            }
        }

        if let Some(metrics) = &self.metrics {
            metrics
                .record_cache_event(key, value.is_some(), tier, elapsed_ms)
                .await;
        }

        value
    }

    async fn lookup(&self, key: &str) -> (Option<Value>, Option<EntrySource>) {
        if let Some(value) = self.memory.get(key).await {
            return (Some(value), Some(EntrySource::Memory));
        }

        if !self.config.fallback_to_storage {
            return (None, None);
        }
        let Some(tier) = self.persistence() else {
            return (None, None);
        };

        let now = self.clock.now();
        match self.read_persistent(tier, key).await {
            Some((mut entry, target)) if !entry.is_expired(now) => {
                debug!("Promoting {} from {} store", key, target.source());
                entry.mark_accessed(now);
                entry.source = EntrySource::Memory;
                let value = entry.value.clone();

                let promoted = match self.memory.insert_entry(entry).await {
                    Ok(()) => true,
                    Err(e) => {
                        warn!("Could not promote {} into memory: {}", key, e);
                        false
                    }
                };

                let mut counters = self.counters.lock().await;
                counters.persistent_hits += 1;
                if promoted {
                    counters.promotions += 1;
                }
                (Some(value), Some(target.source()))
            }
            Some((_, target)) => {
                debug!("Persistent entry expired: {}", key);
                self.remove_persistent(tier.store(target), key).await;
                self.counters.lock().await.persistent_misses += 1;
                (None, None)
            }
            None => {
                self.counters.lock().await.persistent_misses += 1;
                (None, None)
            }
        }
    }

    /// Store a value in memory and, if enabled, in the persistent tier.
    ///
    /// Fails only for invalid input or an entry larger than the memory cap.
    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T, options: SetOptions) -> Result<()> {
        if key.is_empty() {
            return Err(CacheError::InvalidKey("key must not be empty".to_string()));
        }
        options.validate()?;

        let value = serde_json::to_value(value)?;
        let ttl = options.ttl.unwrap_or_else(|| self.config.ttl_with_jitter());
        let size = CacheEntry::estimate_size(key, &value)?;
        let entry = CacheEntry::new(key.to_string(), value, ttl, self.clock.now())
            .with_tags(options.tags.iter().cloned())
            .with_size(size);

        let persisted = options.persist != Some(false);
        let copy = (persisted && self.persistence().is_some()).then(|| entry.clone());

        self.memory.insert_entry(entry).await?;

        let Some(tier) = self.persistence() else {
            return Ok(());
        };
        match copy {
            Some(entry) => {
                let target = options.target.unwrap_or_else(|| self.select_target(ttl));
                let compress = options.compress.unwrap_or(self.config.enable_compression);
                if let Err(e) = self.write_persistent(tier, entry, target, compress).await {
                    warn!("Persistent write for {} failed, kept in memory only: {}", key, e);
                    self.counters.lock().await.storage_errors += 1;
                    self.drop_persisted(tier, key).await;
                }
            }
            // an older persisted value must not outlive this one
            None => self.drop_persisted(tier, key).await,
        }

        Ok(())
    }

    /// Remove any persisted copy of `key` from both stores
    async fn drop_persisted(&self, tier: &PersistentTier, key: &str) {
        for store in [&tier.session, &tier.local] {
            self.remove_persistent(store, key).await;
        }
    }

    /// Whether a live entry exists in either tier (no promotion, no stats)
    pub async fn has(&self, key: &str) -> bool {
        if self.memory.has(key).await {
            return true;
        }
        if !self.config.fallback_to_storage {
            return false;
        }
        let Some(tier) = self.persistence() else {
            return false;
        };
        let now = self.clock.now();
        matches!(
            self.read_persistent(tier, key).await,
            Some((entry, _)) if !entry.is_expired(now)
        )
    }

    /// Remove a key from both tiers. Returns whether anything was removed.
    pub async fn delete(&self, key: &str) -> bool {
        let mut removed = self.memory.delete(key).await;

        if let Some(tier) = self.persistence() {
            let storage_key = self.storage_key(key);
            for store in [&tier.session, &tier.local] {
                match store.get_item(&storage_key).await {
                    Ok(Some(_)) => {
                        self.remove_persistent(store, key).await;
                        removed = true;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!("Could not check {} in {}: {}", key, store.name(), e);
                        self.remove_persistent(store, key).await;
                    }
                }
            }
        }

        removed
    }

    /// Remove everything, or only keys matching a glob pattern.
    ///
    /// Without a pattern, persistent keys sharing this cache's prefix are
    /// wiped too. Returns the number of distinct keys removed.
    pub async fn clear(&self, pattern: Option<&str>) -> Result<usize> {
        let pattern = pattern.map(KeyPattern::new).transpose()?;
        let mut removed: HashSet<CacheKey> = HashSet::new();

        match &pattern {
            Some(p) => removed.extend(self.memory.invalidate_pattern(p).await),
            None => {
                removed.extend(self.memory.keys(None).await?);
                self.memory.clear().await;
            }
        }

        if let Some(tier) = self.persistence() {
            for store in [&tier.session, &tier.local] {
                for key in self.persistent_keys(store).await {
                    if pattern.as_ref().map(|p| p.matches(&key)).unwrap_or(true) {
                        self.remove_persistent(store, &key).await;
                        removed.insert(key);
                    }
                }
            }
        }

        info!(
            "Cleared {} keys{}",
            removed.len(),
            pattern.map(|p| format!(" matching {}", p.as_str())).unwrap_or_default()
        );
        Ok(removed.len())
    }

    /// Remove every entry tagged with `tag` from both tiers
    pub async fn invalidate_by_tag(&self, tag: &str) -> usize {
        let mut removed = self.memory.invalidate_by_tag(tag).await;

        if let Some(tier) = self.persistence() {
            for store in [&tier.session, &tier.local] {
                for key in self.persistent_keys(store).await {
                    let tagged = match store.get_item(&self.storage_key(&key)).await {
                        Ok(Some(bytes)) => self
                            .decode(&bytes)
                            .map(|e| e.has_tag(tag))
                            .unwrap_or(false),
                        _ => false,
                    };
                    if tagged {
                        self.remove_persistent(store, &key).await;
                        removed += 1;
                    }
                }
            }
        }

        removed
    }

    /// Logical keys across both tiers, optionally filtered
    pub async fn keys(&self, pattern: Option<&str>) -> Result<Vec<CacheKey>> {
        let compiled = pattern.map(KeyPattern::new).transpose()?;
        let mut keys: BTreeSet<CacheKey> = self.memory.keys(pattern).await?.into_iter().collect();

        if let Some(tier) = self.persistence() {
            for store in [&tier.session, &tier.local] {
                keys.extend(
                    self.persistent_keys(store)
                        .await
                        .into_iter()
                        .filter(|k| compiled.as_ref().map(|p| p.matches(k)).unwrap_or(true)),
                );
            }
        }

        Ok(keys.into_iter().collect())
    }

    // ---- batch operations ----

    /// Look up many keys concurrently; results keep the input order
    pub async fn get_many<T: DeserializeOwned>(&self, keys: &[&str]) -> Result<Vec<Option<T>>> {
        let lookups = join_all(keys.iter().map(|k| self.get::<T>(k)));
        self.with_batch_timeout(lookups, "get_many").await
    }

    /// Store many values concurrently; returns how many succeeded
    pub async fn set_many<T: Serialize>(&self, entries: &[(&str, T, SetOptions)]) -> Result<usize> {
        let writes = join_all(
            entries
                .iter()
                .map(|(key, value, options)| self.set(key, value, options.clone())),
        );
        let results = self.with_batch_timeout(writes, "set_many").await?;

        let mut ok = 0;
        for (result, (key, _, _)) in results.into_iter().zip(entries) {
            match result {
                Ok(()) => ok += 1,
                Err(e) => warn!("set_many: {} failed: {}", key, e),
            }
        }
        Ok(ok)
    }

    /// Delete many keys concurrently; returns how many were removed
    pub async fn delete_many(&self, keys: &[&str]) -> Result<usize> {
        let deletes = join_all(keys.iter().map(|k| self.delete(k)));
        let results = self.with_batch_timeout(deletes, "delete_many").await?;
        Ok(results.into_iter().filter(|removed| *removed).count())
    }

    async fn with_batch_timeout<F: Future>(&self, fut: F, context: &str) -> Result<F::Output> {
        match self.config.batch_timeout {
            Some(limit) => tokio::time::timeout(limit, fut).await.map_err(|_| {
                warn!("{} exceeded its {:?} budget", context, limit);
                CacheError::timeout(limit, context)
            }),
            None => Ok(fut.await),
        }
    }

    // ---- maintenance ----

    /// Run one eviction pass with the given policy
    pub async fn evict(&self, strategy: EvictionStrategy) -> usize {
        self.memory.evict(strategy).await
    }

    /// Drop expired entries, then run an LRU pass if memory is above 80% of the cap
    pub async fn optimize(&self) -> OptimizeReport {
        let expired_removed = self.memory.evict(EvictionStrategy::TtlFirst).await;

        let usage = self.memory.memory_usage().await;
        let evicted = if usage as f64 > self.config.max_memory_size as f64 * 0.8 {
            self.memory.evict(EvictionStrategy::Lru).await
        } else {
            0
        };

        info!(
            "Optimize removed {} expired and evicted {} entries",
            expired_removed, evicted
        );
        OptimizeReport {
            expired_removed,
            evicted,
        }
    }

    /// Load keys in the background. Errors are logged, never returned.
    pub fn prefetch(self: &Arc<Self>, options: PrefetchOptions) -> JoinHandle<PopulateSummary> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let loaded = AtomicUsize::new(0);
            let skipped = AtomicUsize::new(0);
            let failed = AtomicUsize::new(0);
            let concurrency = options.concurrency.max(1);

            stream::iter(options.keys.iter())
                .for_each_concurrent(concurrency, |key| {
                    let manager = &manager;
                    let options = &options;
                    let (loaded, skipped, failed) = (&loaded, &skipped, &failed);
                    async move {
                        if options.skip_cached && manager.memory.has(key).await {
                            skipped.fetch_add(1, Ordering::Relaxed);
                            return;
                        }
                        match options.loader.load(key).await {
                            Ok(Some(value)) => {
                                match manager.set(key, &value, options.set_options.clone()).await {
                                    Ok(()) => {
                                        loaded.fetch_add(1, Ordering::Relaxed);
                                    }
                                    Err(e) => {
                                        warn!("Prefetch could not cache {}: {}", key, e);
                                        failed.fetch_add(1, Ordering::Relaxed);
                                    }
                                }
                            }
                            Ok(None) => {
                                skipped.fetch_add(1, Ordering::Relaxed);
                            }
                            Err(e) => {
                                warn!("Prefetch load for {} failed: {}", key, e);
                                failed.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                    }
                })
                .await;

            let summary = PopulateSummary {
                loaded: loaded.into_inner(),
                skipped: skipped.into_inner(),
                failed: failed.into_inner(),
            };
            debug!("Prefetch finished: {:?}", summary);
            summary
        })
    }

    /// Bulk-populate known values in the background
    pub fn warm(self: &Arc<Self>, entries: Vec<(CacheKey, Value, SetOptions)>) -> JoinHandle<PopulateSummary> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut summary = PopulateSummary::default();
            for (key, value, options) in entries {
                match manager.set(&key, &value, options).await {
                    Ok(()) => summary.loaded += 1,
                    Err(e) => {
                        warn!("Warm-up could not cache {}: {}", key, e);
                        summary.failed += 1;
                    }
                }
            }
            info!("Cache warm-up finished: {} loaded, {} failed", summary.loaded, summary.failed);
            summary
        })
    }

    /// Manager statistics
    pub async fn stats(&self) -> ManagerStats {
        let memory = self.memory.stats().await;
        let counters = self.counters.lock().await;
        let avg_access_time_ms = if counters.access_times.is_empty() {
            0.0
        } else {
            counters.access_times.iter().sum::<f64>() / counters.access_times.len() as f64
        };

        ManagerStats {
            memory,
            hits: counters.hits,
            misses: counters.misses,
            persistent_hits: counters.persistent_hits,
            persistent_misses: counters.persistent_misses,
            promotions: counters.promotions,
            storage_errors: counters.storage_errors,
            avg_access_time_ms,
        }
    }

    /// Quota of one persistent store, if the backend reports it
    pub async fn storage_quota(&self, target: StorageTarget) -> Option<StorageQuota> {
        let tier = self.persistence()?;
        match tier.store(target).quota().await {
            Ok(quota) => quota,
            Err(e) => {
                warn!("Quota query on {} failed: {}", tier.store(target).name(), e);
                None
            }
        }
    }

    /// Stop the cleanup sweep
    pub async fn shutdown(&self) {
        if let Some(mut task) = self.cleanup_task.lock().await.take() {
            task.cancel();
        }
        info!("Tiered cache manager shut down");
    }

    // ---- persistent tier helpers ----

    fn encode(&self, entry: &CacheEntry<Value>, compress: bool) -> Result<Vec<u8>> {
        let json = serde_json::to_vec(entry)?;
        if compress {
            match self.codec.compress(&json) {
                Ok(compressed) => {
                    let mut record = Vec::with_capacity(compressed.len() + 1);
                    record.push(RECORD_COMPRESSED);
                    record.extend(compressed);
                    return Ok(record);
                }
                Err(e) => warn!("Compression unavailable, storing raw payload: {}", e),
            }
        }
        let mut record = Vec::with_capacity(json.len() + 1);
        record.push(RECORD_RAW);
        record.extend(json);
        Ok(record)
    }

    fn decode(&self, record: &[u8]) -> Result<CacheEntry<Value>> {
        match record.split_first() {
            Some((&RECORD_RAW, body)) => Ok(serde_json::from_slice(body)?),
            Some((&RECORD_COMPRESSED, body)) => {
                let json = self.codec.decompress(body)?;
                Ok(serde_json::from_slice(&json)?)
            }
            _ => Err(CacheError::Serialization(
                "unrecognized persistent record header".to_string(),
            )),
        }
    }

    async fn write_persistent(
        &self,
        tier: &PersistentTier,
        mut entry: CacheEntry<Value>,
        target: StorageTarget,
        compress: bool,
    ) -> Result<()> {
        entry.source = target.source();
        let record = self.encode(&entry, compress)?;
        let storage_key = self.storage_key(&entry.key);

        tier.store(target).set_item(&storage_key, record).await?;

        // one persistent copy per key
        let other = match target {
            StorageTarget::Session => StorageTarget::Local,
            StorageTarget::Local => StorageTarget::Session,
        };
        if let Err(e) = tier.store(other).remove_item(&storage_key).await {
            debug!("Could not drop stale copy of {} from {}: {}", entry.key, other.source(), e);
        }
        Ok(())
    }

    async fn read_persistent(&self, tier: &PersistentTier, key: &str) -> Option<(CacheEntry<Value>, StorageTarget)> {
        let storage_key = self.storage_key(key);

        for target in [StorageTarget::Session, StorageTarget::Local] {
            let store = tier.store(target);
            match store.get_item(&storage_key).await {
                Ok(Some(record)) => match self.decode(&record) {
                    Ok(entry) => return Some((entry, target)),
                    Err(e) => {
                        warn!("Dropping unreadable entry {} from {}: {}", key, store.name(), e);
                        self.counters.lock().await.storage_errors += 1;
                        self.remove_persistent(store, key).await;
                    }
                },
                Ok(None) => {}
                Err(e) => {
                    warn!("Persistent read of {} from {} failed: {}", key, store.name(), e);
                    self.counters.lock().await.storage_errors += 1;
                }
            }
        }
        None
    }

    async fn remove_persistent(&self, store: &Arc<dyn PersistentStorage>, key: &str) {
        if let Err(e) = store.remove_item(&self.storage_key(key)).await {
            warn!("Could not remove {} from {}: {}", key, store.name(), e);
            self.counters.lock().await.storage_errors += 1;
        }
    }

    async fn persistent_keys(&self, store: &Arc<dyn PersistentStorage>) -> Vec<CacheKey> {
        match store.keys().await {
            Ok(keys) => keys
                .iter()
                .filter_map(|k| self.logical_key(k))
                .map(str::to_string)
                .collect(),
            Err(e) => {
                warn!("Could not list keys of {}: {}", store.name(), e);
                self.counters.lock().await.storage_errors += 1;
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::Utc;
    use serde_json::json;

    fn manager_with_tier(config: CacheConfig) -> (Arc<TieredCacheManager>, PersistentTier, Arc<ManualClock>) {
        let tier = PersistentTier::in_memory();
        let clock = ManualClock::starting_now();
        let manager = TieredCacheManager::builder(config)
            .persistent(tier.clone())
            .clock(clock.clone())
            .build()
            .unwrap();
        (manager, tier, clock)
    }

    #[tokio::test]
    async fn test_set_and_get_typed() {
        let (manager, _tier, _clock) = manager_with_tier(CacheConfig::default());

        manager.set("a", &json!({"x": 1}), SetOptions::new()).await.unwrap();
        let value: Option<Value> = manager.get("a").await;
        assert_eq!(value, Some(json!({"x": 1})));

        let stats = manager.stats().await;
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 0);
    }

    #[tokio::test]
    async fn test_target_selection_by_ttl() {
        let (manager, tier, _clock) = manager_with_tier(CacheConfig::default());

        manager
            .set("short", &1, SetOptions::new().ttl(Duration::from_secs(60)))
            .await
            .unwrap();
        manager
            .set("forever", &2, SetOptions::new().ttl(Duration::ZERO))
            .await
            .unwrap();
        manager
            .set("pinned", &3, SetOptions::new().ttl(Duration::ZERO).target(StorageTarget::Session))
            .await
            .unwrap();

        let session_keys = tier.session.keys().await.unwrap();
        let local_keys = tier.local.keys().await.unwrap();
        assert!(session_keys.contains(&"kb-cache:short".to_string()));
        assert!(session_keys.contains(&"kb-cache:pinned".to_string()));
        assert!(local_keys.contains(&"kb-cache:forever".to_string()));
    }

    #[tokio::test]
    async fn test_memory_only_skips_persistence() {
        let (manager, tier, _clock) = manager_with_tier(CacheConfig::default());

        manager.set("m", &"x", SetOptions::new().memory_only()).await.unwrap();
        assert!(tier.session.keys().await.unwrap().is_empty());
        assert!(tier.local.keys().await.unwrap().is_empty());

        let err = manager
            .set("m", &"x", SetOptions::new().memory_only().target(StorageTarget::Local))
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::InvalidOptions(_)));
    }

    #[tokio::test]
    async fn test_compressed_record_roundtrip() {
        let config = CacheConfig::builder().enable_compression(true).build();
        let (manager, _tier, _clock) = manager_with_tier(config);

        let text = "SQLCODE -811 more than one row ".repeat(100);
        let entry = CacheEntry::new("k".to_string(), json!(text), Duration::ZERO, Utc::now());
        let record = manager.encode(&entry, true).unwrap();
        assert_eq!(record[0], RECORD_COMPRESSED);
        assert_eq!(manager.decode(&record).unwrap().value, json!(text));
    }

    #[tokio::test]
    async fn test_unknown_header_is_rejected() {
        let (manager, _tier, _clock) = manager_with_tier(CacheConfig::default());
        assert!(manager.decode(&[9, b'{', b'}']).is_err());
        assert!(manager.decode(&[]).is_err());
    }

    #[tokio::test]
    async fn test_optimize_removes_expired_then_lru() {
        let config = CacheConfig::builder().max_memory_size(1000).build();
        let (manager, _tier, clock) = manager_with_tier(config);

        manager
            .set("old", &"x".repeat(10), SetOptions::new().ttl(Duration::from_secs(1)).memory_only())
            .await
            .unwrap();
        for i in 0..4 {
            manager
                .set(&format!("k{}", i), &"y".repeat(200), SetOptions::new().memory_only())
                .await
                .unwrap();
        }
        clock.advance(Duration::from_secs(2));

        let report = manager.optimize().await;
        assert_eq!(report.expired_removed, 1);
        // 4 * 204 bytes = 816 > 800
        assert_eq!(report.evicted, 1);
    }
}
