//! Bounded in-memory store with LRU bookkeeping, TTL and tag indexing

use crate::cache::{
    config::CacheConfig,
    entry::CacheEntry,
    eviction::{batch_size, select_victims},
    pattern::KeyPattern,
    types::{CacheKey, CacheStats, EvictionStrategy},
};
use crate::clock::SharedClock;
use crate::error::{CacheError, Result};
use crate::scheduler::ScheduledTask;
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Capacity- and memory-bounded key/entry map
///
/// - Lazy expiry on every read plus an optional periodic sweep
/// - Pressure eviction removes `eviction_ratio` of the entries per pass
///   (minimum one) until the incoming entry fits
/// - `memory_usage <= max_memory_size` holds whenever `set` returns
pub struct MemoryStore<V> {
    config: CacheConfig,
    clock: SharedClock,
    state: RwLock<StoreState<V>>,
}

/// Internal storage
struct StoreState<V> {
    /// Main storage: key -> entry
    entries: HashMap<CacheKey, CacheEntry<V>>,

    /// LRU tracking: front is least recently used
    lru_queue: VecDeque<CacheKey>,

    /// tag -> keys carrying it
    tag_index: HashMap<String, HashSet<CacheKey>>,

    /// Running counters
    stats: CacheStats,

    /// Sum of live entry sizes
    current_size: usize,
}

impl<V> StoreState<V> {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            lru_queue: VecDeque::new(),
            tag_index: HashMap::new(),
            stats: CacheStats::default(),
            current_size: 0,
        }
    }

    fn remove_entry(&mut self, key: &str) -> Option<CacheEntry<V>> {
        let entry = self.entries.remove(key)?;
        self.lru_queue.retain(|k| k != key);
        for tag in &entry.tags {
            if let Some(keys) = self.tag_index.get_mut(tag) {
                keys.remove(key);
                if keys.is_empty() {
                    self.tag_index.remove(tag);
                }
            }
        }
        self.current_size = self.current_size.saturating_sub(entry.size);
        Some(entry)
    }

    fn insert_entry(&mut self, entry: CacheEntry<V>) {
        let key = entry.key.clone();
        for tag in &entry.tags {
            self.tag_index
                .entry(tag.clone())
                .or_default()
                .insert(key.clone());
        }
        self.current_size += entry.size;
        self.entries.insert(key.clone(), entry);
        self.lru_queue.push_back(key);
    }

    fn touch(&mut self, key: &str) {
        if let Some(pos) = self.lru_queue.iter().position(|k| k == key) {
            if let Some(k) = self.lru_queue.remove(pos) {
                self.lru_queue.push_back(k);
            }
        }
    }

    fn snapshot_stats(&self, max_memory_size: usize) -> CacheStats {
        let mut stats = self.stats.clone();
        stats.entries = self.entries.len();
        stats.memory_usage = self.current_size;
        stats.max_memory_size = max_memory_size;
        stats
    }
}

impl<V> MemoryStore<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Create a new store
    pub fn new(config: CacheConfig, clock: SharedClock) -> Self {
        info!(
            "Initializing memory store (max {} bytes, {} entries, {} eviction)",
            config.max_memory_size, config.max_entries, config.eviction_strategy
        );

        Self {
            config,
            clock,
            state: RwLock::new(StoreState::new()),
        }
    }

    /// Store configuration
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Get a live value, updating access bookkeeping
    pub async fn get(&self, key: &str) -> Option<V> {
        self.get_entry(key).await.map(|e| e.value)
    }

    /// Get a live entry snapshot, updating access bookkeeping
    pub async fn get_entry(&self, key: &str) -> Option<CacheEntry<V>> {
        let now = self.clock.now();
        let mut state = self.state.write().await;

        let expired = match state.entries.get(key).map(|e| e.is_expired(now)) {
            Some(expired) => expired,
            None => {
                debug!("Cache miss: {}", key);
                state.stats.misses += 1;
                return None;
            }
        };

        if expired {
            debug!("Cache entry expired: {}", key);
            state.remove_entry(key);
            state.stats.misses += 1;
            state.stats.expirations += 1;
            return None;
        }

        state.touch(key);
        state.stats.hits += 1;
        let entry = state.entries.get_mut(key)?;
        entry.mark_accessed(now);
        debug!("Cache hit: {}", key);
        Some(entry.clone())
    }

    /// Whether a live entry exists. Removes it if it has expired.
    pub async fn has(&self, key: &str) -> bool {
        let now = self.clock.now();
        let mut state = self.state.write().await;

        match state.entries.get(key).map(|e| e.is_expired(now)) {
            Some(false) => true,
            Some(true) => {
                state.remove_entry(key);
                state.stats.expirations += 1;
                false
            }
            None => false,
        }
    }

    /// Insert a prepared entry; `entry.size` must already be estimated.
    ///
    /// Evicts by the configured policy until the entry fits. Fails only if the
    /// entry alone exceeds the memory cap.
    pub async fn insert_entry(&self, entry: CacheEntry<V>) -> Result<()> {
        if entry.size > self.config.max_memory_size {
            warn!(
                "Rejecting {}: {} bytes exceeds memory cap of {}",
                entry.key, entry.size, self.config.max_memory_size
            );
            return Err(CacheError::EntryTooLarge {
                size: entry.size,
                max: self.config.max_memory_size,
            });
        }

        let now = self.clock.now();
        let mut state = self.state.write().await;

        if state.remove_entry(&entry.key).is_some() {
            debug!("Updating existing cache entry: {}", entry.key);
        } else {
            debug!("Inserting new cache entry: {}", entry.key);
        }

        self.make_room(&mut state, entry.size, now);
        state.insert_entry(entry);
        Ok(())
    }

    /// Remove an entry. Returns whether anything was removed.
    pub async fn delete(&self, key: &str) -> bool {
        let mut state = self.state.write().await;
        if state.remove_entry(key).is_some() {
            state.stats.invalidations += 1;
            debug!("Removed cache entry: {}", key);
            true
        } else {
            false
        }
    }

    /// Remove every entry tagged with `tag`
    pub async fn invalidate_by_tag(&self, tag: &str) -> usize {
        let mut state = self.state.write().await;
        let keys: Vec<CacheKey> = state
            .tag_index
            .get(tag)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default();

        for key in &keys {
            state.remove_entry(key);
        }
        state.stats.invalidations += keys.len() as u64;

        info!("Invalidated {} entries with tag: {}", keys.len(), tag);
        keys.len()
    }

    /// Remove every entry whose key matches a glob pattern
    pub async fn invalidate_pattern(&self, pattern: &KeyPattern) -> Vec<CacheKey> {
        let mut state = self.state.write().await;
        let keys: Vec<CacheKey> = state
            .entries
            .keys()
            .filter(|k| pattern.matches(k))
            .cloned()
            .collect();

        for key in &keys {
            state.remove_entry(key);
        }
        state.stats.invalidations += keys.len() as u64;

        debug!("Invalidated {} entries matching {}", keys.len(), pattern.as_str());
        keys
    }

    /// Live keys, optionally filtered by a glob pattern
    pub async fn keys(&self, pattern: Option<&str>) -> Result<Vec<CacheKey>> {
        let pattern = pattern.map(KeyPattern::new).transpose()?;
        let now = self.clock.now();
        let state = self.state.read().await;

        let mut keys: Vec<CacheKey> = state
            .entries
            .values()
            .filter(|e| !e.is_expired(now))
            .filter(|e| pattern.as_ref().map(|p| p.matches(&e.key)).unwrap_or(true))
            .map(|e| e.key.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    /// Run an eviction pass on demand.
    ///
    /// `TtlFirst` removes only expired entries; the other policies remove one
    /// batch (`eviction_ratio` of the entries, minimum one).
    pub async fn evict(&self, strategy: EvictionStrategy) -> usize {
        if strategy == EvictionStrategy::TtlFirst {
            return self.cleanup_expired().await;
        }

        let now = self.clock.now();
        let mut state = self.state.write().await;
        let count = batch_size(state.entries.len(), self.config.eviction_ratio);
        let victims = select_victims(&state.entries, &state.lru_queue, strategy, count, now);

        for key in &victims {
            state.remove_entry(key);
        }
        state.stats.evictions += victims.len() as u64;

        info!("Evicted {} entries using {} policy", victims.len(), strategy);
        victims.len()
    }

    /// Remove all expired entries
    pub async fn cleanup_expired(&self) -> usize {
        let now = self.clock.now();
        let mut state = self.state.write().await;

        let expired: Vec<CacheKey> = state
            .entries
            .values()
            .filter(|e| e.is_expired(now))
            .map(|e| e.key.clone())
            .collect();

        for key in &expired {
            state.remove_entry(key);
        }
        state.stats.expirations += expired.len() as u64;

        if !expired.is_empty() {
            debug!("Cleaned up {} expired entries", expired.len());
        }
        expired.len()
    }

    /// Clear all entries from the store
    pub async fn clear(&self) -> usize {
        let mut state = self.state.write().await;

        let count = state.entries.len();
        state.entries.clear();
        state.lru_queue.clear();
        state.tag_index.clear();
        state.current_size = 0;
        state.stats.invalidations += count as u64;

        info!("Cleared {} entries from memory store", count);
        count
    }

    /// Get store statistics
    pub async fn stats(&self) -> CacheStats {
        let state = self.state.read().await;
        state.snapshot_stats(self.config.max_memory_size)
    }

    /// Current memory usage in bytes
    pub async fn memory_usage(&self) -> usize {
        self.state.read().await.current_size
    }

    /// Number of resident entries (expired ones included until touched)
    pub async fn len(&self) -> usize {
        self.state.read().await.entries.len()
    }

    /// Check if store is empty
    pub async fn is_empty(&self) -> bool {
        self.state.read().await.entries.is_empty()
    }

    /// Start the periodic expiry sweep. The task stops when the store is dropped.
    pub fn start_cleanup(self: &Arc<Self>) -> Option<ScheduledTask> {
        let interval = self.config.cleanup_interval;
        if !self.config.enable_auto_cleanup || interval.is_zero() {
            return None;
        }

        info!("Starting automatic cache cleanup task (interval: {:?})", interval);
        ScheduledTask::every(
            "memory-store-cleanup",
            interval,
            Arc::downgrade(self),
            |store: Arc<Self>| async move {
                let removed = store.cleanup_expired().await;
                if removed > 0 {
                    debug!("Auto cleanup removed {} entries", removed);
                }
            },
        )
    }

    /// Evict until `needed` more bytes and one more entry fit
    fn make_room(&self, state: &mut StoreState<V>, needed: usize, now: chrono::DateTime<chrono::Utc>) {
        let max_size = self.config.max_memory_size;
        let max_entries = self.config.max_entries;

        while !state.entries.is_empty()
            && (state.current_size + needed > max_size || state.entries.len() >= max_entries)
        {
            let count = batch_size(state.entries.len(), self.config.eviction_ratio);
            let victims = select_victims(
                &state.entries,
                &state.lru_queue,
                self.config.eviction_strategy,
                count,
                now,
            );
            if victims.is_empty() {
                break;
            }
            for key in &victims {
                debug!("Evicting entry under memory pressure: {}", key);
                state.remove_entry(key);
            }
            state.stats.evictions += victims.len() as u64;
        }
    }
}

impl<V> MemoryStore<V>
where
    V: Clone + Serialize + Send + Sync + 'static,
{
    /// Store a value. `ttl` defaults to the configured TTL; zero never expires.
    pub async fn set<I, S>(&self, key: &str, value: V, ttl: Option<Duration>, tags: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if key.is_empty() {
            return Err(CacheError::InvalidKey("key must not be empty".to_string()));
        }

        let size = CacheEntry::estimate_size(key, &value)?;
        let ttl = ttl.unwrap_or_else(|| self.config.ttl_with_jitter());
        let entry = CacheEntry::new(key.to_string(), value, ttl, self.clock.now())
            .with_tags(tags)
            .with_size(size);

        self.insert_entry(entry).await
    }
}
