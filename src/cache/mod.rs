//! # Tiered Caching Layer
//!
//! A bounded in-memory store fronting an optional persistent tier.
//!
//! ## Features
//!
//! - **TTL-Based Expiration**: lazy expiry on read plus a periodic sweep; a TTL of zero never expires
//! - **Bounded Memory**: byte and entry-count caps restored by batch eviction before `set` returns
//! - **Eviction Policies**: LRU (default), LFU, TTL-first and size-first, on pressure or on demand
//! - **Tag Invalidation**: group removal through a tag index
//! - **Persistent Fallback**: session and long-lived stores with promotion on read and optional gzip
//!
//! ## Example
//!
//! ```rust
//! use kb_cache::cache::{CacheConfig, SetOptions, TieredCacheManager};
//! use std::time::Duration;
//!
//! # async fn example() -> kb_cache::Result<()> {
//! let config = CacheConfig::builder()
//!     .default_ttl(Duration::from_secs(600))
//!     .max_entries(10_000)
//!     .max_memory_size(64 * 1024 * 1024)
//!     .build();
//!
//! let cache = TieredCacheManager::new(config)?;
//! cache
//!     .set("search:jcl", &vec!["IEFBR14"], SetOptions::new().tag("search"))
//!     .await?;
//!
//! if let Some(hits) = cache.get::<Vec<String>>("search:jcl").await {
//!     println!("Cache hit: {:?}", hits);
//! }
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod config;
pub mod entry;
pub mod eviction;
pub mod key;
pub mod manager;
pub mod memory;
pub mod pattern;
pub mod storage;
pub mod types;

pub use codec::{Codec, GzipCodec, NoopCodec};
pub use config::{CacheConfig, CacheConfigBuilder};
pub use entry::CacheEntry;
pub use key::{CacheKeyBuilder, KeyNamespace};
pub use manager::{
    Loader, ManagerStats, OptimizeReport, PersistentTier, PopulateSummary, PrefetchOptions,
    SetOptions, TieredCacheManager, TieredCacheManagerBuilder,
};
pub use memory::MemoryStore;
pub use pattern::{glob_match, KeyPattern};
pub use storage::{FileStorage, InMemoryStorage, PersistentStorage, StorageQuota};
pub use types::{CacheKey, CacheStats, EntrySource, EvictionStrategy, StorageTarget};
