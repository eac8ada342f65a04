//! # Knowledge Base Cache (kb-cache)
//!
//! Client-side caching and invalidation for a knowledge base assistant,
//! with the performance telemetry needed to watch it.
//!
//! ## Features
//!
//! - Bounded in-memory store with TTL expiry, tags and pluggable eviction
//! - Tiered manager falling back to session and long-lived persistent stores
//! - Rule-driven invalidation engine with debounce, cascades and dependencies
//! - Sliding-window metrics collector with SLA evaluation and reports
//! - Topic-based monitoring hub and a concurrent benchmark runner
//!
//! ## Caching
//!
//! ```no_run
//! use kb_cache::cache::{CacheKeyBuilder, KeyNamespace, SetOptions, TieredCacheManager};
//! use kb_cache::cache::CacheConfig;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let cache = TieredCacheManager::new(CacheConfig::default())?;
//!
//!     let key = CacheKeyBuilder::new(KeyNamespace::Search)
//!         .identifier("jcl")
//!         .param("limit", "10")
//!         .build();
//!     cache
//!         .set(&key, &vec!["IEFBR14"], SetOptions::new().ttl(Duration::from_secs(60)))
//!         .await?;
//!
//!     let hits: Option<Vec<String>> = cache.get(&key).await;
//!     println!("{:?}", hits);
//!     Ok(())
//! }
//! ```
//!
//! ## Invalidation
//!
//! ```no_run
//! use kb_cache::cache::{CacheConfig, TieredCacheManager};
//! use kb_cache::invalidation::{InvalidationConfig, InvalidationEngine, NoopBackend};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let cache = TieredCacheManager::new(CacheConfig::default())?;
//!     let engine = InvalidationEngine::new(cache, Arc::new(NoopBackend), InvalidationConfig::default())?;
//!
//!     // Built-in strategy: clears the user section and notifies the session
//!     let report = engine.trigger_user_action("logout", Default::default()).await;
//!     println!("{} keys invalidated", report.affected_keys().len());
//!     Ok(())
//! }
//! ```
//!
//! ## Metrics
//!
//! ```no_run
//! use kb_cache::metrics::{ExportFormat, MetricsCollector, MetricsConfig, PerformanceReportGenerator, ReportPeriod};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let collector = MetricsCollector::new(MetricsConfig::default())?;
//!     collector.record_query("jcl abend", 120.0, true).await;
//!
//!     let generator = PerformanceReportGenerator::new(collector);
//!     let report = generator.generate_report(ReportPeriod::Hourly).await;
//!     println!("{}", generator.export(&report, ExportFormat::Csv)?);
//!     Ok(())
//! }
//! ```

pub mod benchmark;
pub mod cache;
pub mod clock;
pub mod error;
pub mod invalidation;
pub mod metrics;
pub mod monitor;
pub mod scheduler;

// Re-export main types for convenience
pub use benchmark::{AbortHandle, BenchmarkConfig, BenchmarkResult, BenchmarkRunner};
pub use cache::{
    CacheConfig, CacheConfigBuilder, CacheEntry, CacheKey, CacheKeyBuilder, CacheStats, EvictionStrategy,
    KeyNamespace, MemoryStore, SetOptions, StorageTarget, TieredCacheManager,
};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use error::{CacheError, Result};
pub use invalidation::{
    InvalidationBackend, InvalidationConfig, InvalidationEngine, InvalidationStrategy, NoopBackend,
    TriggerEvent,
};
pub use metrics::{MetricsCollector, MetricsConfig, MetricsSnapshot, PerformanceReportGenerator};
pub use monitor::{Envelope, MonitorConfig, MonitorHub, Topic};
