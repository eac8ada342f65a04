//! Rule-driven cache invalidation
//!
//! Strategies pair triggers (data changes, user actions, external events,
//! API responses, timers) with actions over the tiered cache. The
//! [`InvalidationEngine`] evaluates them, handles debounce and cascades,
//! tracks key dependencies and keeps an audit history.
//!
//! # Example
//!
//! ```no_run
//! use kb_cache::cache::{CacheConfig, TieredCacheManager};
//! use kb_cache::invalidation::{ChangeType, InvalidationConfig, InvalidationEngine, NoopBackend};
//! use std::sync::Arc;
//!
//! # async fn example() -> kb_cache::Result<()> {
//! let cache = TieredCacheManager::new(CacheConfig::default())?;
//! let engine = InvalidationEngine::new(cache, Arc::new(NoopBackend), InvalidationConfig::default())?;
//!
//! engine.add_dependency("entry:42", &["search:jcl"]).await;
//! engine.invalidate_keys(&["entry:42"], true).await;
//!
//! engine
//!     .trigger_data_change("entries/42", ChangeType::Update, Default::default())
//!     .await;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod engine;
pub mod events;
pub mod strategy;

pub use backend::{InvalidationBackend, InvalidationRequest, NoopBackend, WarmupPriority, WarmupRequest};
pub use engine::{BatchSummary, InvalidationConfig, InvalidationEngine, TriggerReport};
pub use events::{ComponentNotification, InvalidationEvent, InvalidationHistory, InvalidationStats};
pub use strategy::{
    builtin_strategies, Action, ChangeType, Comparison, Condition, InvalidationStrategy, StrategyUpdate,
    Trigger, TriggerContext, TriggerEvent, PERIODIC_CLEANUP_STRATEGY, SEARCH_RESULTS_STRATEGY,
    USER_LOGOUT_STRATEGY,
};
