//! Integration tests for the tiered cache
//!
//! These tests verify the complete cache behavior including:
//! - Typed set/get and statistics
//! - TTL expiration across both tiers
//! - Persistent fallback, promotion and degraded storage
//! - Tag and pattern invalidation
//! - Batch operations, batch timeouts, prefetch and warm-up

use async_trait::async_trait;
use kb_cache::cache::{
    CacheConfig, EvictionStrategy, InMemoryStorage, Loader, PersistentStorage, PersistentTier,
    PrefetchOptions, SetOptions, StorageTarget, TieredCacheManager,
};
use kb_cache::clock::ManualClock;
use kb_cache::{CacheError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Article {
    id: u32,
    title: String,
}

fn tier() -> (PersistentTier, Arc<InMemoryStorage>, Arc<InMemoryStorage>) {
    let session = Arc::new(InMemoryStorage::new("session"));
    let local = Arc::new(InMemoryStorage::new("local"));
    (
        PersistentTier::new(session.clone(), local.clone()),
        session,
        local,
    )
}

#[tokio::test]
async fn test_typed_roundtrip_and_stats() {
    let cache = TieredCacheManager::new(CacheConfig::default()).unwrap();
    let article = Article {
        id: 7,
        title: "Reading SYSOUT".to_string(),
    };

    cache.set("entry:7", &article, SetOptions::new()).await.unwrap();
    assert_eq!(cache.get::<Article>("entry:7").await, Some(article));
    assert_eq!(cache.get::<Article>("entry:8").await, None);

    let stats = cache.stats().await;
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.hit_rate(), 0.5);
    assert_eq!(stats.memory.entries, 1);
}

#[tokio::test]
async fn test_empty_key_rejected() {
    let cache = TieredCacheManager::new(CacheConfig::default()).unwrap();
    let err = cache.set("", &1, SetOptions::new()).await.unwrap_err();
    assert!(matches!(err, CacheError::InvalidKey(_)));
}

#[tokio::test]
async fn test_ttl_expiration_in_both_tiers() {
    let clock = ManualClock::starting_now();
    let (persistent, session, _local) = tier();
    let cache = TieredCacheManager::builder(CacheConfig::default())
        .persistent(persistent)
        .clock(clock.clone())
        .build()
        .unwrap();

    cache
        .set("search:short", &"x", SetOptions::new().ttl(Duration::from_secs(1)))
        .await
        .unwrap();
    cache
        .set("search:forever", &"y", SetOptions::new().ttl(Duration::ZERO))
        .await
        .unwrap();
    assert_eq!(session.len().await, 1);

    clock.advance(Duration::from_secs(2));

    assert_eq!(cache.get::<String>("search:short").await, None);
    assert_eq!(cache.stats().await.misses, 1);
    assert_eq!(cache.get::<String>("search:forever").await.as_deref(), Some("y"));
    assert!(!cache.has("search:short").await);
}

#[tokio::test]
async fn test_persistent_fallback_promotes_into_memory() {
    let (persistent, _session, _local) = tier();
    let cache = TieredCacheManager::builder(CacheConfig::default())
        .persistent(persistent)
        .build()
        .unwrap();

    cache.set("entry:1", &json!({"a": 1}), SetOptions::new()).await.unwrap();
    cache.memory().clear().await;
    assert!(!cache.memory().has("entry:1").await);

    assert_eq!(cache.get_value("entry:1").await, Some(json!({"a": 1})));
    assert!(cache.memory().has("entry:1").await);

    let stats = cache.stats().await;
    assert_eq!(stats.persistent_hits, 1);
    assert_eq!(stats.promotions, 1);
}

#[tokio::test]
async fn test_fallback_disabled_skips_persistent_tier() {
    let (persistent, _session, _local) = tier();
    let config = CacheConfig::builder().fallback_to_storage(false).build();
    let cache = TieredCacheManager::builder(config)
        .persistent(persistent)
        .build()
        .unwrap();

    cache.set("entry:1", &1, SetOptions::new()).await.unwrap();
    cache.memory().clear().await;
    assert_eq!(cache.get::<i32>("entry:1").await, None);
}

#[tokio::test]
async fn test_storage_failure_degrades_to_memory() {
    let (persistent, session, _local) = tier();
    let cache = TieredCacheManager::builder(CacheConfig::default())
        .persistent(persistent)
        .build()
        .unwrap();

    session.set_failing(true);
    cache.set("entry:1", &"kept", SetOptions::new()).await.unwrap();

    assert_eq!(cache.get::<String>("entry:1").await.as_deref(), Some("kept"));
    assert_eq!(cache.stats().await.storage_errors, 1);
}

#[tokio::test]
async fn test_quota_exceeded_is_not_fatal() {
    let session = Arc::new(InMemoryStorage::new("session").with_quota(64));
    let local = Arc::new(InMemoryStorage::new("local"));
    let cache = TieredCacheManager::builder(CacheConfig::default())
        .persistent(PersistentTier::new(session, local))
        .build()
        .unwrap();

    let big = "x".repeat(500);
    cache.set("entry:big", &big, SetOptions::new()).await.unwrap();

    assert_eq!(cache.get::<String>("entry:big").await, Some(big));
    assert_eq!(cache.stats().await.storage_errors, 1);

    let quota = cache.storage_quota(StorageTarget::Session).await.unwrap();
    assert_eq!(quota.quota, 64);
    assert_eq!(quota.usage, 0);
    assert!(cache.storage_quota(StorageTarget::Local).await.is_none());
}

#[tokio::test]
async fn test_tag_and_pattern_invalidation_span_tiers() {
    let (persistent, _session, _local) = tier();
    let cache = TieredCacheManager::builder(CacheConfig::default())
        .persistent(persistent)
        .build()
        .unwrap();

    cache.set("search:a", &1, SetOptions::new().tag("search")).await.unwrap();
    cache.set("search:b", &2, SetOptions::new().tag("search")).await.unwrap();
    cache.set("entry:1", &3, SetOptions::new()).await.unwrap();
    cache.set("entry:2", &4, SetOptions::new()).await.unwrap();

    // memory copy plus persistent copy per key
    assert_eq!(cache.invalidate_by_tag("search").await, 4);
    assert!(!cache.has("search:a").await);

    assert_eq!(cache.clear(Some("entry:*")).await.unwrap(), 2);
    assert!(cache.keys(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_memory_only_never_persists() {
    let (persistent, session, local) = tier();
    let cache = TieredCacheManager::builder(CacheConfig::default())
        .persistent(persistent)
        .build()
        .unwrap();

    cache.set("user:prefs", &"dark", SetOptions::new().memory_only()).await.unwrap();
    assert!(session.is_empty().await);
    assert!(local.is_empty().await);
}

#[tokio::test]
async fn test_memory_only_overwrite_drops_persisted_value() {
    let (persistent, session, local) = tier();
    let cache = TieredCacheManager::builder(CacheConfig::default())
        .persistent(persistent)
        .build()
        .unwrap();

    cache.set("user:prefs", &"v1", SetOptions::new()).await.unwrap();
    assert_eq!(session.len().await, 1);
    cache.set("user:prefs", &"v2", SetOptions::new().memory_only()).await.unwrap();
    assert!(session.is_empty().await);
    assert!(local.is_empty().await);

    cache.memory().delete("user:prefs").await;
    assert_eq!(cache.get::<String>("user:prefs").await, None);
}

#[tokio::test]
async fn test_failed_overwrite_drops_persisted_value() {
    let session = Arc::new(InMemoryStorage::new("session").with_quota(600));
    let local = Arc::new(InMemoryStorage::new("local").with_quota(600));
    let cache = TieredCacheManager::builder(CacheConfig::default())
        .persistent(PersistentTier::new(session.clone(), local.clone()))
        .build()
        .unwrap();

    cache.set("entry:1", &"v1", SetOptions::new()).await.unwrap();
    assert_eq!(session.len().await, 1);

    let big = "x".repeat(1000);
    cache.set("entry:1", &big, SetOptions::new()).await.unwrap();
    assert_eq!(cache.stats().await.storage_errors, 1);
    assert!(session.is_empty().await);
    assert!(local.is_empty().await);

    assert_eq!(cache.get::<String>("entry:1").await, Some(big));
    cache.memory().delete("entry:1").await;
    assert_eq!(cache.get::<String>("entry:1").await, None);
}

#[tokio::test]
async fn test_batch_operations_keep_order() {
    let cache = TieredCacheManager::new(CacheConfig::default()).unwrap();
    let written = cache
        .set_many(&[
            ("entry:1", 1, SetOptions::new()),
            ("entry:2", 2, SetOptions::new()),
        ])
        .await
        .unwrap();
    assert_eq!(written, 2);

    let values: Vec<Option<i32>> = cache.get_many(&["entry:2", "entry:9", "entry:1"]).await.unwrap();
    assert_eq!(values, vec![Some(2), None, Some(1)]);

    assert_eq!(cache.delete_many(&["entry:1", "entry:9"]).await.unwrap(), 1);
}

struct SlowStorage;

#[async_trait]
impl PersistentStorage for SlowStorage {
    fn name(&self) -> &str {
        "slow"
    }

    async fn get_item(&self, _key: &str) -> Result<Option<Vec<u8>>> {
        tokio::time::sleep(Duration::from_secs(10)).await;
        Ok(None)
    }

    async fn set_item(&self, _key: &str, _value: Vec<u8>) -> Result<()> {
        Ok(())
    }

    async fn remove_item(&self, _key: &str) -> Result<()> {
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
}

#[tokio::test(start_paused = true)]
async fn test_batch_timeout() {
    let config = CacheConfig::builder()
        .batch_timeout(Duration::from_millis(100))
        .build();
    let cache = TieredCacheManager::builder(config)
        .persistent(PersistentTier::new(Arc::new(SlowStorage), Arc::new(SlowStorage)))
        .build()
        .unwrap();

    let err = cache.get_many::<i32>(&["entry:1"]).await.unwrap_err();
    assert!(matches!(err, CacheError::Timeout { timeout_ms: 100, .. }));
}

struct CatalogLoader;

#[async_trait]
impl Loader for CatalogLoader {
    async fn load(&self, key: &str) -> Result<Option<Value>> {
        match key {
            "entry:missing" => Ok(None),
            "entry:broken" => Err(CacheError::Backend("catalog offline".to_string())),
            other => Ok(Some(json!({ "key": other }))),
        }
    }
}

#[tokio::test]
async fn test_prefetch_and_warm() {
    let cache = TieredCacheManager::new(CacheConfig::default()).unwrap();
    cache.set("entry:cached", &0, SetOptions::new()).await.unwrap();

    let keys = ["entry:1", "entry:2", "entry:missing", "entry:broken", "entry:cached"]
        .iter()
        .map(|k| k.to_string())
        .collect();
    let summary = cache
        .prefetch(PrefetchOptions::new(keys, Arc::new(CatalogLoader)))
        .await
        .unwrap();

    assert_eq!(summary.loaded, 2);
    assert_eq!(summary.skipped, 2);
    assert_eq!(summary.failed, 1);
    assert_eq!(cache.get_value("entry:2").await, Some(json!({"key": "entry:2"})));

    let warmed = cache
        .warm(vec![
            ("category:jcl".to_string(), json!(["IEFBR14"]), SetOptions::new()),
            ("".to_string(), json!(null), SetOptions::new()),
        ])
        .await
        .unwrap();
    assert_eq!(warmed.loaded, 1);
    assert_eq!(warmed.failed, 1);
}

#[tokio::test]
async fn test_on_demand_eviction_and_optimize() {
    let clock = ManualClock::starting_now();
    let cache = TieredCacheManager::builder(CacheConfig::default())
        .clock(clock.clone())
        .build()
        .unwrap();

    cache
        .set("entry:old", &1, SetOptions::new().ttl(Duration::from_secs(1)))
        .await
        .unwrap();
    cache.set("entry:new", &2, SetOptions::new()).await.unwrap();
    clock.advance(Duration::from_secs(5));

    assert_eq!(cache.evict(EvictionStrategy::TtlFirst).await, 1);
    let report = cache.optimize().await;
    assert_eq!(report.expired_removed, 0);
    assert_eq!(report.evicted, 0);
    assert!(cache.has("entry:new").await);
}

#[tokio::test]
async fn test_long_lived_entries_survive_restart_on_disk() {
    let tmp = TempDir::new().unwrap();

    let cache = TieredCacheManager::builder(CacheConfig::default())
        .persistent(PersistentTier::on_disk(tmp.path()).await.unwrap())
        .build()
        .unwrap();
    cache
        .set("user:prefs", &"dark", SetOptions::new().ttl(Duration::from_secs(2 * 3600)))
        .await
        .unwrap();
    cache.set("search:jcl", &"session only", SetOptions::new()).await.unwrap();
    cache.shutdown().await;
    drop(cache);

    let restarted = TieredCacheManager::builder(CacheConfig::default())
        .persistent(PersistentTier::on_disk(tmp.path()).await.unwrap())
        .build()
        .unwrap();
    assert_eq!(restarted.get::<String>("user:prefs").await.as_deref(), Some("dark"));
    assert_eq!(restarted.get::<String>("search:jcl").await, None);
}
