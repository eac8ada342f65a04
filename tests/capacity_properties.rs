//! Property-based tests for the memory store's capacity bounds
//!
//! For any sequence of sets and deletes, the store SHALL stay within both
//! its byte cap and its entry-count cap, and a successful set SHALL leave
//! the written key readable.

use kb_cache::cache::{CacheConfig, EvictionStrategy, MemoryStore};
use kb_cache::clock::system_clock;
use proptest::prelude::*;
use proptest::test_runner::TestCaseError;
use std::time::Duration;

const MAX_MEMORY: usize = 2_000;
const MAX_ENTRIES: usize = 8;
const NO_TAGS: [&str; 0] = [];

#[derive(Debug, Clone)]
enum Op {
    Set { key: u8, len: usize },
    Delete { key: u8 },
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0u8..24, 0usize..400).prop_map(|(key, len)| Op::Set { key, len }),
        1 => (0u8..24).prop_map(|key| Op::Delete { key }),
    ]
}

fn eviction_strategy() -> impl Strategy<Value = EvictionStrategy> {
    prop_oneof![
        Just(EvictionStrategy::Lru),
        Just(EvictionStrategy::Lfu),
        Just(EvictionStrategy::TtlFirst),
        Just(EvictionStrategy::SizeFirst),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_capacity_never_exceeded(
        ops in prop::collection::vec(op_strategy(), 1..80),
        strategy in eviction_strategy(),
    ) {
        tokio_test::block_on(async {
            let config = CacheConfig::builder()
                .max_memory_size(MAX_MEMORY)
                .max_entries(MAX_ENTRIES)
                .eviction_strategy(strategy)
                .default_ttl(Duration::from_secs(60))
                .build();
            let store: MemoryStore<String> = MemoryStore::new(config, system_clock());

            for op in ops {
                match op {
                    Op::Set { key, len } => {
                        let key = format!("entry:{}", key);
                        store.set(&key, "v".repeat(len), None, NO_TAGS).await.unwrap();
                        prop_assert!(store.has(&key).await, "{} missing right after set", key);
                    }
                    Op::Delete { key } => {
                        store.delete(&format!("entry:{}", key)).await;
                    }
                }

                let stats = store.stats().await;
                prop_assert!(stats.memory_usage <= MAX_MEMORY, "usage {} over cap", stats.memory_usage);
                prop_assert!(stats.entries <= MAX_ENTRIES, "{} entries over cap", stats.entries);
                prop_assert_eq!(stats.entries, store.len().await);
            }
            Ok::<(), TestCaseError>(())
        })?;
    }

    #[test]
    fn prop_oversized_entry_rejected_without_side_effects(extra in 1usize..500) {
        tokio_test::block_on(async {
            let config = CacheConfig::builder().max_memory_size(MAX_MEMORY).build();
            let store: MemoryStore<String> = MemoryStore::new(config, system_clock());
            store.set("entry:small", "v".to_string(), None, NO_TAGS).await.unwrap();

            let result = store.set("entry:big", "v".repeat(MAX_MEMORY + extra), None, NO_TAGS).await;
            prop_assert!(result.is_err());
            prop_assert!(store.has("entry:small").await);
            prop_assert_eq!(store.len().await, 1);
            Ok::<(), TestCaseError>(())
        })?;
    }
}
