//! Victim selection for the eviction policies

use crate::cache::entry::CacheEntry;
use crate::cache::types::{CacheKey, EvictionStrategy};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};

/// Entries removed per pass: `ceil(len * ratio)`, at least one, at most `len`
pub fn batch_size(len: usize, ratio: f64) -> usize {
    if len == 0 {
        return 0;
    }
    let n = (len as f64 * ratio).ceil() as usize;
    n.clamp(1, len)
}

/// Pick up to `count` keys to evict, in eviction order.
///
/// `lru_order` runs from least to most recently used.
pub fn select_victims<V>(
    entries: &HashMap<CacheKey, CacheEntry<V>>,
    lru_order: &VecDeque<CacheKey>,
    strategy: EvictionStrategy,
    count: usize,
    now: DateTime<Utc>,
) -> Vec<CacheKey> {
    if count == 0 || entries.is_empty() {
        return Vec::new();
    }

    match strategy {
        EvictionStrategy::Lru => lru_order
            .iter()
            .filter(|k| entries.contains_key(*k))
            .take(count)
            .cloned()
            .collect(),

        EvictionStrategy::Lfu => {
            let mut candidates: Vec<&CacheEntry<V>> = entries.values().collect();
            candidates.sort_by(|a, b| {
                a.access_count
                    .cmp(&b.access_count)
                    .then(a.accessed.cmp(&b.accessed))
                    .then(a.key.cmp(&b.key))
            });
            take_keys(candidates, count)
        }

        EvictionStrategy::TtlFirst => {
            let mut candidates: Vec<&CacheEntry<V>> = entries.values().collect();
            // expired (0), then by expiry instant (1), eternal entries last (2)
            let rank = |e: &CacheEntry<V>| -> (u8, Option<DateTime<Utc>>) {
                if e.is_expired(now) {
                    (0, e.expires_at())
                } else if e.is_eternal() {
                    (2, None)
                } else {
                    (1, e.expires_at())
                }
            };
            candidates.sort_by(|a, b| rank(a).cmp(&rank(b)).then(a.key.cmp(&b.key)));
            take_keys(candidates, count)
        }

        EvictionStrategy::SizeFirst => {
            let mut candidates: Vec<&CacheEntry<V>> = entries.values().collect();
            candidates.sort_by(|a, b| b.size.cmp(&a.size).then(a.key.cmp(&b.key)));
            take_keys(candidates, count)
        }
    }
}

fn take_keys<V>(sorted: Vec<&CacheEntry<V>>, count: usize) -> Vec<CacheKey> {
    sorted.into_iter().take(count).map(|e| e.key.clone()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use std::time::Duration;

    fn fixture(now: DateTime<Utc>) -> (HashMap<CacheKey, CacheEntry<u32>>, VecDeque<CacheKey>) {
        let mut entries = HashMap::new();
        let specs = [
            // key, ttl secs, size, access count
            ("a", 10, 100, 5),
            ("b", 0, 500, 1),
            ("c", 2, 50, 9),
            ("d", 60, 10, 1),
        ];
        for (key, ttl, size, hits) in specs {
            let mut e = CacheEntry::new(key.to_string(), 0u32, Duration::from_secs(ttl), now)
                .with_size(size);
            e.access_count = hits;
            entries.insert(key.to_string(), e);
        }
        let lru = VecDeque::from(vec!["d".to_string(), "a".to_string(), "c".to_string(), "b".to_string()]);
        (entries, lru)
    }

    #[test]
    fn test_batch_size() {
        assert_eq!(batch_size(0, 0.1), 0);
        assert_eq!(batch_size(3, 0.1), 1);
        assert_eq!(batch_size(10, 0.1), 1);
        assert_eq!(batch_size(11, 0.1), 2);
        assert_eq!(batch_size(100, 0.1), 10);
        assert_eq!(batch_size(4, 1.0), 4);
    }

    #[test]
    fn test_lru_follows_access_order() {
        let now = Utc::now();
        let (entries, lru) = fixture(now);
        let victims = select_victims(&entries, &lru, EvictionStrategy::Lru, 2, now);
        assert_eq!(victims, vec!["d", "a"]);
    }

    #[test]
    fn test_lfu_lowest_count_then_oldest_access() {
        let now = Utc::now();
        let (mut entries, lru) = fixture(now);
        entries.get_mut("b").unwrap().accessed = now + ChronoDuration::seconds(1);
        let victims = select_victims(&entries, &lru, EvictionStrategy::Lfu, 2, now);
        assert_eq!(victims, vec!["d", "b"]);
    }

    #[test]
    fn test_ttl_first_expired_then_soonest() {
        let now = Utc::now();
        let (entries, lru) = fixture(now);
        let later = now + ChronoDuration::seconds(3);
        let victims = select_victims(&entries, &lru, EvictionStrategy::TtlFirst, 4, later);
        assert_eq!(victims, vec!["c", "a", "d", "b"]);
    }

    #[test]
    fn test_size_first_largest() {
        let now = Utc::now();
        let (entries, lru) = fixture(now);
        let victims = select_victims(&entries, &lru, EvictionStrategy::SizeFirst, 1, now);
        assert_eq!(victims, vec!["b"]);
    }
}
