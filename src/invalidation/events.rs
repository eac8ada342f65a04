//! Invalidation audit trail and component notifications

use crate::invalidation::strategy::{InvalidationStrategy, TriggerEvent};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

/// One executed strategy firing. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvalidationEvent {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub trigger: TriggerEvent,
    /// Strategy as it was when it ran
    pub strategy: InvalidationStrategy,
    pub affected_keys: Vec<String>,
    pub success: bool,
    pub duration_ms: f64,
    pub error: Option<String>,
    /// Set when the run was reached through another strategy's cascade
    pub cascaded_from: Option<String>,
}

/// Most-recent-first history with a fixed capacity
#[derive(Debug)]
pub struct InvalidationHistory {
    events: VecDeque<InvalidationEvent>,
    capacity: usize,
}

impl InvalidationHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn record(&mut self, event: InvalidationEvent) {
        self.events.push_front(event);
        self.events.truncate(self.capacity);
    }

    /// Up to `limit` events, newest first
    pub fn recent(&self, limit: usize) -> Vec<InvalidationEvent> {
        self.events.iter().take(limit).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    pub fn stats(&self) -> InvalidationStats {
        let total = self.events.len() as u64;
        let successful = self.events.iter().filter(|e| e.success).count() as u64;
        let mut by_strategy = BTreeMap::new();
        for event in &self.events {
            *by_strategy.entry(event.strategy.id.clone()).or_insert(0u64) += 1;
        }

        InvalidationStats {
            total,
            successful,
            failed: total - successful,
            success_rate: if total == 0 {
                0.0
            } else {
                successful as f64 / total as f64
            },
            avg_duration_ms: if total == 0 {
                0.0
            } else {
                self.events.iter().map(|e| e.duration_ms).sum::<f64>() / total as f64
            },
            keys_invalidated: self.events.iter().map(|e| e.affected_keys.len() as u64).sum(),
            by_strategy,
        }
    }
}

/// Derived from the retained history
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InvalidationStats {
    pub total: u64,
    pub successful: u64,
    pub failed: u64,
    pub success_rate: f64,
    pub avg_duration_ms: f64,
    pub keys_invalidated: u64,
    pub by_strategy: BTreeMap<String, u64>,
}

/// Published for every component named by a `notify_components` action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentNotification {
    pub component: String,
    pub keys: Vec<String>,
    pub strategy: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invalidation::strategy::{Action, Trigger};

    fn event(strategy: &str, success: bool, keys: usize) -> InvalidationEvent {
        InvalidationEvent {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            trigger: TriggerEvent::Time { interval_ms: 1000 },
            strategy: InvalidationStrategy::new(strategy, strategy)
                .trigger(Trigger::Time { interval_ms: 1000 })
                .action(Action::InvalidatePattern {
                    pattern: "*".to_string(),
                }),
            affected_keys: (0..keys).map(|i| format!("k{}", i)).collect(),
            success,
            duration_ms: 2.0,
            error: None,
            cascaded_from: None,
        }
    }

    #[test]
    fn test_history_is_capped_newest_first() {
        let mut history = InvalidationHistory::new(3);
        for i in 0..5 {
            history.record(event(&format!("s{}", i), true, 1));
        }
        assert_eq!(history.len(), 3);
        let recent = history.recent(10);
        assert_eq!(recent[0].strategy.id, "s4");
        assert_eq!(recent[2].strategy.id, "s2");
    }

    #[test]
    fn test_stats() {
        let mut history = InvalidationHistory::new(10);
        assert_eq!(history.stats().success_rate, 0.0);

        history.record(event("a", true, 2));
        history.record(event("a", false, 0));
        history.record(event("b", true, 3));

        let stats = history.stats();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.failed, 1);
        assert!((stats.success_rate - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(stats.keys_invalidated, 5);
        assert_eq!(stats.by_strategy.get("a"), Some(&2));
        assert_eq!(stats.avg_duration_ms, 2.0);
    }
}
