//! Invalidation engine
//!
//! Holds the strategy registry and reacts to trigger events:
//!
//! - immediate strategies run inside the triggering call
//! - debounced strategies restart their timer on every firing and run once,
//!   with the last firing's event, after the window elapses
//! - cascades run the named strategies with the same event; a strategy is
//!   never run twice within one cascade chain
//! - time-triggered strategies are scheduled on registration
//!
//! Manual invalidation removes locally first and then informs the backend.
//! Backend failures are logged, never returned.

use crate::cache::manager::TieredCacheManager;
use crate::cache::pattern::KeyPattern;
use crate::cache::types::CacheKey;
use crate::clock::{system_clock, SharedClock};
use crate::error::{CacheError, Result};
use crate::invalidation::backend::{
    InvalidationBackend, InvalidationRequest, WarmupPriority, WarmupRequest,
};
use crate::invalidation::events::{
    ComponentNotification, InvalidationEvent, InvalidationHistory, InvalidationStats,
};
use crate::invalidation::strategy::{
    builtin_strategies, Action, ChangeType, InvalidationStrategy, StrategyUpdate, TriggerContext,
    TriggerEvent,
};
use crate::scheduler::ScheduledTask;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvalidationConfig {
    /// Retained invalidation events
    pub history_limit: usize,
    /// Operations drained per chunk when a batch ends
    pub batch_chunk_size: usize,
    /// Pause between drained chunks
    pub batch_delay: Duration,
    pub notification_capacity: usize,
    pub register_builtins: bool,
}

impl Default for InvalidationConfig {
    fn default() -> Self {
        Self {
            history_limit: 1000,
            batch_chunk_size: 10,
            batch_delay: Duration::from_millis(100),
            notification_capacity: 256,
            register_builtins: true,
        }
    }
}

impl InvalidationConfig {
    pub fn validate(&self) -> Result<()> {
        if self.batch_chunk_size == 0 {
            return Err(CacheError::Config("batch_chunk_size must be at least 1".to_string()));
        }
        if self.notification_capacity == 0 {
            return Err(CacheError::Config(
                "notification_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Result of one trigger call
#[derive(Debug, Clone, Default)]
pub struct TriggerReport {
    /// Runs that completed inside the call, cascades included
    pub executed: Vec<InvalidationEvent>,
    /// Strategies whose debounce timer was (re)started
    pub debounced: Vec<String>,
}

impl TriggerReport {
    pub fn affected_keys(&self) -> BTreeSet<String> {
        self.executed
            .iter()
            .flat_map(|e| e.affected_keys.iter().cloned())
            .collect()
    }
}

#[derive(Debug, Clone)]
enum BatchOp {
    Keys { keys: Vec<CacheKey>, cascade: bool },
    Pattern(String),
}

#[derive(Default)]
struct BatchState {
    active: bool,
    queue: VecDeque<BatchOp>,
}

/// Outcome of [`InvalidationEngine::end_batch`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub operations: usize,
    pub keys_invalidated: usize,
    pub discarded: usize,
    pub failed: usize,
}

/// Rule-driven invalidation over a [`TieredCacheManager`]
pub struct InvalidationEngine {
    config: InvalidationConfig,
    cache: Arc<TieredCacheManager>,
    backend: Arc<dyn InvalidationBackend>,
    clock: SharedClock,
    this: Weak<InvalidationEngine>,
    strategies: RwLock<HashMap<String, InvalidationStrategy>>,
    dependencies: RwLock<HashMap<CacheKey, HashSet<CacheKey>>>,
    context_metrics: RwLock<HashMap<String, f64>>,
    debouncers: Mutex<HashMap<String, ScheduledTask>>,
    schedules: Mutex<HashMap<String, Vec<ScheduledTask>>>,
    batch: Mutex<BatchState>,
    history: RwLock<InvalidationHistory>,
    notifications: broadcast::Sender<ComponentNotification>,
}

impl InvalidationEngine {
    /// Create an engine with the built-in strategies (unless disabled)
    pub fn new(
        cache: Arc<TieredCacheManager>,
        backend: Arc<dyn InvalidationBackend>,
        config: InvalidationConfig,
    ) -> Result<Arc<Self>> {
        Self::with_clock(cache, backend, config, system_clock())
    }

    pub fn with_clock(
        cache: Arc<TieredCacheManager>,
        backend: Arc<dyn InvalidationBackend>,
        config: InvalidationConfig,
        clock: SharedClock,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let builtins = if config.register_builtins {
            builtin_strategies()
        } else {
            Vec::new()
        };
        info!(
            "Initializing invalidation engine with {} built-in strategies",
            builtins.len()
        );

        let (notifications, _) = broadcast::channel(config.notification_capacity);
        let history = InvalidationHistory::new(config.history_limit);

        Ok(Arc::new_cyclic(|this: &Weak<InvalidationEngine>| {
            let mut schedules = HashMap::new();
            for strategy in &builtins {
                let tasks = schedule_time_triggers(this, strategy);
                if !tasks.is_empty() {
                    schedules.insert(strategy.id.clone(), tasks);
                }
            }
            let strategies = builtins.into_iter().map(|s| (s.id.clone(), s)).collect();

            Self {
                config,
                cache,
                backend,
                clock,
                this: this.clone(),
                strategies: RwLock::new(strategies),
                dependencies: RwLock::new(HashMap::new()),
                context_metrics: RwLock::new(HashMap::new()),
                debouncers: Mutex::new(HashMap::new()),
                schedules: Mutex::new(schedules),
                batch: Mutex::new(BatchState::default()),
                history: RwLock::new(history),
                notifications,
            }
        }))
    }

    pub fn cache(&self) -> &Arc<TieredCacheManager> {
        &self.cache
    }

    // ---- strategy registry ----

    /// Register (or replace) a strategy
    pub async fn add_strategy(&self, strategy: InvalidationStrategy) -> Result<()> {
        strategy.validate()?;
        let id = strategy.id.clone();

        self.cancel_debounce(&id).await;
        self.reschedule(&strategy).await;

        let replaced = self
            .strategies
            .write()
            .await
            .insert(id.clone(), strategy)
            .is_some();
        info!(
            "{} invalidation strategy: {}",
            if replaced { "Replaced" } else { "Registered" },
            id
        );
        Ok(())
    }

    /// Remove a strategy and cancel its timers
    pub async fn remove_strategy(&self, id: &str) -> bool {
        let removed = self.strategies.write().await.remove(id).is_some();
        self.cancel_debounce(id).await;
        self.schedules.lock().await.remove(id);
        if removed {
            info!("Removed invalidation strategy: {}", id);
        }
        removed
    }

    /// Apply a partial update and return the updated strategy
    pub async fn update_strategy(&self, id: &str, update: StrategyUpdate) -> Result<InvalidationStrategy> {
        let triggers_changed = update.triggers.is_some() || update.enabled.is_some();
        let updated = {
            let mut strategies = self.strategies.write().await;
            let current = strategies
                .get(id)
                .ok_or_else(|| CacheError::StrategyNotFound(id.to_string()))?;

            let mut updated = current.clone();
            updated.apply(update);
            updated.validate()?;
            strategies.insert(id.to_string(), updated.clone());
            updated
        };

        if triggers_changed {
            self.reschedule(&updated).await;
        }
        debug!("Updated invalidation strategy: {}", id);
        Ok(updated)
    }

    pub async fn get_strategy(&self, id: &str) -> Option<InvalidationStrategy> {
        self.strategies.read().await.get(id).cloned()
    }

    /// All strategies, highest priority first
    pub async fn get_strategies(&self) -> Vec<InvalidationStrategy> {
        let mut strategies: Vec<InvalidationStrategy> =
            self.strategies.read().await.values().cloned().collect();
        sort_by_priority(&mut strategies);
        strategies
    }

    // ---- manual invalidation ----

    /// Remove keys (and, with `cascade`, their dependents). Queued while batching.
    pub async fn invalidate_keys(&self, keys: &[&str], cascade: bool) -> Vec<CacheKey> {
        let keys: Vec<CacheKey> = keys.iter().map(|k| k.to_string()).collect();
        {
            let mut batch = self.batch.lock().await;
            if batch.active {
                debug!("Queued invalidation of {} keys", keys.len());
                batch.queue.push_back(BatchOp::Keys { keys, cascade });
                return Vec::new();
            }
        }
        self.apply_keys(keys, cascade).await
    }

    /// Remove keys matching a glob. Queued while batching.
    pub async fn invalidate_pattern(&self, pattern: &str) -> Result<Vec<CacheKey>> {
        KeyPattern::new(pattern)?;
        {
            let mut batch = self.batch.lock().await;
            if batch.active {
                debug!("Queued invalidation of pattern {}", pattern);
                batch.queue.push_back(BatchOp::Pattern(pattern.to_string()));
                return Ok(Vec::new());
            }
        }
        self.apply_pattern(pattern).await
    }

    /// Remove every entry carrying any of `tags`
    pub async fn invalidate_by_tags(&self, tags: &[&str]) -> usize {
        let mut removed = 0;
        for tag in tags {
            removed += self.cache.invalidate_by_tag(tag).await;
        }
        self.notify_backend(InvalidationRequest::tags(
            tags.iter().map(|t| t.to_string()).collect(),
        ))
        .await;
        info!("Invalidated {} entries for tags {:?}", removed, tags);
        removed
    }

    /// Wipe the cache and ask the backend to do the same
    pub async fn invalidate_all(&self) -> Result<usize> {
        let removed = self.cache.clear(None).await?;
        if let Err(e) = self.backend.clear().await {
            warn!("Backend clear failed, local cache already cleared: {}", e);
        }
        info!("Invalidated all {} cached keys", removed);
        Ok(removed)
    }

    async fn apply_keys(&self, keys: Vec<CacheKey>, cascade: bool) -> Vec<CacheKey> {
        let targets = if cascade {
            self.with_dependents(&keys).await
        } else {
            keys.clone()
        };

        let mut removed = Vec::new();
        for key in &targets {
            if self.cache.delete(key).await {
                removed.push(key.clone());
            }
        }

        self.notify_backend(InvalidationRequest::keys(keys, cascade)).await;
        debug!("Invalidated {} of {} keys", removed.len(), targets.len());
        removed
    }

    async fn apply_pattern(&self, pattern: &str) -> Result<Vec<CacheKey>> {
        let keys = self.cache.keys(Some(pattern)).await?;
        self.cache.clear(Some(pattern)).await?;
        self.notify_backend(InvalidationRequest::patterns(vec![pattern.to_string()]))
            .await;
        debug!("Invalidated {} keys matching {}", keys.len(), pattern);
        Ok(keys)
    }

    async fn notify_backend(&self, request: InvalidationRequest) {
        if request.is_empty() {
            return;
        }
        if let Err(e) = self.backend.invalidate(&request).await {
            warn!("Backend invalidation failed, local removal already applied: {}", e);
        }
    }

    // ---- dependency graph ----

    /// Register `dependents` as invalidated along with `key`
    pub async fn add_dependency(&self, key: &str, dependents: &[&str]) {
        let mut graph = self.dependencies.write().await;
        graph
            .entry(key.to_string())
            .or_default()
            .extend(dependents.iter().map(|d| d.to_string()));
    }

    /// Remove one dependent, or all of them when `dependent` is `None`
    pub async fn remove_dependency(&self, key: &str, dependent: Option<&str>) -> bool {
        let mut graph = self.dependencies.write().await;
        match dependent {
            None => graph.remove(key).is_some(),
            Some(dependent) => {
                let Some(set) = graph.get_mut(key) else {
                    return false;
                };
                let removed = set.remove(dependent);
                if set.is_empty() {
                    graph.remove(key);
                }
                removed
            }
        }
    }

    /// Direct dependents of `key`, sorted
    pub async fn get_dependencies(&self, key: &str) -> Vec<CacheKey> {
        let graph = self.dependencies.read().await;
        let mut deps: Vec<CacheKey> = graph
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        deps.sort();
        deps
    }

    /// `keys` followed by every transitive dependent, each once
    async fn with_dependents(&self, keys: &[CacheKey]) -> Vec<CacheKey> {
        let graph = self.dependencies.read().await;
        let mut seen: HashSet<CacheKey> = HashSet::new();
        let mut ordered = Vec::new();
        let mut queue: VecDeque<CacheKey> = keys.iter().cloned().collect();

        while let Some(key) = queue.pop_front() {
            if !seen.insert(key.clone()) {
                continue;
            }
            if let Some(dependents) = graph.get(&key) {
                let mut next: Vec<&CacheKey> = dependents.iter().collect();
                next.sort();
                queue.extend(next.into_iter().cloned());
            }
            ordered.push(key);
        }
        ordered
    }

    // ---- batch mode ----

    /// Queue subsequent key and pattern invalidations
    pub async fn start_batch(&self) {
        let mut batch = self.batch.lock().await;
        if !batch.active {
            batch.active = true;
            info!("Invalidation batch started");
        }
    }

    pub async fn is_batching(&self) -> bool {
        self.batch.lock().await.active
    }

    pub async fn queued_operations(&self) -> usize {
        self.batch.lock().await.queue.len()
    }

    /// Leave batch mode, then drain the queue in chunks or discard it
    pub async fn end_batch(&self, execute: bool) -> BatchSummary {
        let queue: Vec<BatchOp> = {
            let mut batch = self.batch.lock().await;
            batch.active = false;
            batch.queue.drain(..).collect()
        };

        let mut summary = BatchSummary::default();
        if !execute {
            summary.discarded = queue.len();
            info!("Invalidation batch discarded ({} operations)", queue.len());
            return summary;
        }

        let chunks: Vec<&[BatchOp]> = queue.chunks(self.config.batch_chunk_size).collect();
        let last = chunks.len().saturating_sub(1);
        for (i, chunk) in chunks.into_iter().enumerate() {
            for op in chunk {
                summary.operations += 1;
                match op {
                    BatchOp::Keys { keys, cascade } => {
                        summary.keys_invalidated += self.apply_keys(keys.clone(), *cascade).await.len();
                    }
                    BatchOp::Pattern(pattern) => match self.apply_pattern(pattern).await {
                        Ok(keys) => summary.keys_invalidated += keys.len(),
                        Err(e) => {
                            warn!("Batched pattern {} failed: {}", pattern, e);
                            summary.failed += 1;
                        }
                    },
                }
            }
            if i < last && !self.config.batch_delay.is_zero() {
                tokio::time::sleep(self.config.batch_delay).await;
            }
        }

        info!(
            "Invalidation batch executed: {} operations, {} keys",
            summary.operations, summary.keys_invalidated
        );
        summary
    }

    // ---- triggers ----

    pub async fn trigger_data_change(
        &self,
        path: &str,
        change_type: ChangeType,
        data: Map<String, Value>,
    ) -> TriggerReport {
        self.trigger(TriggerEvent::DataChange {
            path: path.to_string(),
            change_type,
            data,
        })
        .await
    }

    pub async fn trigger_user_action(&self, action: &str, data: Map<String, Value>) -> TriggerReport {
        self.trigger(TriggerEvent::UserAction {
            action: action.to_string(),
            data,
        })
        .await
    }

    pub async fn trigger_external_event(
        &self,
        event: &str,
        source: Option<&str>,
        data: Map<String, Value>,
    ) -> TriggerReport {
        self.trigger(TriggerEvent::ExternalEvent {
            event: event.to_string(),
            source: source.map(str::to_string),
            data,
        })
        .await
    }

    pub async fn trigger_api_response(
        &self,
        endpoint: &str,
        status: Option<u16>,
        data: Map<String, Value>,
    ) -> TriggerReport {
        self.trigger(TriggerEvent::ApiResponse {
            endpoint: endpoint.to_string(),
            status,
            data,
        })
        .await
    }

    /// Run `event` against every registered strategy, highest priority first
    pub async fn trigger(&self, event: TriggerEvent) -> TriggerReport {
        let mut matching: Vec<InvalidationStrategy> = self
            .strategies
            .read()
            .await
            .values()
            .filter(|s| s.is_triggered_by(&event))
            .cloned()
            .collect();
        sort_by_priority(&mut matching);

        let mut report = TriggerReport::default();
        if matching.is_empty() {
            debug!("No strategy matched {} trigger", event.kind());
            return report;
        }

        let ctx = self.context().await;
        for strategy in matching {
            if !strategy.conditions_pass(&event, &ctx) {
                debug!("Conditions not met for strategy {}", strategy.id);
                continue;
            }
            match strategy.debounce() {
                Some(ms) => {
                    self.debounce(&strategy.id, event.clone(), ms).await;
                    report.debounced.push(strategy.id.clone());
                }
                None => {
                    report.executed.extend(self.run_with_cascade(&strategy, &event).await);
                }
            }
        }
        report
    }

    /// Run a strategy now, ignoring triggers, conditions and debounce
    pub async fn execute_strategy(&self, id: &str, event: TriggerEvent) -> Result<Vec<InvalidationEvent>> {
        let strategy = self
            .get_strategy(id)
            .await
            .ok_or_else(|| CacheError::StrategyNotFound(id.to_string()))?;
        Ok(self.run_with_cascade(&strategy, &event).await)
    }

    /// Strategies with a debounce timer still pending
    pub async fn pending_debounces(&self) -> Vec<String> {
        let debouncers = self.debouncers.lock().await;
        let mut pending: Vec<String> = debouncers
            .iter()
            .filter(|(_, task)| task.is_active())
            .map(|(id, _)| id.clone())
            .collect();
        pending.sort();
        pending
    }

    async fn debounce(&self, id: &str, event: TriggerEvent, ms: u64) {
        let engine = self.this.clone();
        let strategy_id = id.to_string();
        let task = ScheduledTask::spawn(format!("debounce:{}", id), async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            let Some(engine) = engine.upgrade() else {
                return;
            };
            // detach so a new firing cannot abort a run in progress
            tokio::spawn(async move {
                let Some(strategy) = engine.get_strategy(&strategy_id).await else {
                    return;
                };
                debug!("Debounce window elapsed for {}", strategy_id);
                engine.run_with_cascade(&strategy, &event).await;
            });
        });

        let mut debouncers = self.debouncers.lock().await;
        match task {
            // the replaced handle aborts the earlier timer on drop
            Some(task) => {
                debouncers.insert(id.to_string(), task);
            }
            None => warn!("Debounce for {} dropped: no runtime", id),
        }
    }

    async fn cancel_debounce(&self, id: &str) {
        if let Some(mut task) = self.debouncers.lock().await.remove(id) {
            task.cancel();
        }
    }

    async fn reschedule(&self, strategy: &InvalidationStrategy) {
        let tasks = if strategy.enabled {
            schedule_time_triggers(&self.this, strategy)
        } else {
            Vec::new()
        };
        let mut schedules = self.schedules.lock().await;
        if tasks.is_empty() {
            schedules.remove(&strategy.id);
        } else {
            schedules.insert(strategy.id.clone(), tasks);
        }
    }

    /// Timer entry point for time-triggered strategies
    async fn fire_scheduled(&self, id: &str, interval_ms: u64) {
        let Some(strategy) = self.get_strategy(id).await else {
            return;
        };
        let event = TriggerEvent::Time { interval_ms };
        if !strategy.is_triggered_by(&event) {
            return;
        }
        let ctx = self.context().await;
        if !strategy.conditions_pass(&event, &ctx) {
            debug!("Scheduled strategy {} skipped: conditions not met", id);
            return;
        }
        self.run_with_cascade(&strategy, &event).await;
    }

    /// Run `root` and then its cascade targets breadth-first, each at most once
    async fn run_with_cascade(&self, root: &InvalidationStrategy, event: &TriggerEvent) -> Vec<InvalidationEvent> {
        let mut visited: HashSet<String> = HashSet::new();
        let mut queue: VecDeque<(InvalidationStrategy, Option<String>)> = VecDeque::new();
        queue.push_back((root.clone(), None));
        let mut events = Vec::new();

        while let Some((strategy, parent)) = queue.pop_front() {
            if !visited.insert(strategy.id.clone()) {
                continue;
            }
            events.push(self.run_strategy(&strategy, event, parent).await);

            for next in &strategy.cascade_rules {
                if visited.contains(next) {
                    warn!(
                        "Cascade cycle detected: {} -> {} skipped",
                        strategy.id, next
                    );
                    continue;
                }
                match self.get_strategy(next).await {
                    Some(target) if target.enabled => queue.push_back((target, Some(strategy.id.clone()))),
                    Some(_) => debug!("Cascade target {} is disabled", next),
                    None => warn!("Cascade target {} is not registered", next),
                }
            }
        }
        events
    }

    async fn run_strategy(
        &self,
        strategy: &InvalidationStrategy,
        event: &TriggerEvent,
        cascaded_from: Option<String>,
    ) -> InvalidationEvent {
        let started = tokio::time::Instant::now();
        let mut affected: Vec<CacheKey> = Vec::new();
        let mut first_error: Option<String> = None;

        for action in &strategy.actions {
            if let Err(e) = self.run_action(strategy, action, event, &mut affected).await {
                error!("Action of strategy {} failed: {}", strategy.id, e);
                first_error.get_or_insert_with(|| e.to_string());
            }
        }

        let record = InvalidationEvent {
            id: Uuid::new_v4().to_string(),
            timestamp: self.clock.now(),
            trigger: event.clone(),
            strategy: strategy.clone(),
            affected_keys: affected,
            success: first_error.is_none(),
            duration_ms: started.elapsed().as_secs_f64() * 1000.0,
            error: first_error,
            cascaded_from,
        };
        info!(
            "Strategy {} ran on {} trigger: {} keys invalidated",
            strategy.id,
            event.kind(),
            record.affected_keys.len()
        );
        self.history.write().await.record(record.clone());
        record
    }

    async fn run_action(
        &self,
        strategy: &InvalidationStrategy,
        action: &Action,
        event: &TriggerEvent,
        affected: &mut Vec<CacheKey>,
    ) -> Result<()> {
        match action {
            Action::InvalidateKeys { keys, cascade } => {
                let keys = keys.iter().map(|k| event.render(k)).collect();
                affected.extend(self.apply_keys(keys, *cascade).await);
            }
            Action::InvalidatePattern { pattern } => {
                affected.extend(self.apply_pattern(&event.render(pattern)).await?);
            }
            Action::RefreshData { keys } => {
                let keys: Vec<CacheKey> = keys.iter().map(|k| event.render(k)).collect();
                affected.extend(self.apply_keys(keys.clone(), false).await);
                let request = WarmupRequest {
                    patterns: keys,
                    priority: WarmupPriority::High,
                    batch_size: self.config.batch_chunk_size,
                };
                if let Err(e) = self.backend.warmup(&request).await {
                    warn!("Backend refresh for strategy {} failed: {}", strategy.id, e);
                }
            }
            Action::NotifyComponents { components } => {
                for component in components {
                    let notification = ComponentNotification {
                        component: component.clone(),
                        keys: affected.clone(),
                        strategy: strategy.id.clone(),
                    };
                    // no receivers is fine
                    let _ = self.notifications.send(notification);
                }
            }
            Action::ClearSection { section } => {
                let section = event.render(section);
                affected.extend(self.apply_pattern(&format!("{}:*", section)).await?);
                let tagged = self.cache.invalidate_by_tag(&section).await;
                if tagged > 0 {
                    debug!("Cleared {} entries tagged {}", tagged, section);
                }
                self.notify_backend(InvalidationRequest::tags(vec![section])).await;
            }
        }
        Ok(())
    }

    /// Metrics and dependency keys conditions are evaluated against
    async fn context(&self) -> TriggerContext {
        let stats = self.cache.memory().stats().await;
        let mut metrics = self.context_metrics.read().await.clone();
        metrics.insert("memory_utilization".to_string(), stats.utilization());
        metrics.insert("entry_count".to_string(), stats.entries as f64);
        metrics.insert("hit_rate".to_string(), stats.hit_rate());

        let dependency_keys = self
            .dependencies
            .read()
            .await
            .iter()
            .filter(|(_, deps)| !deps.is_empty())
            .map(|(key, _)| key.clone())
            .collect();

        TriggerContext {
            metrics,
            dependency_keys,
        }
    }

    /// Extra metric visible to threshold conditions; overrides nothing built in
    pub async fn set_context_metric(&self, name: &str, value: f64) {
        self.context_metrics
            .write()
            .await
            .insert(name.to_string(), value);
    }

    // ---- monitoring ----

    /// Up to `limit` events, newest first
    pub async fn history(&self, limit: usize) -> Vec<InvalidationEvent> {
        self.history.read().await.recent(limit)
    }

    pub async fn stats(&self) -> InvalidationStats {
        self.history.read().await.stats()
    }

    pub async fn clear_history(&self) {
        self.history.write().await.clear();
    }

    /// Receive component notifications
    pub fn subscribe_notifications(&self) -> broadcast::Receiver<ComponentNotification> {
        self.notifications.subscribe()
    }

    /// Cancel every timer and drop any queued batch
    pub async fn shutdown(&self) {
        self.debouncers.lock().await.clear();
        self.schedules.lock().await.clear();
        let mut batch = self.batch.lock().await;
        batch.active = false;
        batch.queue.clear();
        info!("Invalidation engine shut down");
    }
}

fn sort_by_priority(strategies: &mut [InvalidationStrategy]) {
    strategies.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.id.cmp(&b.id)));
}

fn schedule_time_triggers(engine: &Weak<InvalidationEngine>, strategy: &InvalidationStrategy) -> Vec<ScheduledTask> {
    strategy
        .time_intervals()
        .into_iter()
        .filter_map(|interval_ms| {
            let id = strategy.id.clone();
            ScheduledTask::every(
                format!("strategy:{}", strategy.id),
                Duration::from_millis(interval_ms),
                engine.clone(),
                move |engine: Arc<InvalidationEngine>| {
                    let id = id.clone();
                    async move {
                        engine.fire_scheduled(&id, interval_ms).await;
                    }
                },
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::config::CacheConfig;
    use crate::cache::manager::SetOptions;
    use crate::invalidation::backend::NoopBackend;
    use crate::invalidation::strategy::{Condition, Comparison, Trigger};

    async fn engine_with(keys: &[&str]) -> Arc<InvalidationEngine> {
        let cache = TieredCacheManager::new(CacheConfig::default()).unwrap();
        for key in keys {
            cache.set(key, &"v", SetOptions::new()).await.unwrap();
        }
        let config = InvalidationConfig {
            register_builtins: false,
            ..Default::default()
        };
        InvalidationEngine::new(cache, Arc::new(NoopBackend), config).unwrap()
    }

    fn keys_strategy(id: &str, action: &str, keys: &[&str]) -> InvalidationStrategy {
        InvalidationStrategy::new(id, id)
            .trigger(Trigger::UserAction {
                action: action.to_string(),
            })
            .action(Action::InvalidateKeys {
                keys: keys.iter().map(|k| k.to_string()).collect(),
                cascade: false,
            })
    }

    #[tokio::test]
    async fn test_registry_crud() {
        let engine = engine_with(&[]).await;
        engine.add_strategy(keys_strategy("a", "save", &["x"])).await.unwrap();
        engine
            .add_strategy(keys_strategy("b", "save", &["y"]).priority(5))
            .await
            .unwrap();

        let ids: Vec<String> = engine.get_strategies().await.into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec!["b", "a"]);

        let updated = engine
            .update_strategy(
                "a",
                StrategyUpdate {
                    priority: Some(9),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.priority, 9);

        assert!(matches!(
            engine.update_strategy("missing", StrategyUpdate::default()).await,
            Err(CacheError::StrategyNotFound(_))
        ));
        assert!(engine.remove_strategy("a").await);
        assert!(!engine.remove_strategy("a").await);
    }

    #[tokio::test]
    async fn test_immediate_strategy_runs_inside_trigger() {
        let engine = engine_with(&["entry:1", "entry:2"]).await;
        engine
            .add_strategy(keys_strategy("save", "save", &["entry:{data.id}"]))
            .await
            .unwrap();

        let mut data = Map::new();
        data.insert("id".to_string(), Value::from(1));
        let report = engine.trigger_user_action("save", data).await;

        assert_eq!(report.executed.len(), 1);
        assert_eq!(report.executed[0].affected_keys, vec!["entry:1"]);
        assert!(!engine.cache().has("entry:1").await);
        assert!(engine.cache().has("entry:2").await);
    }

    #[tokio::test]
    async fn test_conditions_are_anded() {
        let engine = engine_with(&["k"]).await;
        engine
            .add_strategy(
                keys_strategy("guarded", "save", &["k"])
                    .condition(Condition::Threshold {
                        metric: "load".to_string(),
                        operator: Comparison::Gt,
                        value: 0.5,
                    })
                    .condition(Condition::Pattern {
                        field: "action".to_string(),
                        pattern: "sa*".to_string(),
                    }),
            )
            .await
            .unwrap();

        engine.set_context_metric("load", 0.2).await;
        assert!(engine.trigger_user_action("save", Map::new()).await.executed.is_empty());

        engine.set_context_metric("load", 0.9).await;
        assert_eq!(engine.trigger_user_action("save", Map::new()).await.executed.len(), 1);
    }

    #[tokio::test]
    async fn test_cascade_cycle_runs_each_once() {
        let engine = engine_with(&["a", "b"]).await;
        engine
            .add_strategy(keys_strategy("first", "go", &["a"]).cascade_to("second"))
            .await
            .unwrap();
        engine
            .add_strategy(keys_strategy("second", "never", &["b"]).cascade_to("first"))
            .await
            .unwrap();

        let report = engine.trigger_user_action("go", Map::new()).await;
        let ids: Vec<&str> = report.executed.iter().map(|e| e.strategy.id.as_str()).collect();
        assert_eq!(ids, vec!["first", "second"]);
        assert_eq!(report.executed[1].cascaded_from.as_deref(), Some("first"));
        assert!(!engine.cache().has("b").await);
    }

    #[tokio::test]
    async fn test_dependency_cascade() {
        let engine = engine_with(&["entry:1", "search:jcl", "category:jcl", "other"]).await;
        engine.add_dependency("entry:1", &["search:jcl"]).await;
        engine.add_dependency("search:jcl", &["category:jcl", "entry:1"]).await;

        let removed = engine.invalidate_keys(&["entry:1"], true).await;
        assert_eq!(removed, vec!["entry:1", "search:jcl", "category:jcl"]);
        assert!(engine.cache().has("other").await);

        assert_eq!(engine.get_dependencies("entry:1").await, vec!["search:jcl"]);
        assert!(engine.remove_dependency("entry:1", Some("search:jcl")).await);
        assert!(engine.get_dependencies("entry:1").await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_collapses_firings() {
        let engine = engine_with(&["entry:1", "entry:2", "entry:3"]).await;
        engine
            .add_strategy(keys_strategy("debounced", "edit", &["entry:{data.id}"]).debounce_ms(200))
            .await
            .unwrap();

        for id in 1..=3 {
            let mut data = Map::new();
            data.insert("id".to_string(), Value::from(id));
            let report = engine.trigger_user_action("edit", data).await;
            assert_eq!(report.debounced, vec!["debounced"]);
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(engine.pending_debounces().await, vec!["debounced"]);

        tokio::time::sleep(Duration::from_millis(300)).await;

        let history = engine.history(10).await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].affected_keys, vec!["entry:3"]);
        assert!(engine.cache().has("entry:1").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_mode_queues_then_drains() {
        let engine = engine_with(&["a", "b", "search:x"]).await;
        engine.start_batch().await;

        assert!(engine.invalidate_keys(&["a"], false).await.is_empty());
        assert!(engine.invalidate_pattern("search:*").await.unwrap().is_empty());
        assert_eq!(engine.queued_operations().await, 2);
        assert!(engine.cache().has("a").await);

        let summary = engine.end_batch(true).await;
        assert_eq!(summary.operations, 2);
        assert_eq!(summary.keys_invalidated, 2);
        assert!(!engine.cache().has("search:x").await);
        assert!(engine.cache().has("b").await);

        engine.start_batch().await;
        engine.invalidate_keys(&["b"], false).await;
        let summary = engine.end_batch(false).await;
        assert_eq!(summary.discarded, 1);
        assert!(engine.cache().has("b").await);
    }

    #[tokio::test]
    async fn test_notifications_broadcast() {
        let engine = engine_with(&["user:1"]).await;
        let mut rx = engine.subscribe_notifications();
        engine
            .add_strategy(
                InvalidationStrategy::new("logout", "logout")
                    .trigger(Trigger::UserAction {
                        action: "logout".to_string(),
                    })
                    .action(Action::ClearSection {
                        section: "user".to_string(),
                    })
                    .action(Action::NotifyComponents {
                        components: vec!["session".to_string()],
                    }),
            )
            .await
            .unwrap();

        engine.trigger_user_action("logout", Map::new()).await;
        let notification = rx.recv().await.unwrap();
        assert_eq!(notification.component, "session");
        assert_eq!(notification.keys, vec!["user:1"]);
        assert_eq!(notification.strategy, "logout");
    }

    #[tokio::test(start_paused = true)]
    async fn test_time_trigger_scheduled_and_removed() {
        let engine = engine_with(&["metrics:a"]).await;
        engine
            .add_strategy(
                InvalidationStrategy::new("tick", "tick")
                    .trigger(Trigger::Time { interval_ms: 1000 })
                    .action(Action::InvalidatePattern {
                        pattern: "metrics:*".to_string(),
                    }),
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(engine.stats().await.total, 1);
        assert!(!engine.cache().has("metrics:a").await);

        engine.remove_strategy("tick").await;
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(engine.stats().await.total, 1);
    }
}
