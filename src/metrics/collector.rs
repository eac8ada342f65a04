//! Sliding-window metrics collector
//!
//! Samples are appended into `type:tags` buckets and kept for
//! [`MetricsConfig::window`]. Every aggregate (percentiles, rates, SLA status)
//! is recomputed from the live samples on each query.
//!
//! There is no process-wide instance: create one collector at startup, hand
//! `Arc<MetricsCollector>` to its users and call [`MetricsCollector::shutdown`]
//! when done.

use crate::cache::types::EntrySource;
use crate::clock::{system_clock, SharedClock};
use crate::error::Result;
use crate::metrics::percentile::PercentileSummary;
use crate::metrics::types::{
    bucket_key, CacheMetrics, MetricType, MetricsConfig, MetricsSnapshot, PerformanceMetric,
    QueryMetrics, ResponseMetrics, Severity, SlaStatus, SlaTargets, SlaViolation, SlowQuery,
    ViolationType,
};
use crate::scheduler::ScheduledTask;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::{json, Map, Value};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Default)]
struct CollectorState {
    buckets: HashMap<String, VecDeque<PerformanceMetric>>,
    total: usize,
}

impl CollectorState {
    fn push(&mut self, metric: PerformanceMetric, max_samples: usize) {
        self.buckets
            .entry(metric.bucket())
            .or_default()
            .push_back(metric);
        self.total += 1;

        while self.total > max_samples {
            if !self.drop_oldest() {
                break;
            }
        }
    }

    fn drop_oldest(&mut self) -> bool {
        let oldest = self
            .buckets
            .iter()
            .filter_map(|(bucket, samples)| samples.front().map(|m| (m.timestamp, bucket.clone())))
            .min();
        match oldest {
            Some((_, bucket)) => {
                if let Some(samples) = self.buckets.get_mut(&bucket) {
                    samples.pop_front();
                    self.total -= 1;
                }
                true
            }
            None => false,
        }
    }

    fn purge_before(&mut self, cutoff: DateTime<Utc>) -> usize {
        let mut removed = 0;
        for samples in self.buckets.values_mut() {
            let before = samples.len();
            samples.retain(|m| m.timestamp >= cutoff);
            removed += before - samples.len();
        }
        self.buckets.retain(|_, samples| !samples.is_empty());
        self.total -= removed;
        removed
    }
}

/// Handle returned by [`MetricsCollector::subscribe`]; dropping it unsubscribes
#[derive(Debug)]
pub struct Subscription {
    task: ScheduledTask,
}

impl Subscription {
    pub fn unsubscribe(mut self) {
        self.task.cancel();
    }

    pub fn is_active(&self) -> bool {
        self.task.is_active()
    }
}

/// Records samples and derives query, cache, response and SLA views
pub struct MetricsCollector {
    config: MetricsConfig,
    clock: SharedClock,
    state: RwLock<CollectorState>,
    sweep_task: Mutex<Option<ScheduledTask>>,
}

impl MetricsCollector {
    /// Create a collector and start its window sweep
    pub fn new(config: MetricsConfig) -> Result<Arc<Self>> {
        Self::with_clock(config, system_clock())
    }

    pub fn with_clock(config: MetricsConfig, clock: SharedClock) -> Result<Arc<Self>> {
        config.validate()?;
        info!(
            "Initializing metrics collector (window {:?}, sweep every {:?})",
            config.window, config.sweep_interval
        );

        let sweep_interval = config.sweep_interval;
        Ok(Arc::new_cyclic(|weak| {
            let sweep_task = if sweep_interval.is_zero() {
                None
            } else {
                ScheduledTask::every(
                    "metrics-sweep",
                    sweep_interval,
                    weak.clone(),
                    |collector: Arc<MetricsCollector>| async move {
                        collector.sweep().await;
                    },
                )
            };
            Self {
                config,
                clock,
                state: RwLock::new(CollectorState::default()),
                sweep_task: Mutex::new(sweep_task),
            }
        }))
    }

    pub fn config(&self) -> &MetricsConfig {
        &self.config
    }

    // ---- recording ----

    /// Append a sample; returns its id
    pub async fn record_metric<I, S>(
        &self,
        metric_type: MetricType,
        value: f64,
        metadata: Map<String, Value>,
        tags: I,
    ) -> String
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let metric = PerformanceMetric {
            id: Uuid::new_v4().to_string(),
            timestamp: self.clock.now(),
            metric_type,
            value,
            metadata,
            tags: tags.into_iter().map(Into::into).collect(),
        };
        let id = metric.id.clone();
        self.state.write().await.push(metric, self.config.max_samples);
        id
    }

    /// Record a query execution
    pub async fn record_query(&self, query: &str, duration_ms: f64, success: bool) -> String {
        let metadata = object(json!({ "query": query, "success": success }));
        let outcome = if success { "success" } else { "error" };
        self.record_metric(MetricType::Query, duration_ms, metadata, ["query", outcome])
            .await
    }

    /// Record a cache lookup outcome
    pub async fn record_cache_event(
        &self,
        key: &str,
        hit: bool,
        source: Option<EntrySource>,
        duration_ms: f64,
    ) -> String {
        let metadata = object(json!({ "key": key, "hit": hit, "source": source }));
        let outcome = if hit { "hit" } else { "miss" };
        self.record_metric(MetricType::Cache, duration_ms, metadata, [outcome])
            .await
    }

    /// Record one served request; `status >= 400` counts as a failure
    pub async fn record_response_time(&self, endpoint: &str, duration_ms: f64, status: Option<u16>) -> String {
        let failed = status.map(|s| s >= 400).unwrap_or(false);
        let metadata = object(json!({ "endpoint": endpoint, "status": status, "success": !failed }));
        let outcome = if failed { "error" } else { "success" };
        self.record_metric(MetricType::Response, duration_ms, metadata, [outcome])
            .await
    }

    // ---- queries ----

    fn window_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let window = ChronoDuration::from_std(self.config.window).unwrap_or_else(|_| ChronoDuration::days(36_500));
        now.checked_sub_signed(window).unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Live samples, oldest first, optionally filtered by type
    pub async fn metrics(&self, metric_type: Option<MetricType>) -> Vec<PerformanceMetric> {
        let now = self.clock.now();
        self.metrics_between(metric_type, self.window_start(now), now).await
    }

    /// Samples with `start <= timestamp <= end` that are still retained
    pub async fn metrics_between(
        &self,
        metric_type: Option<MetricType>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Vec<PerformanceMetric> {
        let state = self.state.read().await;
        let mut samples: Vec<PerformanceMetric> = state
            .buckets
            .values()
            .flatten()
            .filter(|m| metric_type.map(|t| m.metric_type == t).unwrap_or(true))
            .filter(|m| m.timestamp >= start && m.timestamp <= end)
            .cloned()
            .collect();
        samples.sort_by_key(|m| m.timestamp);
        samples
    }

    /// Samples grouped by their `type:tags` bucket
    pub async fn buckets(&self) -> HashMap<String, usize> {
        let state = self.state.read().await;
        state
            .buckets
            .iter()
            .map(|(bucket, samples)| (bucket.clone(), samples.len()))
            .collect()
    }

    /// Samples in one bucket
    pub async fn bucket(&self, metric_type: MetricType, tags: &[&str]) -> Vec<PerformanceMetric> {
        let tags: BTreeSet<String> = tags.iter().map(|t| t.to_string()).collect();
        let key = bucket_key(metric_type, &tags);
        let cutoff = self.window_start(self.clock.now());
        let state = self.state.read().await;
        state
            .buckets
            .get(&key)
            .map(|samples| samples.iter().filter(|m| m.timestamp >= cutoff).cloned().collect())
            .unwrap_or_default()
    }

    pub async fn query_metrics(&self) -> QueryMetrics {
        let samples = self.metrics(Some(MetricType::Query)).await;
        summarize_queries(&samples, &self.config)
    }

    pub async fn cache_metrics(&self) -> CacheMetrics {
        let samples = self.metrics(Some(MetricType::Cache)).await;
        summarize_cache(&samples)
    }

    pub async fn response_metrics(&self) -> ResponseMetrics {
        let now = self.clock.now();
        let samples = self.metrics(Some(MetricType::Response)).await;
        summarize_responses(&samples, now)
    }

    /// Compare live measurements against the configured targets
    pub async fn sla_status(&self) -> SlaStatus {
        self.evaluate_sla(&self.config.sla).await
    }

    /// Compare live measurements against `targets`
    pub async fn evaluate_sla(&self, targets: &SlaTargets) -> SlaStatus {
        let now = self.clock.now();
        let query = self.query_metrics().await;
        let response = self.response_metrics().await;
        evaluate_sla(targets, &query, &response, now)
    }

    /// Aggregated view delivered to subscribers
    pub async fn snapshot(&self) -> MetricsSnapshot {
        let now = self.clock.now();
        let query = self.query_metrics().await;
        let cache = self.cache_metrics().await;
        let response = self.response_metrics().await;
        let sla = evaluate_sla(&self.config.sla, &query, &response, now);

        MetricsSnapshot {
            timestamp: now,
            query,
            cache,
            response,
            sla,
        }
    }

    /// Call `callback` with a fresh snapshot every subscription interval.
    ///
    /// Returns `None` outside a tokio runtime.
    pub fn subscribe<F, Fut>(self: &Arc<Self>, callback: F) -> Option<Subscription>
    where
        F: Fn(MetricsSnapshot) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let callback = Arc::new(callback);
        let task = ScheduledTask::every(
            "metrics-subscription",
            self.config.subscription_interval,
            Arc::downgrade(self),
            move |collector: Arc<MetricsCollector>| {
                let callback = Arc::clone(&callback);
                async move {
                    let snapshot = collector.snapshot().await;
                    callback(snapshot).await;
                }
            },
        )?;
        debug!("Metrics subscriber registered");
        Some(Subscription { task })
    }

    // ---- maintenance ----

    /// Drop samples older than the window
    pub async fn sweep(&self) -> usize {
        let cutoff = self.window_start(self.clock.now());
        let removed = self.state.write().await.purge_before(cutoff);
        if removed > 0 {
            debug!("Swept {} expired metric samples", removed);
        }
        removed
    }

    /// Number of retained samples
    pub async fn len(&self) -> usize {
        self.state.read().await.total
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Drop every sample
    pub async fn clear(&self) {
        let mut state = self.state.write().await;
        state.buckets.clear();
        state.total = 0;
    }

    /// Stop the background sweep
    pub async fn shutdown(&self) {
        if let Some(mut task) = self.sweep_task.lock().await.take() {
            task.cancel();
        }
        info!("Metrics collector shut down");
    }
}

fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

fn ratio(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64
    }
}

pub(crate) fn summarize_queries(samples: &[PerformanceMetric], config: &MetricsConfig) -> QueryMetrics {
    let durations: Vec<f64> = samples.iter().map(|m| m.value).collect();
    let total = samples.len() as u64;
    let failed = samples.iter().filter(|m| m.has_tag("error")).count() as u64;

    let mut slow_queries: Vec<SlowQuery> = samples
        .iter()
        .filter(|m| m.value > config.slow_query_threshold_ms)
        .map(|m| SlowQuery {
            query: m.meta_str("query").unwrap_or_default().to_string(),
            duration_ms: m.value,
            timestamp: m.timestamp,
        })
        .collect();
    slow_queries.sort_by(|a, b| b.duration_ms.total_cmp(&a.duration_ms));
    slow_queries.truncate(config.slow_query_limit);

    QueryMetrics {
        total,
        failed,
        avg_response_time_ms: mean(&durations),
        error_rate: ratio(failed, total),
        slow_queries,
        percentiles: PercentileSummary::from_values(&durations),
    }
}

pub(crate) fn summarize_cache(samples: &[PerformanceMetric]) -> CacheMetrics {
    let hits = samples.iter().filter(|m| m.has_tag("hit")).count() as u64;
    let misses = samples.iter().filter(|m| m.has_tag("miss")).count() as u64;
    let durations: Vec<f64> = samples.iter().map(|m| m.value).collect();

    CacheMetrics {
        hits,
        misses,
        hit_rate: ratio(hits, hits + misses),
        miss_rate: ratio(misses, hits + misses),
        avg_access_time_ms: mean(&durations),
    }
}

pub(crate) fn summarize_responses(samples: &[PerformanceMetric], now: DateTime<Utc>) -> ResponseMetrics {
    let durations: Vec<f64> = samples.iter().map(|m| m.value).collect();
    let minute_ago = now - ChronoDuration::minutes(1);

    ResponseMetrics {
        count: samples.len() as u64,
        failed: samples.iter().filter(|m| m.has_tag("error")).count() as u64,
        percentiles: PercentileSummary::from_values(&durations),
        requests_per_minute: samples.iter().filter(|m| m.timestamp >= minute_ago).count() as f64,
    }
}

/// Check measurements against targets.
///
/// p95 comes from response samples, or from queries when no responses were
/// recorded. Nothing is evaluated before the first request. A breach is
/// critical beyond twice the ceiling (or below half the floor).
pub(crate) fn evaluate_sla(
    targets: &SlaTargets,
    query: &QueryMetrics,
    response: &ResponseMetrics,
    now: DateTime<Utc>,
) -> SlaStatus {
    let mut violations = Vec::new();
    let total_requests = query.total + response.count;

    if total_requests > 0 {
        let p95 = if response.count > 0 {
            response.percentiles.p95
        } else {
            query.percentiles.p95
        };
        if p95 > targets.response_time_ms {
            let severity = if p95 > targets.response_time_ms * 2.0 {
                Severity::Critical
            } else {
                Severity::Warning
            };
            violations.push(SlaViolation {
                violation_type: ViolationType::ResponseTime,
                severity,
                timestamp: now,
                message: format!(
                    "p95 response time {:.1}ms exceeds target {:.1}ms",
                    p95, targets.response_time_ms
                ),
                target: targets.response_time_ms,
                actual: p95,
            });
        }

        let error_rate = ratio(query.failed + response.failed, total_requests);
        if error_rate > targets.error_rate {
            let severity = if error_rate > targets.error_rate * 2.0 {
                Severity::Critical
            } else {
                Severity::Warning
            };
            violations.push(SlaViolation {
                violation_type: ViolationType::ErrorRate,
                severity,
                timestamp: now,
                message: format!(
                    "error rate {:.2}% exceeds target {:.2}%",
                    error_rate * 100.0,
                    targets.error_rate * 100.0
                ),
                target: targets.error_rate,
                actual: error_rate,
            });
        }

        let rpm = response.requests_per_minute;
        if rpm < targets.throughput_rpm {
            let severity = if rpm < targets.throughput_rpm / 2.0 {
                Severity::Critical
            } else {
                Severity::Warning
            };
            violations.push(SlaViolation {
                violation_type: ViolationType::Throughput,
                severity,
                timestamp: now,
                message: format!(
                    "throughput {:.1} req/min below target {:.1} req/min",
                    rpm, targets.throughput_rpm
                ),
                target: targets.throughput_rpm,
                actual: rpm,
            });
        }
    }

    SlaStatus {
        compliant: violations.is_empty(),
        targets: targets.clone(),
        violations,
    }
}
