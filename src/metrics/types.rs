//! Metric samples, aggregated views and SLA types

use crate::error::{CacheError, Result};
use crate::metrics::percentile::PercentileSummary;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

/// Category of a recorded sample
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricType {
    Query,
    Cache,
    Response,
    System,
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MetricType::Query => "query",
            MetricType::Cache => "cache",
            MetricType::Response => "response",
            MetricType::System => "system",
        };
        f.write_str(name)
    }
}

/// One timestamped sample. Never mutated after insertion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetric {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub metric_type: MetricType,
    /// Usually a duration in milliseconds
    pub value: f64,
    pub metadata: Map<String, Value>,
    pub tags: BTreeSet<String>,
}

impl PerformanceMetric {
    /// Grouping key: `type:tag1,tag2`
    pub fn bucket(&self) -> String {
        bucket_key(self.metric_type, &self.tags)
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }

    /// String metadata field
    pub fn meta_str(&self, field: &str) -> Option<&str> {
        self.metadata.get(field).and_then(Value::as_str)
    }

    /// Boolean metadata field
    pub fn meta_bool(&self, field: &str) -> Option<bool> {
        self.metadata.get(field).and_then(Value::as_bool)
    }
}

pub(crate) fn bucket_key(metric_type: MetricType, tags: &BTreeSet<String>) -> String {
    let tags: Vec<&str> = tags.iter().map(String::as_str).collect();
    format!("{}:{}", metric_type, tags.join(","))
}

/// A query slower than the configured threshold
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlowQuery {
    pub query: String,
    pub duration_ms: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryMetrics {
    pub total: u64,
    pub failed: u64,
    pub avg_response_time_ms: f64,
    /// failed / total, zero without queries
    pub error_rate: f64,
    /// Slowest first
    pub slow_queries: Vec<SlowQuery>,
    pub percentiles: PercentileSummary,
}

/// Hit/miss view built from recorded cache events
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheMetrics {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub miss_rate: f64,
    pub avg_access_time_ms: f64,
}

impl CacheMetrics {
    pub fn total(&self) -> u64 {
        self.hits + self.misses
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseMetrics {
    pub count: u64,
    pub failed: u64,
    pub percentiles: PercentileSummary,
    /// Requests seen during the last minute
    pub requests_per_minute: f64,
}

/// SLA targets
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlaTargets {
    /// Ceiling for p95 response time in ms
    pub response_time_ms: f64,
    /// Ceiling for the error rate, as a fraction
    pub error_rate: f64,
    /// Floor for requests per minute
    pub throughput_rpm: f64,
}

impl Default for SlaTargets {
    fn default() -> Self {
        Self {
            response_time_ms: 500.0,
            error_rate: 0.01,
            throughput_rpm: 60.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationType {
    ResponseTime,
    ErrorRate,
    Throughput,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Warning => f.write_str("warning"),
            Severity::Critical => f.write_str("critical"),
        }
    }
}

/// One breached target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlaViolation {
    #[serde(rename = "type")]
    pub violation_type: ViolationType,
    pub severity: Severity,
    pub timestamp: DateTime<Utc>,
    pub message: String,
    pub target: f64,
    pub actual: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlaStatus {
    pub compliant: bool,
    pub targets: SlaTargets,
    pub violations: Vec<SlaViolation>,
}

/// Everything a subscriber receives on each tick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub timestamp: DateTime<Utc>,
    pub query: QueryMetrics,
    pub cache: CacheMetrics,
    pub response: ResponseMetrics,
    pub sla: SlaStatus,
}

/// Collector configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Samples older than this are ignored and swept
    pub window: Duration,
    pub sweep_interval: Duration,
    pub subscription_interval: Duration,
    pub slow_query_threshold_ms: f64,
    pub slow_query_limit: usize,
    /// Hard cap on retained samples; oldest dropped first
    pub max_samples: usize,
    pub sla: SlaTargets,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_millis(300_000),
            sweep_interval: Duration::from_secs(60),
            subscription_interval: Duration::from_secs(5),
            slow_query_threshold_ms: 1000.0,
            slow_query_limit: 10,
            max_samples: 100_000,
            sla: SlaTargets::default(),
        }
    }
}

impl MetricsConfig {
    pub fn validate(&self) -> Result<()> {
        if self.window.is_zero() {
            return Err(CacheError::Config("metrics window must be positive".to_string()));
        }
        if self.subscription_interval.is_zero() {
            return Err(CacheError::Config(
                "subscription interval must be positive".to_string(),
            ));
        }
        if self.max_samples == 0 {
            return Err(CacheError::Config("max_samples must be at least 1".to_string()));
        }
        if self.sla.error_rate < 0.0 || self.sla.response_time_ms <= 0.0 {
            return Err(CacheError::Config("SLA targets must be positive".to_string()));
        }
        Ok(())
    }
}
