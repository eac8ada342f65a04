//! Performance report generation and export
//!
//! A report covers one period of retained samples: an executive summary with
//! a 0-100 health score, detailed sections, simple trend comparisons and
//! recommendations ordered by priority.

use crate::clock::{system_clock, SharedClock};
use crate::error::{CacheError, Result};
use crate::metrics::collector::{
    evaluate_sla, summarize_cache, summarize_queries, summarize_responses, MetricsCollector,
};
use crate::metrics::percentile::PercentileSummary;
use crate::metrics::types::{
    CacheMetrics, MetricType, PerformanceMetric, QueryMetrics, Severity, SlaStatus, SlaTargets,
    SlowQuery,
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

const RESPONSE_WEIGHT: f64 = 0.3;
const ERROR_WEIGHT: f64 = 0.3;
const CACHE_WEIGHT: f64 = 0.2;
const AVAILABILITY_WEIGHT: f64 = 0.2;

/// Time range a report covers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportPeriod {
    Hourly,
    Daily,
    Weekly,
    Monthly,
    Custom {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
}

impl ReportPeriod {
    /// Concrete `[start, end]` for a report generated at `now`
    pub fn range(&self, now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        let back = match self {
            ReportPeriod::Hourly => ChronoDuration::hours(1),
            ReportPeriod::Daily => ChronoDuration::days(1),
            ReportPeriod::Weekly => ChronoDuration::weeks(1),
            ReportPeriod::Monthly => ChronoDuration::days(30),
            ReportPeriod::Custom { start, end } => return (*start, *end),
        };
        (now - back, now)
    }
}

impl fmt::Display for ReportPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReportPeriod::Hourly => f.write_str("hourly"),
            ReportPeriod::Daily => f.write_str("daily"),
            ReportPeriod::Weekly => f.write_str("weekly"),
            ReportPeriod::Monthly => f.write_str("monthly"),
            ReportPeriod::Custom { .. } => f.write_str("custom"),
        }
    }
}

impl FromStr for ReportPeriod {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "hourly" | "hour" => Ok(ReportPeriod::Hourly),
            "daily" | "day" => Ok(ReportPeriod::Daily),
            "weekly" | "week" => Ok(ReportPeriod::Weekly),
            "monthly" | "month" => Ok(ReportPeriod::Monthly),
            other => Err(CacheError::Config(format!("unknown report period: {}", other))),
        }
    }
}

/// Export targets. PDF is recognized but not implemented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Json,
    Csv,
    Html,
    Pdf,
}

impl FromStr for ExportFormat {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(ExportFormat::Json),
            "csv" => Ok(ExportFormat::Csv),
            "html" => Ok(ExportFormat::Html),
            "pdf" => Ok(ExportFormat::Pdf),
            other => Err(CacheError::UnsupportedFormat(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Excellent,
    Good,
    Fair,
    Poor,
}

impl HealthStatus {
    fn from_score(score: f64) -> Self {
        if score >= 90.0 {
            HealthStatus::Excellent
        } else if score >= 75.0 {
            HealthStatus::Good
        } else if score >= 50.0 {
            HealthStatus::Fair
        } else {
            HealthStatus::Poor
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutiveSummary {
    /// 0-100
    pub health_score: f64,
    pub status: HealthStatus,
    pub total_requests: u64,
    pub avg_response_time_ms: f64,
    pub p95_response_time_ms: f64,
    pub error_rate: f64,
    pub cache_hit_rate: f64,
    pub availability: f64,
    pub sla_compliant: bool,
    pub key_findings: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSection {
    pub response_times: PercentileSummary,
    pub query_times: PercentileSummary,
    pub requests_per_minute: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AvailabilitySection {
    /// Successful requests over all requests; 1.0 without traffic
    pub availability: f64,
    pub total_requests: u64,
    pub failed_requests: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuerySection {
    pub total: u64,
    pub failed: u64,
    pub error_rate: f64,
    pub avg_response_time_ms: f64,
    pub slow_queries: Vec<SlowQuery>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrendDirection {
    Improving,
    Stable,
    Degrading,
    Unknown,
}

/// First half of the period compared with the second half
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Trend {
    pub direction: TrendDirection,
    pub change_percent: f64,
}

impl Trend {
    fn unknown() -> Self {
        Self {
            direction: TrendDirection::Unknown,
            change_percent: 0.0,
        }
    }

    /// `lower_is_better` flips the meaning of an increase
    fn between(before: Option<f64>, after: Option<f64>, lower_is_better: bool) -> Self {
        let (Some(before), Some(after)) = (before, after) else {
            return Self::unknown();
        };
        if before == 0.0 {
            let direction = if after == 0.0 {
                TrendDirection::Stable
            } else if lower_is_better {
                TrendDirection::Degrading
            } else {
                TrendDirection::Improving
            };
            return Self {
                direction,
                change_percent: 0.0,
            };
        }

        let change_percent = (after - before) / before * 100.0;
        let direction = if change_percent.abs() < 5.0 {
            TrendDirection::Stable
        } else if (change_percent < 0.0) == lower_is_better {
            TrendDirection::Improving
        } else {
            TrendDirection::Degrading
        };
        Self {
            direction,
            change_percent,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendSection {
    pub response_time: Trend,
    pub error_rate: Trend,
    pub cache_hit_rate: Trend,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub priority: Priority,
    pub category: String,
    pub title: String,
    pub description: String,
}

/// A generated report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceReport {
    pub id: String,
    pub generated_at: DateTime<Utc>,
    pub period: ReportPeriod,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub summary: ExecutiveSummary,
    pub performance: PerformanceSection,
    pub availability: AvailabilitySection,
    pub cache: CacheMetrics,
    pub queries: QuerySection,
    pub sla: SlaStatus,
    pub trends: TrendSection,
    pub recommendations: Vec<Recommendation>,
}

/// Builds reports from a collector's retained samples
pub struct PerformanceReportGenerator {
    collector: Arc<MetricsCollector>,
    targets: SlaTargets,
    clock: SharedClock,
}

impl PerformanceReportGenerator {
    pub fn new(collector: Arc<MetricsCollector>) -> Self {
        let targets = collector.config().sla.clone();
        Self {
            collector,
            targets,
            clock: system_clock(),
        }
    }

    pub fn with_targets(mut self, targets: SlaTargets) -> Self {
        self.targets = targets;
        self
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Build a report for `period`. Never fails, even without samples.
    pub async fn generate_report(&self, period: ReportPeriod) -> PerformanceReport {
        let now = self.clock.now();
        let (start, end) = period.range(now);

        let queries = self
            .collector
            .metrics_between(Some(MetricType::Query), start, end)
            .await;
        let cache_events = self
            .collector
            .metrics_between(Some(MetricType::Cache), start, end)
            .await;
        let responses = self
            .collector
            .metrics_between(Some(MetricType::Response), start, end)
            .await;

        let config = self.collector.config();
        let query = summarize_queries(&queries, config);
        let cache = summarize_cache(&cache_events);
        let response = summarize_responses(&responses, end);
        let sla = evaluate_sla(&self.targets, &query, &response, now);

        let total_requests = query.total + response.count;
        let failed_requests = query.failed + response.failed;
        let availability = if total_requests == 0 {
            1.0
        } else {
            1.0 - failed_requests as f64 / total_requests as f64
        };
        let error_rate = 1.0 - availability;

        let (p95, avg) = if response.count > 0 {
            (response.percentiles.p95, response.percentiles.mean)
        } else {
            (query.percentiles.p95, query.percentiles.mean)
        };

        let health_score = self.health_score(total_requests, p95, error_rate, &cache, availability);
        let recommendations = self.recommendations(p95, error_rate, &cache, &query, &sla);
        let key_findings = key_findings(total_requests, p95, error_rate, &cache, &sla);

        let mid = start + (end - start) / 2;
        let trends = TrendSection {
            response_time: Trend::between(
                p95_of(&responses, start, mid).or_else(|| p95_of(&queries, start, mid)),
                p95_of(&responses, mid, end).or_else(|| p95_of(&queries, mid, end)),
                true,
            ),
            error_rate: Trend::between(
                failure_rate(&queries, &responses, start, mid),
                failure_rate(&queries, &responses, mid, end),
                true,
            ),
            cache_hit_rate: Trend::between(
                hit_rate(&cache_events, start, mid),
                hit_rate(&cache_events, mid, end),
                false,
            ),
        };

        info!(
            "Generated {} report: {} requests, health score {:.1}",
            period, total_requests, health_score
        );

        PerformanceReport {
            id: Uuid::new_v4().to_string(),
            generated_at: now,
            period,
            start,
            end,
            summary: ExecutiveSummary {
                health_score,
                status: HealthStatus::from_score(health_score),
                total_requests,
                avg_response_time_ms: avg,
                p95_response_time_ms: p95,
                error_rate,
                cache_hit_rate: cache.hit_rate,
                availability,
                sla_compliant: sla.compliant,
                key_findings,
            },
            performance: PerformanceSection {
                response_times: response.percentiles,
                query_times: query.percentiles,
                requests_per_minute: response.requests_per_minute,
            },
            availability: AvailabilitySection {
                availability,
                total_requests,
                failed_requests,
            },
            queries: QuerySection {
                total: query.total,
                failed: query.failed,
                error_rate: query.error_rate,
                avg_response_time_ms: query.avg_response_time_ms,
                slow_queries: query.slow_queries.clone(),
            },
            cache,
            sla,
            trends,
            recommendations,
        }
    }

    /// Weighted sub-scores; every sub-score is 100 when there is nothing to judge
    fn health_score(
        &self,
        total_requests: u64,
        p95: f64,
        error_rate: f64,
        cache: &CacheMetrics,
        availability: f64,
    ) -> f64 {
        let response_score = if total_requests == 0 || p95 <= self.targets.response_time_ms {
            100.0
        } else {
            100.0 * self.targets.response_time_ms / p95
        };
        // 10% errors scores zero
        let error_score = (100.0 - error_rate * 1000.0).clamp(0.0, 100.0);
        let cache_score = if cache.total() == 0 {
            100.0
        } else {
            cache.hit_rate * 100.0
        };
        let availability_score = availability * 100.0;

        let score = response_score * RESPONSE_WEIGHT
            + error_score * ERROR_WEIGHT
            + cache_score * CACHE_WEIGHT
            + availability_score * AVAILABILITY_WEIGHT;
        (score * 10.0).round() / 10.0
    }

    fn recommendations(
        &self,
        p95: f64,
        error_rate: f64,
        cache: &CacheMetrics,
        query: &QueryMetrics,
        sla: &SlaStatus,
    ) -> Vec<Recommendation> {
        let mut out = Vec::new();

        if p95 > self.targets.response_time_ms {
            out.push(Recommendation {
                priority: Priority::High,
                category: "performance".to_string(),
                title: "Optimize response time".to_string(),
                description: format!(
                    "p95 response time is {:.0}ms against a {:.0}ms target. Profile the slowest endpoints and cache their results.",
                    p95, self.targets.response_time_ms
                ),
            });
        }

        if error_rate > 0.05 {
            out.push(Recommendation {
                priority: Priority::High,
                category: "reliability".to_string(),
                title: "Reduce error rate".to_string(),
                description: format!("{:.1}% of requests failed.", error_rate * 100.0),
            });
        } else if error_rate > self.targets.error_rate {
            out.push(Recommendation {
                priority: Priority::Medium,
                category: "reliability".to_string(),
                title: "Investigate failing requests".to_string(),
                description: format!(
                    "Error rate {:.2}% is above the {:.2}% target.",
                    error_rate * 100.0,
                    self.targets.error_rate * 100.0
                ),
            });
        }

        if cache.total() > 0 && cache.hit_rate < 0.8 {
            out.push(Recommendation {
                priority: Priority::Medium,
                category: "cache".to_string(),
                title: "Improve cache hit rate".to_string(),
                description: format!(
                    "Hit rate is {:.1}%. Consider longer TTLs, prefetching popular keys or a larger memory cap.",
                    cache.hit_rate * 100.0
                ),
            });
        }

        if !query.slow_queries.is_empty() {
            out.push(Recommendation {
                priority: Priority::Medium,
                category: "queries".to_string(),
                title: "Optimize slow queries".to_string(),
                description: format!(
                    "{} queries exceeded the slow-query threshold; the slowest took {:.0}ms.",
                    query.slow_queries.len(),
                    query.slow_queries[0].duration_ms
                ),
            });
        }

        if sla.violations.iter().any(|v| v.severity == Severity::Critical) {
            out.push(Recommendation {
                priority: Priority::High,
                category: "sla".to_string(),
                title: "Resolve critical SLA violations".to_string(),
                description: sla
                    .violations
                    .iter()
                    .filter(|v| v.severity == Severity::Critical)
                    .map(|v| v.message.clone())
                    .collect::<Vec<_>>()
                    .join("; "),
            });
        }

        if out.is_empty() {
            out.push(Recommendation {
                priority: Priority::Low,
                category: "general".to_string(),
                title: "Keep monitoring".to_string(),
                description: "All measured indicators are within target.".to_string(),
            });
        }

        out.sort_by_key(|r| r.priority);
        out
    }

    /// Render a report in the given format
    pub fn export(&self, report: &PerformanceReport, format: ExportFormat) -> Result<String> {
        match format {
            ExportFormat::Json => Ok(serde_json::to_string_pretty(report)?),
            ExportFormat::Csv => Ok(to_csv(report, &self.targets)),
            ExportFormat::Html => Ok(to_html(report)),
            ExportFormat::Pdf => Err(CacheError::UnsupportedFormat(
                "PDF export is not supported".to_string(),
            )),
        }
    }
}

fn in_range(m: &PerformanceMetric, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
    m.timestamp >= start && m.timestamp < end
}

fn p95_of(samples: &[PerformanceMetric], start: DateTime<Utc>, end: DateTime<Utc>) -> Option<f64> {
    let values: Vec<f64> = samples
        .iter()
        .filter(|m| in_range(m, start, end))
        .map(|m| m.value)
        .collect();
    if values.is_empty() {
        None
    } else {
        Some(PercentileSummary::from_values(&values).p95)
    }
}

fn failure_rate(
    queries: &[PerformanceMetric],
    responses: &[PerformanceMetric],
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Option<f64> {
    let window: Vec<&PerformanceMetric> = queries
        .iter()
        .chain(responses)
        .filter(|m| in_range(m, start, end))
        .collect();
    if window.is_empty() {
        return None;
    }
    let failed = window.iter().filter(|m| m.has_tag("error")).count();
    Some(failed as f64 / window.len() as f64)
}

fn hit_rate(events: &[PerformanceMetric], start: DateTime<Utc>, end: DateTime<Utc>) -> Option<f64> {
    let window: Vec<&PerformanceMetric> = events.iter().filter(|m| in_range(m, start, end)).collect();
    if window.is_empty() {
        return None;
    }
    let hits = window.iter().filter(|m| m.has_tag("hit")).count();
    Some(hits as f64 / window.len() as f64)
}

fn key_findings(total: u64, p95: f64, error_rate: f64, cache: &CacheMetrics, sla: &SlaStatus) -> Vec<String> {
    if total == 0 && cache.total() == 0 {
        return vec!["No traffic recorded during this period".to_string()];
    }
    let mut findings = vec![
        format!("{} requests served, p95 {:.1}ms", total, p95),
        format!("Error rate {:.2}%", error_rate * 100.0),
    ];
    if cache.total() > 0 {
        findings.push(format!(
            "Cache hit rate {:.1}% over {} lookups",
            cache.hit_rate * 100.0,
            cache.total()
        ));
    }
    if !sla.compliant {
        findings.push(format!("{} SLA target(s) breached", sla.violations.len()));
    }
    findings
}

fn status_label(ok: bool, critical: bool) -> &'static str {
    if ok {
        "good"
    } else if critical {
        "critical"
    } else {
        "warning"
    }
}

fn to_csv(report: &PerformanceReport, targets: &SlaTargets) -> String {
    let s = &report.summary;
    let rows = [
        (
            "health_score",
            format!("{:.1}", s.health_score),
            status_label(s.health_score >= 75.0, s.health_score < 50.0),
        ),
        ("total_requests", s.total_requests.to_string(), "good"),
        (
            "avg_response_time_ms",
            format!("{:.2}", s.avg_response_time_ms),
            status_label(
                s.avg_response_time_ms <= targets.response_time_ms,
                s.avg_response_time_ms > targets.response_time_ms * 2.0,
            ),
        ),
        (
            "p95_response_time_ms",
            format!("{:.2}", s.p95_response_time_ms),
            status_label(
                s.p95_response_time_ms <= targets.response_time_ms,
                s.p95_response_time_ms > targets.response_time_ms * 2.0,
            ),
        ),
        (
            "error_rate",
            format!("{:.4}", s.error_rate),
            status_label(s.error_rate <= targets.error_rate, s.error_rate > targets.error_rate * 2.0),
        ),
        (
            "cache_hit_rate",
            format!("{:.4}", s.cache_hit_rate),
            status_label(
                report.cache.total() == 0 || s.cache_hit_rate >= 0.8,
                s.cache_hit_rate < 0.5,
            ),
        ),
        (
            "availability",
            format!("{:.4}", s.availability),
            status_label(s.availability >= 0.99, s.availability < 0.95),
        ),
        (
            "sla_compliant",
            s.sla_compliant.to_string(),
            status_label(s.sla_compliant, false),
        ),
    ];

    let mut csv = String::from("metric,value,status\n");
    for (metric, value, status) in rows {
        csv.push_str(&format!("{},{},{}\n", metric, value, status));
    }
    csv
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn to_html(report: &PerformanceReport) -> String {
    let s = &report.summary;
    let findings: String = s
        .key_findings
        .iter()
        .map(|f| format!("<li>{}</li>", escape_html(f)))
        .collect();
    let recommendations: String = report
        .recommendations
        .iter()
        .map(|r| {
            format!(
                "<tr><td class=\"{p:?}\">{p:?}</td><td>{}</td><td>{}</td></tr>",
                escape_html(&r.title),
                escape_html(&r.description),
                p = r.priority
            )
        })
        .collect();
    let violations: String = if report.sla.violations.is_empty() {
        "<p>All SLA targets met.</p>".to_string()
    } else {
        let items: String = report
            .sla
            .violations
            .iter()
            .map(|v| format!("<li class=\"{}\">{}</li>", v.severity, escape_html(&v.message)))
            .collect();
        format!("<ul>{}</ul>", items)
    };

    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<title>Performance Report {period}</title>
<style>
body {{ font-family: sans-serif; margin: 2rem; color: #222; }}
h1 {{ margin-bottom: 0; }}
.score {{ font-size: 3rem; font-weight: bold; }}
table {{ border-collapse: collapse; width: 100%; }}
td, th {{ border: 1px solid #ddd; padding: 0.4rem; text-align: left; }}
.High, .critical {{ color: #b00020; }}
.Medium, .warning {{ color: #b26a00; }}
.Low {{ color: #2e7d32; }}
</style>
</head>
<body>
<h1>Performance Report</h1>
<p>{period} report, {start} to {end}</p>
<h2>Executive Summary</h2>
<div class="score">{score:.1}</div>
<p>Status: {status:?}</p>
<ul>{findings}</ul>
<h2>Key Metrics</h2>
<table>
<tr><th>Metric</th><th>Value</th></tr>
<tr><td>Total requests</td><td>{total}</td></tr>
<tr><td>Average response time</td><td>{avg:.2} ms</td></tr>
<tr><td>p95 response time</td><td>{p95:.2} ms</td></tr>
<tr><td>Error rate</td><td>{error:.2}%</td></tr>
<tr><td>Cache hit rate</td><td>{hit:.1}%</td></tr>
<tr><td>Availability</td><td>{availability:.2}%</td></tr>
</table>
<h2>SLA</h2>
{violations}
<h2>Recommendations</h2>
<table>
<tr><th>Priority</th><th>Title</th><th>Details</th></tr>
{recommendations}
</table>
</body>
</html>
"#,
        period = report.period,
        start = report.start.to_rfc3339(),
        end = report.end.to_rfc3339(),
        score = s.health_score,
        status = s.status,
        findings = findings,
        total = s.total_requests,
        avg = s.avg_response_time_ms,
        p95 = s.p95_response_time_ms,
        error = s.error_rate * 100.0,
        hit = s.cache_hit_rate * 100.0,
        availability = s.availability * 100.0,
        violations = violations,
        recommendations = recommendations,
    )
}
