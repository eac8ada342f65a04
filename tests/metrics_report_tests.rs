//! Integration tests for metrics collection and reporting
//!
//! Covers the cache-to-collector wiring, report generation over a period
//! driven by a manual clock, SLA targets and every export format.

use chrono::Duration as ChronoDuration;
use kb_cache::cache::{CacheConfig, SetOptions, TieredCacheManager};
use kb_cache::clock::{Clock, ManualClock};
use kb_cache::metrics::report::PerformanceReport;
use kb_cache::metrics::{
    ExportFormat, MetricType, MetricsCollector, MetricsConfig, PerformanceReportGenerator, Priority,
    ReportPeriod, Severity, SlaTargets, TrendDirection, ViolationType,
};
use kb_cache::CacheError;
use std::sync::Arc;
use std::time::Duration;

fn collector_at(clock: &Arc<ManualClock>) -> Arc<MetricsCollector> {
    let config = MetricsConfig {
        window: Duration::from_secs(2 * 3600),
        ..Default::default()
    };
    MetricsCollector::with_clock(config, clock.clone()).unwrap()
}

#[tokio::test]
async fn test_cache_lookups_feed_collector() {
    let collector = MetricsCollector::new(MetricsConfig::default()).unwrap();
    let cache = TieredCacheManager::builder(CacheConfig::default())
        .metrics(collector.clone())
        .build()
        .unwrap();

    cache.set("search:jcl", &"hit", SetOptions::new()).await.unwrap();
    for _ in 0..3 {
        assert!(cache.get::<String>("search:jcl").await.is_some());
    }
    assert!(cache.get::<String>("search:cobol").await.is_none());

    let metrics = collector.cache_metrics().await;
    assert_eq!(metrics.hits, 3);
    assert_eq!(metrics.misses, 1);
    assert!((metrics.hit_rate - 0.75).abs() < 1e-9);
    assert_eq!(collector.bucket(MetricType::Cache, &["miss"]).await.len(), 1);
}

#[tokio::test]
async fn test_report_over_period_with_degrading_trend() {
    let clock = ManualClock::starting_now();
    let collector = collector_at(&clock);

    for _ in 0..10 {
        collector.record_response_time("/api/search", 100.0, Some(200)).await;
    }
    clock.advance(Duration::from_secs(40 * 60));
    for _ in 0..10 {
        collector.record_response_time("/api/search", 1000.0, Some(200)).await;
    }
    clock.advance(Duration::from_secs(5 * 60));

    let generator = PerformanceReportGenerator::new(collector.clone()).with_clock(clock.clone());
    let report = generator.generate_report(ReportPeriod::Hourly).await;

    assert_eq!(report.summary.total_requests, 20);
    assert_eq!(report.summary.p95_response_time_ms, 1000.0);
    assert_eq!(report.availability.availability, 1.0);
    assert!(!report.summary.sla_compliant);
    assert_eq!(report.trends.response_time.direction, TrendDirection::Degrading);
    assert_eq!(report.trends.cache_hit_rate.direction, TrendDirection::Unknown);

    let first = &report.recommendations[0];
    assert_eq!(first.priority, Priority::High);
    assert_eq!(first.category, "performance");
    assert!(report.summary.health_score < 100.0);
}

#[tokio::test]
async fn test_custom_period_excludes_outside_samples() {
    let clock = ManualClock::starting_now();
    let collector = collector_at(&clock);
    let start = clock.now();

    collector.record_query("inside", 50.0, true).await;
    clock.advance(Duration::from_secs(600));
    collector.record_query("outside", 50.0, false).await;

    let generator = PerformanceReportGenerator::new(collector).with_clock(clock.clone());
    let report = generator
        .generate_report(ReportPeriod::Custom {
            start: start - ChronoDuration::seconds(1),
            end: start + ChronoDuration::seconds(1),
        })
        .await;

    assert_eq!(report.queries.total, 1);
    assert_eq!(report.queries.failed, 0);
    assert_eq!(report.summary.error_rate, 0.0);
}

#[tokio::test]
async fn test_strict_targets_flag_errors() {
    let clock = ManualClock::starting_now();
    let collector = collector_at(&clock);
    for i in 0..20 {
        let status = if i < 4 { 500 } else { 200 };
        collector.record_response_time("/api/entries", 80.0, Some(status)).await;
    }

    let targets = SlaTargets {
        response_time_ms: 500.0,
        error_rate: 0.05,
        throughput_rpm: 1.0,
    };
    let generator = PerformanceReportGenerator::new(collector.clone())
        .with_targets(targets.clone())
        .with_clock(clock.clone());
    let report = generator.generate_report(ReportPeriod::Hourly).await;

    assert!((report.summary.error_rate - 0.2).abs() < 1e-9);
    let violation = report
        .sla
        .violations
        .iter()
        .find(|v| v.violation_type == ViolationType::ErrorRate)
        .unwrap();
    assert_eq!(violation.severity, Severity::Critical);
    assert!(report
        .recommendations
        .iter()
        .any(|r| r.category == "reliability" && r.priority == Priority::High));

    let live = collector.evaluate_sla(&targets).await;
    assert!(!live.compliant);
}

#[tokio::test]
async fn test_export_formats() {
    let clock = ManualClock::starting_now();
    let collector = collector_at(&clock);
    collector.record_query("jcl abend", 120.0, true).await;
    collector.record_cache_event("search:jcl", true, None, 0.5).await;

    let generator = PerformanceReportGenerator::new(collector).with_clock(clock.clone());
    let report = generator.generate_report(ReportPeriod::Daily).await;

    let json = generator.export(&report, ExportFormat::Json).unwrap();
    let parsed: PerformanceReport = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed.id, report.id);

    let csv = generator.export(&report, ExportFormat::Csv).unwrap();
    let mut lines = csv.lines();
    assert_eq!(lines.next(), Some("metric,value,status"));
    assert!(csv.lines().any(|l| l.starts_with("health_score,")));

    let html = generator.export(&report, ExportFormat::Html).unwrap();
    assert!(html.starts_with("<!DOCTYPE html>"));

    assert!(matches!(
        generator.export(&report, ExportFormat::Pdf),
        Err(CacheError::UnsupportedFormat(_))
    ));
}
