//! Performance metrics
//!
//! [`MetricsCollector`] keeps timestamped samples for a sliding window and
//! answers percentile, hit-rate and SLA questions on demand.
//! [`PerformanceReportGenerator`] turns a period of samples into a scored
//! report exportable as JSON, CSV or HTML.

pub mod collector;
pub mod percentile;
pub mod report;
pub mod types;

pub use collector::{MetricsCollector, Subscription};
pub use percentile::{percentile, PercentileSummary};
pub use report::{
    ExportFormat, HealthStatus, PerformanceReport, PerformanceReportGenerator, Priority,
    Recommendation, ReportPeriod, TrendDirection,
};
pub use types::{
    CacheMetrics, MetricType, MetricsConfig, MetricsSnapshot, PerformanceMetric, QueryMetrics,
    ResponseMetrics, Severity, SlaStatus, SlaTargets, SlaViolation, ViolationType,
};
