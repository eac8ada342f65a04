//! Load benchmark for cache-backed operations
//!
//! Runs an async operation a fixed number of times across concurrent workers.
//! Each call races the configured timeout; a timed-out call counts as failed
//! rather than hanging the run. An [`AbortHandle`] stops workers between
//! iterations.

use crate::error::{CacheError, Result};
use crate::metrics::collector::MetricsCollector;
use crate::metrics::percentile::PercentileSummary;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkConfig {
    pub name: String,
    pub iterations: usize,
    pub concurrency: usize,
    /// Budget for a single call
    pub timeout: Duration,
}

impl Default for BenchmarkConfig {
    fn default() -> Self {
        Self {
            name: "benchmark".to_string(),
            iterations: 100,
            concurrency: 4,
            timeout: Duration::from_secs(5),
        }
    }
}

impl BenchmarkConfig {
    pub fn validate(&self) -> Result<()> {
        if self.iterations == 0 {
            return Err(CacheError::Config("iterations must be at least 1".to_string()));
        }
        if self.concurrency == 0 {
            return Err(CacheError::Config("concurrency must be at least 1".to_string()));
        }
        if self.timeout.is_zero() {
            return Err(CacheError::Config("timeout must be positive".to_string()));
        }
        Ok(())
    }
}

/// Stops a running benchmark after in-flight calls finish
#[derive(Debug, Clone, Default)]
pub struct AbortHandle(Arc<AtomicBool>);

impl AbortHandle {
    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkResult {
    pub name: String,
    pub requested: usize,
    pub completed: usize,
    pub successful: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub aborted: bool,
    pub total_duration_ms: f64,
    /// Latency of successful calls
    pub latency: PercentileSummary,
    /// Successful calls per second of wall time
    pub throughput: f64,
}

impl BenchmarkResult {
    pub fn success_rate(&self) -> f64 {
        if self.completed == 0 {
            0.0
        } else {
            self.successful as f64 / self.completed as f64
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Outcome {
    Success(f64),
    Failed(f64),
    TimedOut(f64),
}

pub struct BenchmarkRunner {
    config: BenchmarkConfig,
    abort: AbortHandle,
    collector: Option<Arc<MetricsCollector>>,
}

impl BenchmarkRunner {
    pub fn new(config: BenchmarkConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            abort: AbortHandle::default(),
            collector: None,
        })
    }

    /// Record every call as a query sample named after the benchmark
    pub fn with_collector(mut self, collector: Arc<MetricsCollector>) -> Self {
        self.collector = Some(collector);
        self
    }

    pub fn config(&self) -> &BenchmarkConfig {
        &self.config
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    /// Run `op` once per iteration; it receives the iteration index
    pub async fn run<F, Fut, T, E>(&self, op: F) -> BenchmarkResult
    where
        F: Fn(usize) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Display,
    {
        self.abort.reset();
        let next = AtomicUsize::new(0);
        let workers = self.config.concurrency.min(self.config.iterations);
        info!(
            "Benchmark '{}' starting: {} iterations, {} workers",
            self.config.name, self.config.iterations, workers
        );

        let started = Instant::now();
        let outcomes: Vec<Outcome> = join_all((0..workers).map(|_| self.worker(&op, &next)))
            .await
            .into_iter()
            .flatten()
            .collect();
        let total_duration_ms = started.elapsed().as_secs_f64() * 1000.0;

        let mut latencies = Vec::new();
        let (mut failed, mut timed_out) = (0, 0);
        for outcome in &outcomes {
            match outcome {
                Outcome::Success(ms) => latencies.push(*ms),
                Outcome::Failed(_) => failed += 1,
                Outcome::TimedOut(_) => timed_out += 1,
            }
        }

        let successful = latencies.len();
        let result = BenchmarkResult {
            name: self.config.name.clone(),
            requested: self.config.iterations,
            completed: outcomes.len(),
            successful,
            failed: failed + timed_out,
            timed_out,
            aborted: self.abort.is_aborted(),
            total_duration_ms,
            latency: PercentileSummary::from_values(&latencies),
            throughput: if total_duration_ms > 0.0 {
                successful as f64 / (total_duration_ms / 1000.0)
            } else {
                0.0
            },
        };

        info!(
            "Benchmark '{}' finished: {}/{} ok, p95 {:.2}ms, {:.1} ops/s",
            result.name, result.successful, result.completed, result.latency.p95, result.throughput
        );
        result
    }

    async fn worker<F, Fut, T, E>(&self, op: &F, next: &AtomicUsize) -> Vec<Outcome>
    where
        F: Fn(usize) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Display,
    {
        let mut outcomes = Vec::new();
        loop {
            if self.abort.is_aborted() {
                debug!("Benchmark worker stopping on abort");
                break;
            }
            let iteration = next.fetch_add(1, Ordering::SeqCst);
            if iteration >= self.config.iterations {
                break;
            }

            let started = Instant::now();
            let outcome = match tokio::time::timeout(self.config.timeout, op(iteration)).await {
                Ok(Ok(_)) => Outcome::Success(elapsed_ms(started)),
                Ok(Err(e)) => {
                    debug!("Benchmark iteration {} failed: {}", iteration, e);
                    Outcome::Failed(elapsed_ms(started))
                }
                Err(_) => {
                    warn!(
                        "Benchmark iteration {} timed out after {:?}",
                        iteration, self.config.timeout
                    );
                    Outcome::TimedOut(elapsed_ms(started))
                }
            };

            if let Some(collector) = &self.collector {
                let (ms, ok) = match outcome {
                    Outcome::Success(ms) => (ms, true),
                    Outcome::Failed(ms) | Outcome::TimedOut(ms) => (ms, false),
                };
                collector.record_query(&self.config.name, ms, ok).await;
            }
            outcomes.push(outcome);
        }
        outcomes
    }
}

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::types::MetricsConfig;

    fn config(iterations: usize, concurrency: usize, timeout_ms: u64) -> BenchmarkConfig {
        BenchmarkConfig {
            name: "test".to_string(),
            iterations,
            concurrency,
            timeout: Duration::from_millis(timeout_ms),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_counts_and_latency() {
        let runner = BenchmarkRunner::new(config(20, 4, 1000)).unwrap();
        let result = runner
            .run(|i| async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                if i % 5 == 0 {
                    Err("boom")
                } else {
                    Ok(())
                }
            })
            .await;

        assert_eq!(result.completed, 20);
        assert_eq!(result.successful, 16);
        assert_eq!(result.failed, 4);
        assert_eq!(result.timed_out, 0);
        assert!(!result.aborted);
        assert_eq!(result.latency.count, 16);
        assert!(result.latency.p50 >= 10.0);
        assert!(result.throughput > 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_failure() {
        let runner = BenchmarkRunner::new(config(4, 2, 50)).unwrap();
        let result = runner
            .run(|i| async move {
                let delay = if i < 2 { 10 } else { 500 };
                tokio::time::sleep(Duration::from_millis(delay)).await;
                Ok::<_, String>(())
            })
            .await;

        assert_eq!(result.completed, 4);
        assert_eq!(result.timed_out, 2);
        assert_eq!(result.failed, 2);
        assert_eq!(result.successful, 2);
    }

    #[tokio::test]
    async fn test_abort_between_iterations() {
        let runner = BenchmarkRunner::new(config(1000, 1, 1000)).unwrap();
        let handle = runner.abort_handle();
        let result = runner
            .run(|i| {
                let handle = handle.clone();
                async move {
                    if i == 9 {
                        handle.abort();
                    }
                    Ok::<_, String>(())
                }
            })
            .await;

        assert!(result.aborted);
        assert_eq!(result.completed, 10);
    }

    #[tokio::test]
    async fn test_records_into_collector() {
        let collector = MetricsCollector::new(MetricsConfig::default()).unwrap();
        let runner = BenchmarkRunner::new(config(5, 2, 1000))
            .unwrap()
            .with_collector(collector.clone());
        runner.run(|_| async { Ok::<_, String>(()) }).await;

        let queries = collector.query_metrics().await;
        assert_eq!(queries.total, 5);
        assert_eq!(queries.failed, 0);
    }

    #[test]
    fn test_config_validation() {
        assert!(config(0, 1, 10).validate().is_err());
        assert!(config(1, 0, 10).validate().is_err());
        assert!(BenchmarkRunner::new(BenchmarkConfig::default()).is_ok());
    }
}
