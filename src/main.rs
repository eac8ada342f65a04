use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Map};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use kb_cache::benchmark::{BenchmarkConfig, BenchmarkRunner};
use kb_cache::cache::{
    CacheConfig, CacheKeyBuilder, KeyNamespace, PersistentTier, SetOptions, TieredCacheManager,
};
use kb_cache::invalidation::{ChangeType, InvalidationConfig, InvalidationEngine, NoopBackend};
use kb_cache::metrics::{ExportFormat, MetricsCollector, MetricsConfig, PerformanceReportGenerator, ReportPeriod};

#[derive(Parser)]
#[command(name = "kb-cache")]
#[command(about = "Tiered cache, invalidation and performance metrics toolkit", long_about = None)]
struct Cli {
    /// Load cache settings from KB_CACHE_* environment variables (and .env)
    #[arg(long, global = true)]
    from_env: bool,

    /// Keep long-lived entries on disk under this directory
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a short cache + invalidation walkthrough and print the resulting stats
    Demo,

    /// Run the demo workload and export a performance report
    Report {
        /// hourly, daily, weekly or monthly
        #[arg(short, long, default_value = "hourly")]
        period: String,

        /// json, csv or html
        #[arg(short, long, default_value = "json")]
        format: String,

        /// Write to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Benchmark cache get/set round trips
    Bench {
        #[arg(long, default_value_t = 1000)]
        iterations: usize,

        #[arg(long, default_value_t = 8)]
        concurrency: usize,

        #[arg(long, default_value_t = 1000)]
        timeout_ms: u64,
    },
}

struct StackOptions {
    from_env: bool,
    data_dir: Option<PathBuf>,
}

struct Stack {
    cache: Arc<TieredCacheManager>,
    engine: Arc<InvalidationEngine>,
    collector: Arc<MetricsCollector>,
}

async fn build_stack(options: &StackOptions) -> Result<Stack> {
    let config = if options.from_env {
        CacheConfig::from_env().context("Invalid KB_CACHE_* configuration")?
    } else {
        CacheConfig::default()
    };
    let persistent = match &options.data_dir {
        Some(dir) => PersistentTier::on_disk(dir)
            .await
            .with_context(|| format!("Failed to open cache directory {}", dir.display()))?,
        None => PersistentTier::in_memory(),
    };
    let collector = MetricsCollector::new(MetricsConfig::default())?;
    let cache = TieredCacheManager::builder(config)
        .metrics(collector.clone())
        .persistent(persistent)
        .build()?;
    let engine = InvalidationEngine::new(cache.clone(), Arc::new(NoopBackend), InvalidationConfig::default())?;

    Ok(Stack {
        cache,
        engine,
        collector,
    })
}

async fn run_workload(stack: &Stack) -> Result<()> {
    let topics = ["jcl", "cobol", "vsam", "db2", "cics"];

    for topic in topics {
        let key = CacheKeyBuilder::new(KeyNamespace::Search).identifier(topic).build();
        let results = vec![format!("{} overview", topic), format!("{} troubleshooting", topic)];
        stack
            .cache
            .set(&key, &results, SetOptions::new().tag(KeyNamespace::Search.to_string()))
            .await?;
        stack
            .cache
            .set(
                &CacheKeyBuilder::new(KeyNamespace::User).identifier(topic).build(),
                &json!({ "recent": topic }),
                SetOptions::new().ttl(Duration::from_secs(60)),
            )
            .await?;
    }

    for (i, topic) in topics.iter().cycle().take(20).enumerate() {
        let key = CacheKeyBuilder::new(KeyNamespace::Search).identifier(*topic).build();
        let started = tokio::time::Instant::now();
        let hit: Option<Vec<String>> = stack.cache.get(&key).await;
        let elapsed = started.elapsed().as_secs_f64() * 1000.0;
        stack.collector.record_query(topic, elapsed + 40.0, hit.is_some()).await;
        stack
            .collector
            .record_response_time("/api/search", elapsed + 80.0 + i as f64, Some(200))
            .await;
    }
    let _: Option<String> = stack.cache.get("search:missing").await;

    let logout = stack.engine.trigger_user_action("logout", Map::new()).await;
    info!("Logout cleared {} keys", logout.affected_keys().len());

    stack
        .engine
        .trigger_data_change("entries/42", ChangeType::Update, Map::new())
        .await;
    // built-in search strategy is debounced
    tokio::time::sleep(Duration::from_millis(600)).await;

    Ok(())
}

async fn demo(options: &StackOptions) -> Result<()> {
    let stack = build_stack(options).await?;
    run_workload(&stack).await?;

    let summary = json!({
        "cache": stack.cache.stats().await,
        "invalidation": stack.engine.stats().await,
        "metrics": stack.collector.snapshot().await,
        "remaining_keys": stack.cache.keys(None).await?,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);

    stack.engine.shutdown().await;
    stack.cache.shutdown().await;
    Ok(())
}

async fn report(options: &StackOptions, period: &str, format: &str, output: Option<PathBuf>) -> Result<()> {
    let period: ReportPeriod = period.parse()?;
    let format: ExportFormat = format.parse()?;

    let stack = build_stack(options).await?;
    run_workload(&stack).await?;

    let generator = PerformanceReportGenerator::new(stack.collector.clone());
    let report = generator.generate_report(period).await;
    let rendered = generator.export(&report, format)?;

    match output {
        Some(path) => {
            tokio::fs::write(&path, rendered)
                .await
                .with_context(|| format!("Failed to write report to {}", path.display()))?;
            println!("Report written to {}", path.display());
        }
        None => println!("{}", rendered),
    }

    stack.engine.shutdown().await;
    stack.cache.shutdown().await;
    Ok(())
}

async fn bench(options: &StackOptions, iterations: usize, concurrency: usize, timeout_ms: u64) -> Result<()> {
    let stack = build_stack(options).await?;
    let runner = BenchmarkRunner::new(BenchmarkConfig {
        name: "cache-roundtrip".to_string(),
        iterations,
        concurrency,
        timeout: Duration::from_millis(timeout_ms),
    })?
    .with_collector(stack.collector.clone());

    let cache = stack.cache.clone();
    let result = runner
        .run(|i| {
            let cache = cache.clone();
            async move {
                let key = format!("entry:bench-{}", i % 256);
                cache.set(&key, &i, SetOptions::new().memory_only()).await?;
                cache
                    .get::<usize>(&key)
                    .await
                    .ok_or_else(|| kb_cache::CacheError::Other(format!("{} vanished", key)))
            }
        })
        .await;

    println!("{}", serde_json::to_string_pretty(&result)?);
    stack.cache.shutdown().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "kb_cache=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let options = StackOptions {
        from_env: cli.from_env,
        data_dir: cli.data_dir,
    };

    match cli.command {
        Commands::Demo => demo(&options).await,
        Commands::Report {
            period,
            format,
            output,
        } => report(&options, &period, &format, output).await,
        Commands::Bench {
            iterations,
            concurrency,
            timeout_ms,
        } => bench(&options, iterations, concurrency, timeout_ms).await,
    }
}
