use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Args;
use playground::{ExecutionRequest, ExecutionResult};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::config;
use crate::error::RunnerResult;

#[derive(Args)]
pub struct BenchmarkArgs {
    /// Python code every execution runs
    #[arg(long, default_value = "print('hello')")]
    code: String,
    /// Path to runner.yaml config file
    #[arg(long, short, env = "PLAYGROUND_CONFIG")]
    config: Option<PathBuf>,
    /// Number of executions fired at once
    #[arg(long, short = 'n', default_value_t = 10)]
    concurrency: usize,
    /// How long to wait for the pool to fill before firing
    #[arg(long, default_value_t = 60)]
    warmup_secs: u64,
}

/// Latency summary over completed calls.
#[derive(Debug, PartialEq)]
struct Summary {
    min_ms: u64,
    p50_ms: u64,
    p95_ms: u64,
    max_ms: u64,
    mean_ms: u64,
}

impl Summary {
    fn from_latencies(latencies: &mut [Duration]) -> Option<Self> {
        if latencies.is_empty() {
            return None;
        }
        latencies.sort_unstable();
        let ms = |d: Option<&Duration>| d.map_or(0, |d| d.as_millis() as u64);
        let pct = |p: usize| ms(latencies.get((latencies.len() - 1) * p / 100));
        let total: Duration = latencies.iter().sum();
        Some(Self {
            min_ms: ms(latencies.first()),
            p50_ms: pct(50),
            p95_ms: pct(95),
            max_ms: ms(latencies.last()),
            mean_ms: (total / latencies.len() as u32).as_millis() as u64,
        })
    }
}

pub async fn run_benchmark(args: BenchmarkArgs) -> RunnerResult<ExitCode> {
    let total = Instant::now();
    let runner_config = config::load_or_default(args.config.as_deref()).await?;

    let t = Instant::now();
    let executor = Arc::new(super::start_executor(&runner_config).await?);
    let warm = super::wait_until_warm(&executor, Duration::from_secs(args.warmup_secs)).await;
    let warmup_ms = t.elapsed().as_millis() as u64;
    info!(warmup_ms, warm, pool_size = runner_config.pool_size, "pool ready");

    let cancel = super::cancel_on_ctrl_c();
    let request = Arc::new(ExecutionRequest::new(args.code));
    let mut calls = JoinSet::new();
    for call in 0..args.concurrency {
        let executor = Arc::clone(&executor);
        let request = Arc::clone(&request);
        let cancel = cancel.clone();
        calls.spawn(async move {
            let t = Instant::now();
            let result = executor.execute(&request, &cancel).await;
            (call, t.elapsed(), result)
        });
    }

    let mut latencies = Vec::with_capacity(args.concurrency);
    let mut timeouts = 0usize;
    let mut failures = 0usize;
    while let Some(joined) = calls.join_next().await {
        let (call, latency, result) = match joined {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(error = %e, "benchmark task panicked");
                failures += 1;
                continue;
            }
        };
        let latency_ms = latency.as_millis() as u64;
        match result {
            Ok(ExecutionResult { exit_code, .. }) => {
                if exit_code == playground::TIMEOUT_EXIT_CODE {
                    timeouts += 1;
                }
                info!(call, latency_ms, exit_code, "call finished");
                latencies.push(latency);
            }
            Err(e) => {
                warn!(call, latency_ms, error = %e, "call failed");
                failures += 1;
            }
        }
    }

    let stats = executor.stats();
    executor.shutdown().await;
    let total_ms = total.elapsed().as_millis() as u64;

    match Summary::from_latencies(&mut latencies) {
        Some(s) => info!(
            calls = args.concurrency,
            completed = latencies.len(),
            timeouts,
            failures,
            min_ms = s.min_ms,
            p50_ms = s.p50_ms,
            p95_ms = s.p95_ms,
            max_ms = s.max_ms,
            mean_ms = s.mean_ms,
            created = stats.created,
            destroyed = stats.destroyed,
            total_ms,
            "benchmark complete"
        ),
        None => warn!(calls = args.concurrency, failures, total_ms, "no call completed"),
    }

    Ok(if failures == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
