use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Args;
use playground::PoolStats;
use serde::Serialize;
use tokio::time::Instant;
use tracing::info;

use crate::config;
use crate::error::{RunnerError, RunnerResult};

#[derive(Args)]
pub struct StatusArgs {
    /// Path to runner.yaml config file
    #[arg(long, short, env = "PLAYGROUND_CONFIG")]
    config: Option<PathBuf>,
    /// How long to wait for the pool to fill
    #[arg(long, default_value_t = 30)]
    wait_secs: u64,
}

#[derive(Debug, Serialize)]
struct StatusReport<'a> {
    image: &'a str,
    warm: bool,
    warmup_ms: u64,
    pool: PoolStats,
}

/// Start a pool, let it warm up and print what it looks like as JSON.
/// Exits nonzero if the pool did not fill in time.
pub async fn run_status(args: StatusArgs) -> RunnerResult<ExitCode> {
    let runner_config = config::load_or_default(args.config.as_deref()).await?;

    let t = Instant::now();
    let executor = super::start_executor(&runner_config).await?;
    let warm = super::wait_until_warm(&executor, Duration::from_secs(args.wait_secs)).await;
    let report = StatusReport {
        image: &runner_config.image,
        warm,
        warmup_ms: t.elapsed().as_millis() as u64,
        pool: executor.stats(),
    };
    executor.shutdown().await;
    info!(warm, "status collected");

    let json = serde_json::to_string_pretty(&report)
        .map_err(|e| RunnerError::Internal(format!("serialize status: {e}")))?;
    println!("{json}");

    Ok(if warm {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
