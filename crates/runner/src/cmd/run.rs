use std::path::PathBuf;
use std::process::ExitCode;

use clap::Args;
use playground::ExecutionRequest;
use tokio::io::AsyncReadExt;
use tracing::info;

use crate::config;
use crate::error::{RunnerError, RunnerResult};

#[derive(Args)]
pub struct RunArgs {
    /// Python file to execute; reads stdin when omitted
    file: Option<PathBuf>,
    /// Path to runner.yaml config file
    #[arg(long, short, env = "PLAYGROUND_CONFIG")]
    config: Option<PathBuf>,
    /// Override the execution timeout in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,
    /// Print the whole result as JSON instead of the raw output
    #[arg(long)]
    json: bool,
}

pub async fn run_code(args: RunArgs) -> RunnerResult<ExitCode> {
    let mut runner_config = config::load_or_default(args.config.as_deref()).await?;
    // One submission needs exactly one instance.
    runner_config.pool_size = 1;
    if let Some(ms) = args.timeout_ms {
        runner_config.timeout_ms = ms;
    }

    let code = match &args.file {
        Some(path) => tokio::fs::read_to_string(path)
            .await
            .map_err(|e| RunnerError::Config(format!("read {}: {e}", path.display())))?,
        None => {
            let mut code = String::new();
            tokio::io::stdin().read_to_string(&mut code).await?;
            code
        }
    };

    let executor = super::start_executor(&runner_config).await?;
    let cancel = super::cancel_on_ctrl_c();
    let result = executor
        .execute(&ExecutionRequest::new(code), &cancel)
        .await;
    executor.shutdown().await;
    let result = result?;

    info!(
        exit_code = result.exit_code,
        duration_ms = result.duration.as_millis() as u64,
        "execution complete"
    );

    if args.json {
        let json = serde_json::to_string_pretty(&result)
            .map_err(|e| RunnerError::Internal(format!("serialize result: {e}")))?;
        println!("{json}");
    } else {
        if !result.stdout.is_empty() {
            print!("{}", result.stdout);
        }
        if !result.stderr.is_empty() {
            eprint!("{}", result.stderr);
        }
    }

    Ok(super::exit_code(result.exit_code))
}
