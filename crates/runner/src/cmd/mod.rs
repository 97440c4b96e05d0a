mod benchmark;
mod run;
mod status;

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use playground::Executor;
use sandbox_docker::DockerRuntime;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::RunnerConfig;
use crate::error::RunnerResult;

pub use benchmark::{BenchmarkArgs, run_benchmark};
pub use run::{RunArgs, run_code};
pub use status::{StatusArgs, run_status};

const WARM_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Connect to Docker and start an executor for `config`.
async fn start_executor(config: &RunnerConfig) -> RunnerResult<Executor> {
    let executor_config = config.executor_config()?;
    let runtime = DockerRuntime::connect(config.docker_config()).await?;
    Ok(Executor::start(executor_config, Arc::new(runtime)).await?)
}

/// Wait until the pool is full or `limit` elapses. Returns whether it filled.
async fn wait_until_warm(executor: &Executor, limit: Duration) -> bool {
    let deadline = Instant::now() + limit;
    loop {
        let stats = executor.stats();
        if stats.ready >= stats.capacity {
            return true;
        }
        if Instant::now() >= deadline {
            warn!(ready = stats.ready, capacity = stats.capacity, "pool not full yet");
            return false;
        }
        tokio::time::sleep(WARM_POLL_INTERVAL).await;
    }
}

/// Token that is cancelled on the first Ctrl-C.
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupted, cancelling executions");
            trigger.cancel();
        }
    });
    cancel
}

/// Map a submission's exit code onto the process exit code.
fn exit_code(code: i64) -> ExitCode {
    match u8::try_from(code) {
        Ok(c) => ExitCode::from(c),
        Err(_) => {
            warn!(exit_code = code, "exit code out of u8 range, using 1");
            ExitCode::FAILURE
        }
    }
}
