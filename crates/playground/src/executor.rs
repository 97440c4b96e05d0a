use std::sync::Arc;
use std::time::Duration;

use sandbox::{ContainerRuntime, ExecId, InstanceId, SandboxError};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::demux::Demux;
use crate::error::{ExecError, Result};
use crate::lease::Lease;
use crate::pool::{Pool, PoolSettings, PoolStats};
use crate::types::{ExecutionRequest, ExecutionResult, TIMEOUT_EXIT_CODE};

/// Budget for making the image available at startup.
const PULL_TIMEOUT: Duration = Duration::from_secs(120);
/// Budget for reading the exit code of a finished exec.
const INSPECT_TIMEOUT: Duration = Duration::from_secs(5);

const TIMED_OUT_NOTICE: &str = "\nExecution timed out.\n";
const CANCELLED_NOTICE: &str = "\nExecution cancelled.\n";

/// Why an exec stopped before its output ended.
#[derive(Debug, Clone, Copy)]
enum Interrupted {
    Deadline,
    Cancelled,
}

impl Interrupted {
    fn notice(self) -> &'static str {
        match self {
            Self::Deadline => TIMED_OUT_NOTICE,
            Self::Cancelled => CANCELLED_NOTICE,
        }
    }
}

/// Runs untrusted submissions, each in its own fresh instance taken from a
/// warm [`Pool`].
pub struct Executor {
    config: Config,
    runtime: Arc<dyn ContainerRuntime>,
    pool: Pool,
}

impl Executor {
    /// Validate `config`, make sure the image is present and start
    /// pre-warming instances.
    pub async fn start(config: Config, runtime: Arc<dyn ContainerRuntime>) -> Result<Self> {
        config.validate()?;

        info!(image = %config.image, backend = runtime.name(), "pulling sandbox image");
        tokio::time::timeout(PULL_TIMEOUT, runtime.pull_image(&config.image))
            .await
            .map_err(|_| SandboxError::Timeout {
                operation: "image pull",
                seconds: PULL_TIMEOUT.as_secs(),
            })?
            .inspect_err(|e| error!(image = %config.image, error = %e, "image pull failed"))?;

        let pool = Pool::new(
            Arc::clone(&runtime),
            PoolSettings {
                capacity: config.pool_size,
                spec: config.instance_spec(),
            },
        );
        pool.start();

        info!(
            pool_size = config.pool_size,
            timeout_ms = config.timeout.as_millis() as u64,
            "executor ready"
        );
        Ok(Self {
            config,
            runtime,
            pool,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Run `request` in a fresh instance and capture its output.
    ///
    /// A submission that fails, or runs past the configured timeout, still
    /// yields `Ok`: the latter with [`TIMEOUT_EXIT_CODE`] and whatever it
    /// printed so far. Cancelling `cancel` while waiting for an instance
    /// returns [`ExecError::Cancelled`]; cancelling it while the code runs
    /// ends the run the same way a timeout does.
    ///
    /// The instance is destroyed before this returns, on every path.
    pub async fn execute(
        &self,
        request: &ExecutionRequest,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult> {
        if request.code.trim().is_empty() {
            return Err(ExecError::InvalidRequest("code must not be empty"));
        }

        let started = Instant::now();
        let lease = self.pool.acquire(cancel).await?;
        let id = lease.id().clone();
        debug!(id = %id, "running submission");

        let deadline = Instant::now() + self.config.timeout;
        let outcome = self.run_in(&lease, &request.code, deadline, cancel).await;
        // Teardown is not part of the reported run time.
        let duration = started.elapsed();
        lease.release().await;

        match outcome {
            Ok(mut result) => {
                result.duration = duration;
                info!(
                    id = %id,
                    exit_code = result.exit_code,
                    duration_ms = result.duration.as_millis() as u64,
                    stdout_bytes = result.stdout.len(),
                    stderr_bytes = result.stderr.len(),
                    "submission finished"
                );
                Ok(result)
            }
            Err(e) => {
                error!(id = %id, error = %e, "submission failed on sandbox infrastructure");
                Err(ExecError::Infrastructure(e))
            }
        }
    }

    /// [`execute`](Self::execute) without caller cancellation.
    pub async fn run(&self, request: &ExecutionRequest) -> Result<ExecutionResult> {
        self.execute(request, &CancellationToken::new()).await
    }

    /// Stop the pool and destroy every idle instance. Executions already in
    /// flight finish normally; new ones fail with [`ExecError::Unavailable`].
    pub async fn shutdown(&self) {
        self.pool.stop().await;
    }

    async fn run_in(
        &self,
        lease: &Lease,
        code: &str,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> sandbox::Result<ExecutionResult> {
        let cmd = self.config.command_for(code);

        let session = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Ok(interrupted(String::new(), String::new(), Interrupted::Cancelled));
            }
            _ = tokio::time::sleep_until(deadline) => {
                return Ok(interrupted(String::new(), String::new(), Interrupted::Deadline));
            }
            session = self.runtime.exec(lease.id(), &cmd) => session?,
        };

        let exec_id = session.id;
        let mut demux = Demux::spawn(session.output);

        let stopped = tokio::select! {
            biased;
            _ = cancel.cancelled() => Some(Interrupted::Cancelled),
            _ = tokio::time::sleep_until(deadline) => Some(Interrupted::Deadline),
            finished = demux.finished() => {
                finished?;
                None
            }
        };

        let (stdout, stderr) = demux.collect();
        match stopped {
            Some(reason) => {
                warn!(id = %lease.id(), ?reason, "submission interrupted");
                Ok(interrupted(stdout, stderr, reason))
            }
            None => {
                let exit_code = self.exit_code(lease.id(), &exec_id).await?;
                Ok(ExecutionResult {
                    stdout,
                    stderr,
                    exit_code,
                    duration: Duration::ZERO,
                })
            }
        }
    }

    async fn exit_code(&self, id: &InstanceId, exec: &ExecId) -> sandbox::Result<i64> {
        let code = tokio::time::timeout(INSPECT_TIMEOUT, self.runtime.inspect_exec(exec))
            .await
            .map_err(|_| SandboxError::Timeout {
                operation: "exec inspect",
                seconds: INSPECT_TIMEOUT.as_secs(),
            })??;
        debug!(id = %id, exec = %exec, exit_code = code, "exec finished");
        Ok(code)
    }
}

fn interrupted(stdout: String, mut stderr: String, reason: Interrupted) -> ExecutionResult {
    stderr.push_str(reason.notice());
    ExecutionResult {
        stdout,
        stderr,
        exit_code: TIMEOUT_EXIT_CODE,
        duration: Duration::ZERO,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockRuntime;

    fn config(timeout: Duration, pool_size: usize) -> Config {
        Config {
            timeout,
            pool_size,
            ..Config::default()
        }
    }

    async fn executor(runtime: &Arc<MockRuntime>, config: Config) -> Executor {
        let executor = Executor::start(config, runtime.clone()).await.unwrap();
        for _ in 0..1000 {
            if executor.stats().ready == executor.config().pool_size {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        executor
    }

    #[tokio::test(start_paused = true)]
    async fn prints_and_exits_zero() {
        let runtime = Arc::new(MockRuntime::new());
        let executor = executor(&runtime, Config::default()).await;

        let result = executor
            .run(&ExecutionRequest::new("print(\"Hello, Playground!\")"))
            .await
            .unwrap();

        assert_eq!(result.stdout, "Hello, Playground!\n");
        assert_eq!(result.stderr, "");
        assert_eq!(result.exit_code, 0);
        assert!(result.succeeded());

        let targets = runtime.exec_targets();
        assert_eq!(targets.len(), 1);
        assert_eq!(runtime.removals_of(&targets[0]), 1);
        executor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn syntax_error_is_a_result_not_an_error() {
        let runtime = Arc::new(MockRuntime::new());
        let executor = executor(&runtime, Config::default()).await;

        let result = executor.run(&ExecutionRequest::new("print('unclosed")).await.unwrap();

        assert_ne!(result.exit_code, 0);
        assert!(result.stderr.contains("SyntaxError"));
        executor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stderr_and_exit_code_are_reported() {
        let runtime = Arc::new(MockRuntime::new());
        let executor = executor(&runtime, Config::default()).await;

        let code = "import sys\nprint('out')\nprint('bad input', file=sys.stderr)\nsys.exit(3)";
        let result = executor.run(&ExecutionRequest::new(code)).await.unwrap();

        assert_eq!(result.stdout, "out\n");
        assert_eq!(result.stderr, "bad input\n");
        assert_eq!(result.exit_code, 3);
        executor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn infinite_loop_times_out() {
        let runtime = Arc::new(MockRuntime::new());
        let executor = executor(&runtime, config(Duration::from_secs(2), 1)).await;

        let result = executor
            .run(&ExecutionRequest::new("while True: pass"))
            .await
            .unwrap();

        assert_eq!(result.exit_code, TIMEOUT_EXIT_CODE);
        assert!(result.timed_out());
        assert!(result.stderr.ends_with("Execution timed out.\n"));
        assert!(result.duration >= Duration::from_secs(2));
        assert!(result.duration < Duration::from_secs(3));

        let targets = runtime.exec_targets();
        assert_eq!(runtime.removals_of(&targets[0]), 1);
        executor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_keeps_partial_output() {
        let runtime = Arc::new(MockRuntime::new());
        let executor = executor(&runtime, config(Duration::from_secs(1), 1)).await;

        let code = "print('started')\nprint('warming up', file=sys.stderr)\nwhile True: pass";
        let result = executor.run(&ExecutionRequest::new(code)).await.unwrap();

        assert_eq!(result.exit_code, TIMEOUT_EXIT_CODE);
        assert_eq!(result.stdout, "started\n");
        assert_eq!(result.stderr, "warming up\n\nExecution timed out.\n");
        executor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn slow_but_in_time_finishes_normally() {
        let runtime = Arc::new(MockRuntime::new());
        let executor = executor(&runtime, config(Duration::from_secs(5), 1)).await;

        let result = executor
            .run(&ExecutionRequest::new("import time\ntime.sleep(2)\nprint('done')"))
            .await
            .unwrap();

        assert_eq!(result.exit_code, 0);
        assert_eq!(result.stdout, "done\n");
        assert!(result.duration >= Duration::from_secs(2));
        executor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn precancelled_execute_consumes_nothing() {
        let runtime = Arc::new(MockRuntime::new());
        let executor = executor(&runtime, config(Duration::from_secs(5), 2)).await;

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = executor
            .execute(&ExecutionRequest::new("print('x')"), &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, ExecError::Cancelled));
        assert!(runtime.exec_targets().is_empty());
        assert_eq!(runtime.total_removals(), 0);
        assert_eq!(executor.stats().ready, 2);
        executor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_mid_run_ends_like_a_timeout() {
        let runtime = Arc::new(MockRuntime::new());
        let executor = executor(&runtime, config(Duration::from_secs(30), 1)).await;

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            trigger.cancel();
        });

        let result = executor
            .execute(&ExecutionRequest::new("print('hi')\nwhile True: pass"), &cancel)
            .await
            .unwrap();

        assert_eq!(result.exit_code, TIMEOUT_EXIT_CODE);
        assert_eq!(result.stdout, "hi\n");
        assert!(result.stderr.ends_with("Execution cancelled.\n"));
        assert!(result.duration < Duration::from_secs(1));
        assert_eq!(runtime.removals_of(&runtime.exec_targets()[0]), 1);
        executor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn infrastructure_failure_still_removes_instance() {
        let runtime = Arc::new(MockRuntime::new());
        let executor = executor(&runtime, Config::default()).await;

        let err = executor
            .run(&ExecutionRequest::new("# fail-exec\nprint('x')"))
            .await
            .unwrap_err();

        assert!(matches!(err, ExecError::Infrastructure(_)));
        let target = &runtime.exec_targets()[0];
        assert_eq!(runtime.removals_of(target), 1);
        assert!(!err.to_string().contains(target.as_str()));
        executor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_execute_still_removes_instance() {
        let runtime = Arc::new(MockRuntime::new().with_remove_delay(Duration::from_secs(2)));
        let executor = Arc::new(executor(&runtime, config(Duration::from_secs(5), 1)).await);

        let running = {
            let executor = Arc::clone(&executor);
            tokio::spawn(async move { executor.run(&ExecutionRequest::new("print('hello')")).await })
        };
        // The exec finishes at once; the removal is still in flight.
        tokio::time::sleep(Duration::from_millis(500)).await;
        running.abort();
        tokio::time::sleep(Duration::from_secs(30)).await;

        let targets = runtime.exec_targets();
        assert_eq!(targets.len(), 1);
        assert_eq!(runtime.removals_of(&targets[0]), 1);
        assert_eq!(executor.stats().destroyed, 1);
        executor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn duration_excludes_instance_removal() {
        let runtime = Arc::new(MockRuntime::new().with_remove_delay(Duration::from_secs(3)));
        let executor = executor(&runtime, config(Duration::from_secs(5), 1)).await;

        let started = Instant::now();
        let result = executor
            .run(&ExecutionRequest::new("print('hello')"))
            .await
            .unwrap();

        assert_eq!(result.stdout, "hello\n");
        assert!(started.elapsed() >= Duration::from_secs(3));
        assert!(result.duration < Duration::from_secs(1), "{:?}", result.duration);
        executor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_executions_on_warm_pool_skip_creation() {
        let runtime = Arc::new(MockRuntime::new().with_create_delay(Duration::from_secs(2)));
        let executor = Arc::new(executor(&runtime, config(Duration::from_secs(5), 3)).await);
        assert_eq!(executor.stats().ready, 3);

        let mut handles = Vec::new();
        for n in 0..3 {
            let executor = Arc::clone(&executor);
            handles.push(tokio::spawn(async move {
                let started = Instant::now();
                let code = format!("print('warm {n}')");
                let result = executor.run(&ExecutionRequest::new(code)).await.unwrap();
                (started.elapsed(), result)
            }));
        }
        for (n, handle) in handles.into_iter().enumerate() {
            let (latency, result) = handle.await.unwrap();
            assert_eq!(result.stdout, format!("warm {n}\n"));
            assert!(latency < Duration::from_secs(1), "run {n} took {latency:?}");
            assert!(result.duration < Duration::from_secs(1));
        }

        executor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn every_execution_gets_a_fresh_instance() {
        let runtime = Arc::new(MockRuntime::new());
        let executor = Arc::new(executor(&runtime, config(Duration::from_secs(5), 3)).await);

        let mut handles = Vec::new();
        for n in 0..10 {
            let executor = Arc::clone(&executor);
            handles.push(tokio::spawn(async move {
                let code = format!("print('run {n}')");
                executor.run(&ExecutionRequest::new(code)).await.unwrap()
            }));
        }
        for (n, handle) in handles.into_iter().enumerate() {
            let result = handle.await.unwrap();
            assert_eq!(result.stdout, format!("run {n}\n"));
            assert_eq!(result.exit_code, 0);
        }

        let targets = runtime.exec_targets();
        let unique: std::collections::HashSet<_> = targets.iter().collect();
        assert_eq!(targets.len(), 10);
        assert_eq!(unique.len(), 10);
        for id in &targets {
            assert_eq!(runtime.removals_of(id), 1);
        }

        executor.shutdown().await;
        assert_eq!(runtime.live(), 0);
    }

    #[tokio::test]
    async fn empty_code_is_rejected_without_touching_the_pool() {
        let runtime = Arc::new(MockRuntime::new());
        let executor = Executor::start(Config::default(), runtime.clone()).await.unwrap();

        let err = executor.run(&ExecutionRequest::new("  \n")).await.unwrap_err();

        assert!(matches!(err, ExecError::InvalidRequest(_)));
        assert!(runtime.exec_targets().is_empty());
        executor.shutdown().await;
    }

    #[tokio::test]
    async fn start_pulls_image_once_and_validates_config() {
        let runtime = Arc::new(MockRuntime::new());
        let bad = Config {
            pool_size: 0,
            ..Config::default()
        };
        assert!(matches!(
            Executor::start(bad, runtime.clone()).await,
            Err(ExecError::InvalidConfig(_))
        ));
        assert!(runtime.pulled().is_empty());

        let executor = Executor::start(Config::default(), runtime.clone()).await.unwrap();
        assert_eq!(runtime.pulled(), vec!["python:3.12-alpine".to_string()]);
        executor.shutdown().await;
    }

    #[tokio::test]
    async fn failed_pull_is_an_infrastructure_error() {
        let runtime = Arc::new(MockRuntime::new().with_pull_failure());
        let err = Executor::start(Config::default(), runtime.clone()).await.err().unwrap();

        assert!(matches!(err, ExecError::Infrastructure(SandboxError::ImagePull(_))));
        assert_eq!(runtime.created(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn execute_after_shutdown_is_unavailable() {
        let runtime = Arc::new(MockRuntime::new());
        let executor = executor(&runtime, Config::default()).await;
        executor.shutdown().await;

        let err = executor.run(&ExecutionRequest::new("print('x')")).await.unwrap_err();

        assert!(matches!(err, ExecError::Unavailable));
        assert_eq!(runtime.live(), 0);
    }
}
