//! In-memory [`ContainerRuntime`] for unit tests.
//!
//! Exec runs a tiny line interpreter instead of Python:
//!
//! - `print("x")` writes `x\n` to stdout, `print("x", file=sys.stderr)` to stderr
//! - `time.sleep(N)` pauses for N seconds (tokio time, so paused clocks work)
//! - `while True: pass` never finishes
//! - `exit(N)` / `sys.exit(N)` stops with exit code N
//! - `import ...`, comments and blank lines are ignored
//! - anything else is a syntax error with exit code 1
//!
//! A `# fail-exec` line makes the exec call itself fail.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use sandbox::{
    ContainerRuntime, ExecId, ExecSession, InstanceId, InstanceSpec, OutputChunk, SandboxError,
};

enum Step {
    Emit(OutputChunk),
    Sleep(Duration),
    Hang,
}

struct Script {
    steps: Vec<Step>,
    /// `None` while the script can still be running when inspected.
    exit_code: Option<i64>,
}

fn string_literal(s: &str) -> Option<&str> {
    let s = s.trim();
    s.strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .or_else(|| s.strip_prefix('\'').and_then(|s| s.strip_suffix('\'')))
}

fn parse_exit(line: &str) -> Option<i64> {
    let arg = line
        .strip_prefix("sys.exit(")
        .or_else(|| line.strip_prefix("exit("))?
        .strip_suffix(')')?;
    arg.trim().parse().ok()
}

fn interpret(code: &str) -> Script {
    let mut steps = Vec::new();
    for line in code.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') || line.starts_with("import ") {
            continue;
        }
        if line == "while True: pass" {
            steps.push(Step::Hang);
            return Script {
                steps,
                exit_code: None,
            };
        }
        if let Some(code) = parse_exit(line) {
            return Script {
                steps,
                exit_code: Some(code),
            };
        }
        if let Some(secs) = line
            .strip_prefix("time.sleep(")
            .and_then(|s| s.strip_suffix(')'))
            .and_then(|s| s.trim().parse::<f64>().ok())
        {
            steps.push(Step::Sleep(Duration::from_secs_f64(secs)));
            continue;
        }
        if let Some(args) = line.strip_prefix("print(").and_then(|s| s.strip_suffix(')')) {
            let (text, to_stderr) = match args.strip_suffix(", file=sys.stderr") {
                Some(text) => (text, true),
                None => (args, false),
            };
            if let Some(text) = string_literal(text) {
                let bytes = Bytes::from(format!("{text}\n"));
                steps.push(Step::Emit(if to_stderr {
                    OutputChunk::Stderr(bytes)
                } else {
                    OutputChunk::Stdout(bytes)
                }));
                continue;
            }
        }
        steps.push(Step::Emit(OutputChunk::Stderr(Bytes::from_static(
            b"SyntaxError: invalid syntax\n",
        ))));
        return Script {
            steps,
            exit_code: Some(1),
        };
    }
    Script {
        steps,
        exit_code: Some(0),
    }
}

#[derive(Default)]
struct MockState {
    next_id: u64,
    create_attempts: u32,
    created: u32,
    fail_creates: u32,
    fail_starts: u32,
    live: HashSet<InstanceId>,
    removals: HashMap<InstanceId, u32>,
    execs: HashMap<ExecId, Option<i64>>,
    exec_targets: Vec<InstanceId>,
    pulled: Vec<String>,
}

#[derive(Default)]
pub(crate) struct MockRuntime {
    state: Mutex<MockState>,
    create_delay: Duration,
    remove_delay: Duration,
    fail_pull: bool,
}

impl MockRuntime {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_create_delay(mut self, delay: Duration) -> Self {
        self.create_delay = delay;
        self
    }

    pub(crate) fn with_remove_delay(mut self, delay: Duration) -> Self {
        self.remove_delay = delay;
        self
    }

    pub(crate) fn with_pull_failure(mut self) -> Self {
        self.fail_pull = true;
        self
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    pub(crate) fn fail_next_creates(&self, n: u32) {
        self.state().fail_creates = n;
    }

    pub(crate) fn fail_next_starts(&self, n: u32) {
        self.state().fail_starts = n;
    }

    /// Create and start an instance outside of any pool.
    pub(crate) async fn spawn_instance(&self) -> InstanceId {
        let spec = InstanceSpec::sandboxed(
            "test",
            sandbox::ResourceLimits {
                memory_bytes: 1,
                cpus: 1.0,
            },
            "nobody",
        );
        let id = self.create_instance(&spec).await.unwrap();
        self.start_instance(&id).await.unwrap();
        id
    }

    pub(crate) fn create_attempts(&self) -> u32 {
        self.state().create_attempts
    }

    /// Successful creations.
    pub(crate) fn created(&self) -> u32 {
        self.state().created
    }

    /// Instances created and not yet removed.
    pub(crate) fn live(&self) -> usize {
        self.state().live.len()
    }

    pub(crate) fn removals_of(&self, id: &InstanceId) -> u32 {
        self.state().removals.get(id).copied().unwrap_or(0)
    }

    pub(crate) fn total_removals(&self) -> u32 {
        self.state().removals.values().sum()
    }

    pub(crate) fn removal_counts(&self) -> HashMap<InstanceId, u32> {
        self.state().removals.clone()
    }

    /// Instance each exec ran in, in call order.
    pub(crate) fn exec_targets(&self) -> Vec<InstanceId> {
        self.state().exec_targets.clone()
    }

    pub(crate) fn pulled(&self) -> Vec<String> {
        self.state().pulled.clone()
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    fn name(&self) -> &str {
        "mock"
    }

    async fn pull_image(&self, image: &str) -> sandbox::Result<()> {
        if self.fail_pull {
            return Err(SandboxError::ImagePull(format!("{image}: not found")));
        }
        self.state().pulled.push(image.to_string());
        Ok(())
    }

    async fn create_instance(&self, _spec: &InstanceSpec) -> sandbox::Result<InstanceId> {
        if !self.create_delay.is_zero() {
            tokio::time::sleep(self.create_delay).await;
        }
        let mut state = self.state();
        state.create_attempts += 1;
        if state.fail_creates > 0 {
            state.fail_creates -= 1;
            return Err(SandboxError::CreationFailed("daemon unavailable".into()));
        }
        state.next_id += 1;
        let id = InstanceId::new(format!("mock-{}", state.next_id));
        state.created += 1;
        state.live.insert(id.clone());
        Ok(id)
    }

    async fn start_instance(&self, id: &InstanceId) -> sandbox::Result<()> {
        let mut state = self.state();
        if !state.live.contains(id) {
            return Err(SandboxError::NotFound(id.to_string()));
        }
        if state.fail_starts > 0 {
            state.fail_starts -= 1;
            return Err(SandboxError::StartFailed(format!("{id}: oci runtime error")));
        }
        Ok(())
    }

    async fn exec(&self, id: &InstanceId, cmd: &[String]) -> sandbox::Result<ExecSession> {
        let code = cmd.last().map(String::as_str).unwrap_or_default();
        let mut state = self.state();
        if !state.live.contains(id) {
            return Err(SandboxError::NotFound(id.to_string()));
        }
        state.exec_targets.push(id.clone());
        if code.lines().any(|l| l.trim() == "# fail-exec") {
            return Err(SandboxError::ExecFailed(format!("create exec in {id}: broken pipe")));
        }

        let script = interpret(code);
        let exec_id = ExecId::new(format!("exec-{}", state.exec_targets.len()));
        state.execs.insert(exec_id.clone(), script.exit_code);

        let output = futures_util::stream::unfold(script.steps.into_iter(), |mut steps| async move {
            loop {
                match steps.next()? {
                    Step::Emit(chunk) => return Some((Ok::<_, SandboxError>(chunk), steps)),
                    Step::Sleep(d) => tokio::time::sleep(d).await,
                    Step::Hang => std::future::pending::<()>().await,
                }
            }
        });
        Ok(ExecSession {
            id: exec_id,
            output: output.boxed(),
        })
    }

    async fn inspect_exec(&self, exec: &ExecId) -> sandbox::Result<i64> {
        match self.state().execs.get(exec) {
            Some(Some(code)) => Ok(*code),
            Some(None) => Err(SandboxError::InspectFailed(format!("{exec} still running"))),
            None => Err(SandboxError::NotFound(exec.to_string())),
        }
    }

    async fn remove_instance(&self, id: &InstanceId) -> sandbox::Result<()> {
        if !self.remove_delay.is_zero() {
            tokio::time::sleep(self.remove_delay).await;
        }
        let mut state = self.state();
        *state.removals.entry(id.clone()).or_insert(0) += 1;
        if state.live.remove(id) {
            Ok(())
        } else {
            Err(SandboxError::NotFound(id.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interpreter_handles_basic_scripts() {
        let script = interpret("import sys\nprint(\"hi\")\nprint('err', file=sys.stderr)\nexit(3)");
        assert_eq!(script.exit_code, Some(3));
        assert_eq!(script.steps.len(), 2);

        assert_eq!(interpret("print('x'").exit_code, Some(1));
        assert_eq!(interpret("while True: pass").exit_code, None);
        assert_eq!(interpret("# only a comment").exit_code, Some(0));
    }
}
