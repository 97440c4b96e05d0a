use std::time::Duration;

use sandbox::{InstanceSpec, ResourceLimits};

use crate::error::{ExecError, Result};

pub const DEFAULT_IMAGE: &str = "python:3.12-alpine";
pub const DEFAULT_MEMORY_LIMIT: i64 = 128 * 1024 * 1024;
pub const DEFAULT_CPU_LIMIT: f64 = 0.5;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_POOL_SIZE: usize = 3;
pub const DEFAULT_USER: &str = "nobody";

/// Executor parameters. Fixed once the executor is started.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Image every sandbox instance is created from.
    pub image: String,
    /// Memory cap per instance, in bytes.
    pub memory_limit: i64,
    /// CPU share per instance as a fraction of one core.
    pub cpu_limit: f64,
    /// Wall-clock budget for a single submission.
    pub timeout: Duration,
    /// Number of idle instances kept warm.
    pub pool_size: usize,
    /// Argv prefix; the submitted code is appended as the last argument.
    pub interpreter: Vec<String>,
    /// User the instance (and therefore the submission) runs as.
    pub user: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            image: DEFAULT_IMAGE.into(),
            memory_limit: DEFAULT_MEMORY_LIMIT,
            cpu_limit: DEFAULT_CPU_LIMIT,
            timeout: DEFAULT_TIMEOUT,
            pool_size: DEFAULT_POOL_SIZE,
            interpreter: vec!["python".into(), "-c".into()],
            user: DEFAULT_USER.into(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.image.trim().is_empty() {
            return Err(ExecError::InvalidConfig("image must not be empty"));
        }
        if self.memory_limit <= 0 {
            return Err(ExecError::InvalidConfig("memory limit must be positive"));
        }
        if !self.cpu_limit.is_finite() || self.cpu_limit <= 0.0 {
            return Err(ExecError::InvalidConfig("cpu limit must be a positive number"));
        }
        if self.timeout.is_zero() {
            return Err(ExecError::InvalidConfig("timeout must be non-zero"));
        }
        if self.pool_size == 0 {
            return Err(ExecError::InvalidConfig("pool size must be at least 1"));
        }
        if self.interpreter.is_empty() {
            return Err(ExecError::InvalidConfig("interpreter must not be empty"));
        }
        if self.user.trim().is_empty() {
            return Err(ExecError::InvalidConfig("user must not be empty"));
        }
        Ok(())
    }

    pub(crate) fn instance_spec(&self) -> InstanceSpec {
        InstanceSpec::sandboxed(
            self.image.clone(),
            ResourceLimits {
                memory_bytes: self.memory_limit,
                cpus: self.cpu_limit,
            },
            self.user.clone(),
        )
    }

    /// Full argv running `code` with the configured interpreter.
    pub(crate) fn command_for(&self, code: &str) -> Vec<String> {
        let mut cmd = Vec::with_capacity(self.interpreter.len() + 1);
        cmd.extend(self.interpreter.iter().cloned());
        cmd.push(code.to_string());
        cmd
    }
}
