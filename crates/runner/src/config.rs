use std::path::Path;
use std::time::Duration;

use sandbox_docker::DockerConfig;
use serde::{Deserialize, Serialize};

use crate::error::{RunnerError, RunnerResult};

pub(crate) const DEFAULT_MEMORY_MB: u32 = 128;
pub(crate) const DEFAULT_TIMEOUT_MS: u64 = 5_000;

#[derive(Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunnerConfig {
    pub image: String,
    pub memory_mb: u32,
    pub cpu_limit: f64,
    pub timeout_ms: u64,
    pub pool_size: usize,
    pub interpreter: Vec<String>,
    pub user: String,
    pub docker: DockerSection,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        let defaults = playground::Config::default();
        Self {
            image: defaults.image,
            memory_mb: DEFAULT_MEMORY_MB,
            cpu_limit: defaults.cpu_limit,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            pool_size: defaults.pool_size,
            interpreter: defaults.interpreter,
            user: defaults.user,
            docker: DockerSection::default(),
        }
    }
}

/// Docker backend knobs.
#[derive(Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DockerSection {
    pub name_prefix: String,
    pub tmpfs_size: String,
    pub pids_limit: i64,
}

impl Default for DockerSection {
    fn default() -> Self {
        let defaults = DockerConfig::default();
        Self {
            name_prefix: defaults.name_prefix,
            tmpfs_size: defaults.tmpfs_size,
            pids_limit: defaults.pids_limit,
        }
    }
}

/// Load a config from a YAML file. Every field is optional.
pub async fn load(path: &Path) -> RunnerResult<RunnerConfig> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| RunnerError::Config(format!("read {}: {e}", path.display())))?;
    let config: RunnerConfig = serde_yaml_ng::from_str(&content)
        .map_err(|e| RunnerError::Config(format!("parse {}: {e}", path.display())))?;
    config.executor_config()?;
    Ok(config)
}

/// [`load`] when a path is given, defaults otherwise.
pub async fn load_or_default(path: Option<&Path>) -> RunnerResult<RunnerConfig> {
    match path {
        Some(path) => load(path).await,
        None => Ok(RunnerConfig::default()),
    }
}

impl RunnerConfig {
    /// Build and validate the executor configuration.
    pub fn executor_config(&self) -> RunnerResult<playground::Config> {
        let config = playground::Config {
            image: self.image.clone(),
            memory_limit: i64::from(self.memory_mb) * 1024 * 1024,
            cpu_limit: self.cpu_limit,
            timeout: Duration::from_millis(self.timeout_ms),
            pool_size: self.pool_size,
            interpreter: self.interpreter.clone(),
            user: self.user.clone(),
        };
        config
            .validate()
            .map_err(|e| RunnerError::Config(e.to_string()))?;
        Ok(config)
    }

    pub fn docker_config(&self) -> DockerConfig {
        DockerConfig {
            name_prefix: self.docker.name_prefix.clone(),
            tmpfs_size: self.docker.tmpfs_size.clone(),
            pids_limit: self.docker.pids_limit,
        }
    }
}
