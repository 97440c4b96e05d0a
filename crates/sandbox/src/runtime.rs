use async_trait::async_trait;

use crate::config::InstanceSpec;
use crate::error::Result;
use crate::types::{ExecId, ExecSession, InstanceId};

/// Narrow view of a container runtime: just enough to pre-create
/// instances, run one command in them and tear them down.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Human-readable name for this backend (e.g. "docker").
    fn name(&self) -> &str;
    /// Make sure `image` is present locally. Called once at startup.
    async fn pull_image(&self, image: &str) -> Result<()>;
    /// Create (but do not start) an instance.
    async fn create_instance(&self, spec: &InstanceSpec) -> Result<InstanceId>;
    async fn start_instance(&self, id: &InstanceId) -> Result<()>;
    /// Run `cmd` inside a running instance, attached to its combined
    /// stdout/stderr.
    async fn exec(&self, id: &InstanceId, cmd: &[String]) -> Result<ExecSession>;
    /// Exit code of a finished exec. An exec that is still running is an
    /// error.
    async fn inspect_exec(&self, exec: &ExecId) -> Result<i64>;
    /// Force-remove an instance, killing anything still running in it.
    async fn remove_instance(&self, id: &InstanceId) -> Result<()>;
}
