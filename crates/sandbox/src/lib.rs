mod config;
mod error;
mod runtime;
mod types;

pub use config::{InstanceSpec, KEEPALIVE_CMD, NetworkMode, ResourceLimits};
pub use error::{Result, SandboxError};
pub use runtime::ContainerRuntime;
pub use types::{ExecId, ExecSession, InstanceId, OutputChunk, OutputStream};
