//! Sandboxed code execution on top of a warm pool of containers.
//!
//! [`Executor`] takes a pre-started instance from the [`Pool`], runs one
//! submission in it under a wall-clock deadline and destroys the instance
//! afterwards. Instances are never reused.

mod config;
mod demux;
mod error;
mod executor;
mod lease;
mod pool;
mod retry;
mod types;

#[cfg(test)]
mod testing;

pub use config::{
    Config, DEFAULT_CPU_LIMIT, DEFAULT_IMAGE, DEFAULT_MEMORY_LIMIT, DEFAULT_POOL_SIZE,
    DEFAULT_TIMEOUT, DEFAULT_USER,
};
pub use error::{ExecError, PoolError, Result};
pub use executor::Executor;
pub use lease::{Lease, SandboxInstance};
pub use pool::{Pool, PoolHealth, PoolSettings, PoolStats};
pub use types::{ExecutionRequest, ExecutionResult, TIMEOUT_EXIT_CODE};
