use sandbox::SandboxError;

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("acquire cancelled")]
    Cancelled,

    #[error("pool is shut down")]
    Closed,
}

/// Errors surfaced to callers of [`Executor`](crate::Executor).
///
/// `Display` output is deliberately generic: container ids and image names
/// stay in the logs and in [`source`](std::error::Error::source).
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("execution cancelled before a sandbox was acquired")]
    Cancelled,

    #[error("executor is shut down")]
    Unavailable,

    #[error("invalid request: {0}")]
    InvalidRequest(&'static str),

    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    #[error("sandbox infrastructure failure")]
    Infrastructure(#[source] SandboxError),
}

impl From<PoolError> for ExecError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::Cancelled => Self::Cancelled,
            PoolError::Closed => Self::Unavailable,
        }
    }
}

impl From<SandboxError> for ExecError {
    fn from(err: SandboxError) -> Self {
        Self::Infrastructure(err)
    }
}

pub type Result<T> = std::result::Result<T, ExecError>;
