#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("backend not available: {0}")]
    BackendNotAvailable(String),

    #[error("image pull failed: {0}")]
    ImagePull(String),

    #[error("instance creation failed: {0}")]
    CreationFailed(String),

    #[error("instance start failed: {0}")]
    StartFailed(String),

    #[error("exec failed: {0}")]
    ExecFailed(String),

    #[error("exec inspect failed: {0}")]
    InspectFailed(String),

    #[error("instance removal failed: {0}")]
    RemoveFailed(String),

    #[error("instance not found: {0}")]
    NotFound(String),

    #[error("{operation} timed out after {seconds}s")]
    Timeout { operation: &'static str, seconds: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SandboxError>;
