/// Command every pooled container idles on until an exec arrives.
pub const KEEPALIVE_CMD: [&str; 2] = ["sleep", "infinity"];

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceLimits {
    /// Hard memory cap in bytes.
    pub memory_bytes: i64,
    /// CPU share as a fraction of one core (0.5 = half a core).
    pub cpus: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkMode {
    /// No network interfaces besides loopback.
    Isolated,
}

/// Everything a runtime needs to create one sandbox instance.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceSpec {
    pub image: String,
    pub resources: ResourceLimits,
    pub network: NetworkMode,
    pub read_only_root: bool,
    pub user: String,
    pub cmd: Vec<String>,
}

impl InstanceSpec {
    /// Locked-down spec: isolated network, read-only root, unprivileged user.
    pub fn sandboxed(
        image: impl Into<String>,
        resources: ResourceLimits,
        user: impl Into<String>,
    ) -> Self {
        Self {
            image: image.into(),
            resources,
            network: NetworkMode::Isolated,
            read_only_root: true,
            user: user.into(),
            cmd: KEEPALIVE_CMD.iter().map(|s| (*s).to_string()).collect(),
        }
    }
}
