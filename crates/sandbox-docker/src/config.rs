/// Label put on every container this backend creates, so leftovers from a
/// crashed process can be found with `docker ps --filter label=...`.
pub const OWNER_LABEL: &str = "io.playground.sandbox";

#[derive(Debug, Clone)]
pub struct DockerConfig {
    /// Container name prefix; a UUID is appended per instance.
    pub name_prefix: String,
    /// Size of the writable `/tmp` tmpfs (the root filesystem is read-only).
    pub tmpfs_size: String,
    /// Maximum number of processes inside one container.
    pub pids_limit: i64,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            name_prefix: "pg-sandbox-".into(),
            tmpfs_size: "16m".into(),
            pids_limit: 64,
        }
    }
}
