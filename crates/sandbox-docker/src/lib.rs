mod config;
mod runtime;

pub use config::{DockerConfig, OWNER_LABEL};
pub use runtime::DockerRuntime;
