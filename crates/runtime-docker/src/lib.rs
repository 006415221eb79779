mod command;
mod network;
mod prerequisites;
mod runtime;

pub use network::ensure_isolated_network;
pub use prerequisites::check_prerequisites;
pub use runtime::{DockerConfig, DockerRuntime};
