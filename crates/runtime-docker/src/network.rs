use sandbox_core::{Result, SandboxError};
use tracing::info;

use crate::command::docker;

/// Ensure the isolated sandbox bridge network exists.
///
/// Sandboxes are attached to a dedicated bridge with inter-container
/// communication disabled, so two sandboxes on the same network cannot
/// reach each other. Idempotent — an existing network is left untouched.
pub async fn ensure_isolated_network(binary: &str, name: &str) -> Result<()> {
    if docker(binary, &["network", "inspect", name]).await.is_ok() {
        info!(network = %name, "sandbox network exists");
        return Ok(());
    }

    docker(
        binary,
        &[
            "network",
            "create",
            "--driver",
            "bridge",
            "--opt",
            "com.docker.network.bridge.enable_icc=false",
            name,
        ],
    )
    .await
    .map_err(|e| SandboxError::BackendNotAvailable(format!("create network {name}: {e}")))?;

    info!(network = %name, "sandbox network created");
    Ok(())
}
