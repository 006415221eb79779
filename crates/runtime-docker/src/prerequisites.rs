use sandbox_core::SandboxError;

use crate::command::docker;

/// Verify that the Docker backend is usable before the runtime is handed out.
///
/// Checks that the binary exists and that the daemon answers. Collects all
/// failures and returns them in a single `BackendNotAvailable` error.
pub async fn check_prerequisites(binary: &str) -> Result<(), SandboxError> {
    let mut errors = Vec::new();

    if which::which(binary).is_err() {
        errors.push(format!("docker binary not found: {binary}"));
    } else if let Err(e) = docker(binary, &["info", "--format", "{{.ServerVersion}}"]).await {
        errors.push(format!("docker daemon not reachable: {}", e.detail));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(SandboxError::BackendNotAvailable(errors.join("; ")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_binary_reported() {
        let err = check_prerequisites("definitely-not-a-docker-binary")
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::BackendNotAvailable(_)));
        assert!(err.to_string().contains("not found"), "got: {err}");
    }
}
