use tokio::process::Command;
use tracing::trace;

/// Error from a failed `docker` invocation.
#[derive(Debug, thiserror::Error)]
#[error("command failed: {command}\n{detail}")]
pub struct CommandError {
    pub command: String,
    pub detail: String,
}

/// Format a human-readable display string for a docker invocation.
fn format_command_display(binary: &str, args: &[&str]) -> String {
    let mut parts = Vec::with_capacity(args.len() + 1);
    parts.push(binary);
    parts.extend_from_slice(args);
    parts.join(" ")
}

/// Run `docker` with the given arguments.
///
/// Invokes the binary directly with an argument vector — never through a
/// shell. Returns trimmed stdout on success, stderr in the error otherwise.
pub async fn docker(binary: &str, args: &[&str]) -> Result<String, CommandError> {
    let cmd_display = format_command_display(binary, args);
    trace!(command = %cmd_display, "docker");

    let output = Command::new(binary)
        .args(args)
        .output()
        .await
        .map_err(|e| CommandError {
            command: cmd_display.clone(),
            detail: e.to_string(),
        })?;

    if output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok(stdout)
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        Err(CommandError {
            command: cmd_display,
            detail: stderr,
        })
    }
}

/// Run `docker`, logging and discarding any failure.
///
/// Used on cleanup paths where the container may already be gone.
pub async fn docker_ignore_errors(binary: &str, args: &[&str]) {
    let cmd_display = format_command_display(binary, args);
    trace!(command = %cmd_display, "docker_ignore_errors");

    match Command::new(binary).args(args).output().await {
        Ok(o) if !o.status.success() => {
            let stderr = String::from_utf8_lossy(&o.stderr);
            trace!(command = %cmd_display, stderr = %stderr.trim(), "command failed (ignored)");
        }
        Err(e) => {
            trace!(command = %cmd_display, error = %e, "command failed to spawn (ignored)");
        }
        _ => {}
    }
}
