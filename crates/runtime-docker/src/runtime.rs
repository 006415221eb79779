use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use sandbox_core::{
    ContainerId, ContainerRuntime, ContainerSpec, ExecHandle, ExecSpec, OUTPUT_CHANNEL_CAPACITY,
    OutputChunk, OutputStreamKind, Result, SandboxError,
};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

use crate::command::{docker, docker_ignore_errors};
use crate::prerequisites::check_prerequisites;

/// Prefix for container names, so stale containers from a previous run can
/// be recognized.
const CONTAINER_PREFIX: &str = "sandbox-";

/// How long a cancelled exec gets to react to SIGTERM before SIGKILL.
const EXEC_KILL_GRACE: Duration = Duration::from_secs(5);

/// Exit code reported when the process was killed without a code.
const KILLED_EXIT_CODE: i32 = -1;

#[derive(Debug, Clone)]
pub struct DockerConfig {
    /// Docker binary, usually just "docker".
    pub binary: String,
    /// Working directory inside the container.
    pub workdir: String,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            binary: "docker".to_string(),
            workdir: "/workspace".to_string(),
        }
    }
}

/// `ContainerRuntime` backed by the Docker CLI.
///
/// Every operation is a direct `docker` invocation with an argument
/// vector; nothing goes through a host shell. Containers idle on
/// `sleep infinity` and jobs run via `docker exec`.
pub struct DockerRuntime {
    config: DockerConfig,
}

impl DockerRuntime {
    /// Create a runtime, verifying the binary and daemon are reachable.
    pub async fn new(config: DockerConfig) -> Result<Self> {
        check_prerequisites(&config.binary).await?;
        Ok(Self { config })
    }

    fn binary(&self) -> &str {
        &self.config.binary
    }
}

/// Quote a string for `sh -c` embedding.
fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Pidfile path for one exec, unique per invocation.
fn exec_pidfile(tag: &uuid::Uuid) -> String {
    format!("/tmp/.exec-{tag}.pid")
}

/// Send a signal to the process recorded in an exec pidfile (best-effort).
async fn signal_exec(binary: &str, container: &str, pidfile: &str, signal: &str) {
    let script = format!("[ -f {pidfile} ] && kill -{signal} $(cat {pidfile}) 2>/dev/null || true");
    docker_ignore_errors(binary, &["exec", container, "sh", "-c", &script]).await;
}

/// Pump one pipe into the chunk channel until EOF.
///
/// Keeps reading after the receiver drops so the process is never blocked
/// on a full pipe; late chunks are simply discarded.
async fn pump_stream<R>(mut reader: R, kind: OutputStreamKind, tx: mpsc::Sender<OutputChunk>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    use tokio::io::AsyncReadExt;

    let mut buf = vec![0u8; 8192];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        let Some(data) = buf.get(..n) else { return };
        if tx
            .send(OutputChunk {
                kind,
                data: data.to_vec(),
            })
            .await
            .is_err()
        {
            // Receiver gone — drain to EOF so the child never stalls.
            continue;
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    fn name(&self) -> &str {
        "docker"
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<ContainerId> {
        let name = format!("{CONTAINER_PREFIX}{}", spec.sandbox_id);
        let cpus = format!("{:.3}", f64::from(spec.limits.cpu_milli) / 1000.0);
        let memory = format!("{}m", spec.limits.memory_mb);

        let mut args: Vec<String> = vec![
            "create".into(),
            "--name".into(),
            name,
            "--network".into(),
            spec.network.clone(),
            "--cpus".into(),
            cpus,
            "--memory".into(),
            memory,
            "--workdir".into(),
            self.config.workdir.clone(),
            "--security-opt".into(),
            "no-new-privileges:true".into(),
            "--cap-drop".into(),
            "ALL".into(),
            "--cap-add".into(),
            "CHOWN,DAC_OVERRIDE,FOWNER,SETGID,SETUID".into(),
            "--tmpfs".into(),
            "/tmp:nosuid,size=100m".into(),
            "--label".into(),
            "managed-by=sandboxd".into(),
            "--env".into(),
            format!("SANDBOX_ID={}", spec.sandbox_id),
        ];
        for (k, v) in &spec.env {
            args.push("--env".into());
            args.push(format!("{k}={v}"));
        }
        args.push(spec.image.clone());
        args.push("sleep".into());
        args.push("infinity".into());

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let id = docker(self.binary(), &arg_refs)
            .await
            .map_err(|e| SandboxError::CreationFailed(e.to_string()))?;

        trace!(sandbox_id = %spec.sandbox_id, container = %id, "container created");
        Ok(ContainerId(id))
    }

    async fn start(&self, id: &ContainerId) -> Result<()> {
        docker(self.binary(), &["start", &id.0])
            .await
            .map_err(|e| SandboxError::StartFailed(e.to_string()))?;
        Ok(())
    }

    async fn stop(&self, id: &ContainerId, grace: Duration) -> Result<()> {
        let secs = grace.as_secs().to_string();
        docker(self.binary(), &["stop", "-t", &secs, &id.0])
            .await
            .map_err(|e| SandboxError::ExecFailed(format!("stop: {}", e.detail)))?;
        Ok(())
    }

    async fn kill(&self, id: &ContainerId) -> Result<()> {
        // The container may already be dead; that is not an error here.
        docker_ignore_errors(self.binary(), &["kill", &id.0]).await;
        Ok(())
    }

    async fn remove(&self, id: &ContainerId) -> Result<()> {
        docker_ignore_errors(self.binary(), &["rm", "-f", &id.0]).await;
        Ok(())
    }

    async fn is_running(&self, id: &ContainerId) -> Result<bool> {
        match docker(
            self.binary(),
            &["inspect", "--format", "{{.State.Running}}", &id.0],
        )
        .await
        {
            Ok(out) => Ok(out == "true"),
            Err(e) if e.detail.contains("No such") => {
                Err(SandboxError::ContainerNotFound(id.0.clone()))
            }
            Err(e) => Err(SandboxError::ExecFailed(format!("inspect: {}", e.detail))),
        }
    }

    async fn exec(&self, id: &ContainerId, spec: ExecSpec) -> Result<ExecHandle> {
        let tag = uuid::Uuid::new_v4();
        let pidfile = exec_pidfile(&tag);
        let joined = spec
            .command
            .iter()
            .map(|a| shell_quote(a))
            .collect::<Vec<_>>()
            .join(" ");
        // Record the shell pid before exec-ing into the command so a later
        // cancel can signal the real process from inside the container.
        let script = format!("echo $$ > {pidfile}; exec {joined}");

        let mut child = Command::new(self.binary())
            .args(["exec", &id.0, "sh", "-c", &script])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SandboxError::ExecFailed(format!("spawn docker exec: {e}")))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SandboxError::ExecFailed("no stdout pipe".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| SandboxError::ExecFailed("no stderr pipe".into()))?;

        let (tx, rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        let (exit_tx, exit_rx) = oneshot::channel();
        let cancel = CancellationToken::new();

        let out_pump = tokio::spawn(pump_stream(stdout, OutputStreamKind::Stdout, tx.clone()));
        let err_pump = tokio::spawn(pump_stream(stderr, OutputStreamKind::Stderr, tx));

        let binary = self.config.binary.clone();
        let container = id.0.clone();
        let token = cancel.clone();
        // Hard backstop past the caller's own deadline, so a dead caller
        // cannot leak a runaway exec.
        let backstop = spec.timeout + EXEC_KILL_GRACE * 2;

        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = token.cancelled() => {
                    signal_exec(&binary, &container, &pidfile, "TERM").await;
                    match tokio::time::timeout(EXEC_KILL_GRACE, child.wait()).await {
                        Ok(status) => status,
                        Err(_) => {
                            signal_exec(&binary, &container, &pidfile, "KILL").await;
                            let _ = child.kill().await;
                            child.wait().await
                        }
                    }
                }
                _ = tokio::time::sleep(backstop) => {
                    warn!(container = %container, "exec exceeded backstop, killing");
                    signal_exec(&binary, &container, &pidfile, "KILL").await;
                    let _ = child.kill().await;
                    child.wait().await
                }
            };

            // Deliver remaining buffered output before reporting exit.
            let _ = out_pump.await;
            let _ = err_pump.await;

            let result = status
                .map(|s| s.code().unwrap_or(KILLED_EXIT_CODE))
                .map_err(|e| SandboxError::ExecFailed(format!("wait: {e}")));
            let _ = exit_tx.send(result);

            let rm = format!("rm -f {pidfile}");
            docker_ignore_errors(&binary, &["exec", &container, "sh", "-c", &rm]).await;
        });

        Ok(ExecHandle {
            output: rx,
            exit: exit_rx,
            cancel,
        })
    }

    async fn write_file(
        &self,
        id: &ContainerId,
        path: &str,
        content: &[u8],
        mode: Option<u32>,
    ) -> Result<()> {
        let mut script = format!(
            "mkdir -p $(dirname {p}) && cat > {p}",
            p = shell_quote(path)
        );
        if let Some(mode) = mode {
            script.push_str(&format!(" && chmod {mode:o} {p}", p = shell_quote(path)));
        }
        let mut child = Command::new(self.binary())
            .args(["exec", "-i", &id.0, "sh", "-c", &script])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| SandboxError::ExecFailed(format!("spawn write_file: {e}")))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(content)
                .await
                .map_err(|e| SandboxError::ExecFailed(format!("write_file stdin: {e}")))?;
            drop(stdin);
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| SandboxError::ExecFailed(format!("write_file wait: {e}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SandboxError::ExecFailed(format!(
                "write_file {path}: {}",
                stderr.trim()
            )));
        }
        Ok(())
    }

    async fn read_file(&self, id: &ContainerId, path: &str) -> Result<Vec<u8>> {
        // Bypasses the string helper: file contents may be binary.
        let output = Command::new(self.binary())
            .args(["exec", &id.0, "cat", path])
            .output()
            .await
            .map_err(|e| SandboxError::ExecFailed(format!("read_file: {e}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SandboxError::ExecFailed(format!(
                "read_file {path}: {}",
                stderr.trim()
            )));
        }
        Ok(output.stdout)
    }
}
