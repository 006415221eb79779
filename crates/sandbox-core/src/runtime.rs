use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::types::{ContainerId, ContainerSpec, ExecSpec, OutputChunk};

/// Capacity of the per-exec output channel. The producer awaits when the
/// channel is full, so a slow consumer throttles the process pump instead
/// of growing an unbounded buffer.
pub const OUTPUT_CHANNEL_CAPACITY: usize = 64;

/// Handle to a running in-container execution.
///
/// `output` closes when the process exits; `exit` then yields the exit
/// code, or an error if the runtime connection was lost. Triggering
/// `cancel` terminates the process; the handle still resolves `exit`.
pub struct ExecHandle {
    pub output: mpsc::Receiver<OutputChunk>,
    pub exit: oneshot::Receiver<Result<i32>>,
    pub cancel: CancellationToken,
}

/// Container runtime collaborator, consumed as a black box.
///
/// Implementations own the actual container processes; callers hold only
/// `ContainerId`s. All operations must be bounded — a hung runtime call
/// must not be able to stall the reaper sweep, so implementations apply
/// their own internal timeouts where the underlying tool can block.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Human-readable backend name (e.g. "docker").
    fn name(&self) -> &str;

    /// Create a container attached to the spec's isolated network with its
    /// resource limits applied. Does not start it.
    async fn create(&self, spec: &ContainerSpec) -> Result<ContainerId>;

    /// Start a created container.
    async fn start(&self, id: &ContainerId) -> Result<()>;

    /// Gracefully stop a container, waiting up to `grace` before the
    /// runtime escalates to SIGKILL.
    async fn stop(&self, id: &ContainerId, grace: Duration) -> Result<()>;

    /// Force-kill a container immediately.
    async fn kill(&self, id: &ContainerId) -> Result<()>;

    /// Remove a stopped container and its resources.
    async fn remove(&self, id: &ContainerId) -> Result<()>;

    /// Whether the container process is currently running. Used by the
    /// sweep for crash detection.
    async fn is_running(&self, id: &ContainerId) -> Result<bool>;

    /// Run a command inside the container, streaming output chunks.
    async fn exec(&self, id: &ContainerId, spec: ExecSpec) -> Result<ExecHandle>;

    /// Write a file into the container filesystem, optionally setting its
    /// permission bits.
    async fn write_file(
        &self,
        id: &ContainerId,
        path: &str,
        content: &[u8],
        mode: Option<u32>,
    ) -> Result<()>;

    /// Read a file from the container filesystem.
    async fn read_file(&self, id: &ContainerId, path: &str) -> Result<Vec<u8>>;
}
