mod error;
mod runtime;
mod state;
mod types;

pub use error::{Result, SandboxError};
pub use runtime::{ContainerRuntime, ExecHandle, OUTPUT_CHANNEL_CAPACITY};
pub use state::SandboxState;
pub use types::{
    ContainerId, ContainerSpec, ExecSpec, ExecutionJob, JobOutcome, OutputChunk, OutputStreamKind,
    ResourceLimits, SandboxRecord,
};
