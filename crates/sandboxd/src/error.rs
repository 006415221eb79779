use sandbox_core::{SandboxError, SandboxState};

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    /// Admission denied — recoverable by caller retry/backoff.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Container runtime failure during provisioning, after the internal retry.
    #[error("provision error: {0}")]
    Provision(String),

    /// Job submitted against a sandbox that is not Ready or Idle.
    #[error("sandbox not available (state: {0})")]
    SandboxNotAvailable(SandboxState),

    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition {
        from: SandboxState,
        to: SandboxState,
    },

    #[error("not found")]
    NotFound,

    /// Cancel (or cleanup) hit a job that already reached a terminal outcome.
    #[error("job already terminal")]
    AlreadyTerminal,

    /// Cleanup requested for a job still running.
    #[error("job not terminal yet")]
    NotTerminal,

    /// The one-shot output stream was already taken.
    #[error("output stream already consumed")]
    StreamConsumed,

    #[error("config error: {0}")]
    Config(String),

    #[error("runtime error: {0}")]
    Runtime(#[from] SandboxError),

    #[error("store error: {0}")]
    Store(String),
}

pub type ManagerResult<T> = Result<T, ManagerError>;
