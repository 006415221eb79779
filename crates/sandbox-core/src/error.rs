use crate::state::SandboxState;

#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("backend not available: {0}")]
    BackendNotAvailable(String),

    #[error("container creation failed: {0}")]
    CreationFailed(String),

    #[error("container start failed: {0}")]
    StartFailed(String),

    #[error("execution failed: {0}")]
    ExecFailed(String),

    #[error("container not found: {0}")]
    ContainerNotFound(String),

    #[error("invalid state transition: {from:?} -> {to:?}")]
    InvalidTransition {
        from: SandboxState,
        to: SandboxState,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SandboxError>;
