use thiserror::Error;

use crate::types::Handle;

#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("handle {0} is already active")]
    DuplicateHandle(Handle),

    #[error("no active component with handle {0}")]
    NotFound(Handle),

    #[error("failed to load library '{path}': {reason}")]
    LibraryLoad { path: String, reason: String },

    #[error("failed to construct component '{name}': {reason}")]
    Construction { name: String, reason: String },

    #[error("configuration error for '{name}': {reason}")]
    Configuration { name: String, reason: String },

    #[error("no configuration entry for '{0}'")]
    ConfigNotFound(String),

    #[error("object adapter refused '{name}': {reason}")]
    AdapterActivation { name: String, reason: String },

    #[error("etherealize failed for '{object_id}': {reason}")]
    Etherealize { object_id: String, reason: String },

    #[error("manager unreachable: {0}")]
    ManagerUnreachable(String),

    #[error("authentication with manager failed: {0}")]
    Authentication(String),

    #[error("cannot {operation} while container is {state}")]
    InvalidState { operation: &'static str, state: String },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("registry corrupted: {0}")]
    RegistryCorrupted(String),

    #[error("could not resolve '{curl}': {reason}")]
    ResolveFailed { curl: String, reason: String },

    #[error("reference implements '{actual}', expected '{expected}'")]
    NarrowingFailed { expected: String, actual: String },

    #[error("invocation of '{operation}' failed: {reason}")]
    Invocation { operation: String, reason: String },

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("container is shutting down")]
    ShuttingDown,

    #[error("system error: {0}")]
    System(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl ContainerError {
    /// Whether the caller may retry the same operation unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ContainerError::ManagerUnreachable(_) | ContainerError::Timeout(_))
    }
}
