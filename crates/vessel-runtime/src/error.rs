use thiserror::Error;
use vessel_core::ContainerError;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Component not found: {0}")]
    ComponentNotFound(String),

    #[error("Compilation failed: {0}")]
    CompilationFailed(String),

    #[error("Instantiation failed: {0}")]
    InstantiationFailed(String),

    #[error("Invocation failed: {0}")]
    InvocationFailed(String),

    #[error("Component returned error: {0}")]
    ComponentError(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl RuntimeError {
    /// Report a failure to load the library at `path`.
    pub fn into_load_error(self, path: &str) -> ContainerError {
        ContainerError::LibraryLoad {
            path: path.to_string(),
            reason: self.to_string(),
        }
    }
}
