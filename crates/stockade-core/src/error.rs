//! Error types for stockade-core

use thiserror::Error;

/// Failures of the sandbox machinery itself.
///
/// Sandboxed-code failures never surface here: they are reported through
/// [`crate::ExecutionStatus`]. Only [`StockadeError::InvalidRequest`] escapes
/// [`crate::Sandbox::execute`]; everything else is folded into a
/// `SupervisorError` result by the supervisor.
#[derive(Error, Debug)]
pub enum StockadeError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("seccomp error: {0}")]
    Seccomp(String),

    #[error("verdict channel error: {0}")]
    Channel(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StockadeError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }
}
