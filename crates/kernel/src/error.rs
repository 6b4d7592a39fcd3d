//! Kernel error types.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by host capabilities to extension code.
///
/// Promise-shaped bindings settle rejections with one of these; synchronous
/// bindings return them directly. The embedding layer decides how each kind
/// renders inside the script engine.
#[derive(Debug, Error)]
pub enum HostError {
    /// The extension's manifest does not grant the capability at all.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// A concrete path failed the allowlist check.
    #[error("path not authorized: {}", path.display())]
    PathNotAuthorized { path: PathBuf },

    /// The operation needs an authenticated remote account and none is set.
    #[error("not authenticated")]
    NotAuthenticated,

    /// A host collaborator the operation depends on is not wired up.
    #[error("{0} is not available")]
    Unavailable(&'static str),

    /// The caller supplied a malformed or out-of-range argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The operation was cancelled by an abort signal or shutdown.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// The operation exceeded its deadline.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// A remote service returned a failure or could not be reached.
    #[error("upstream error: {0}")]
    Upstream(String),

    /// A cron expression failed to parse.
    #[error("invalid cron expression: {0}")]
    InvalidExpression(String),

    /// Everything else.
    #[error("internal error")]
    Internal(#[from] anyhow::Error),
}

impl HostError {
    /// Shorthand for the allowlist rejection, used by every gated capability.
    pub fn path_not_authorized(path: impl Into<PathBuf>) -> Self {
        Self::PathNotAuthorized { path: path.into() }
    }

    /// Shorthand for argument validation failures.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }
}

/// Result type alias using HostError.
pub type HostResult<T> = Result<T, HostError>;
