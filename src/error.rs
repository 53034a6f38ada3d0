//! Error taxonomy shared by the jail, the runner, the multiplexer and the façade.
//!
//! Every variant maps to a stable code returned to clients alongside the
//! human-readable message, so a UI can branch on the kind without parsing text.

use thiserror::Error;

use crate::ids::{SessionId, StreamId};

/// Top-level error type for gateway operations.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// A path resolved outside the workspace root.
    #[error("path escapes the workspace: {0}")]
    PathEscape(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("is a directory: {0}")]
    IsADirectory(String),

    /// The workspace root itself cannot be deleted, renamed or overwritten.
    #[error("the workspace root cannot be modified")]
    RootProtected,

    /// The child could not be started (missing binary, permission denied, ...).
    #[error("failed to start {program}: {reason}")]
    SpawnFailed { program: String, reason: String },

    #[error("session {session} already has {limit} running processes")]
    ResourceLimitExceeded { session: SessionId, limit: usize },

    #[error("invalid package name {0:?}")]
    InvalidPackageName(String),

    #[error("language {0:?} is not enabled on this gateway")]
    UnsupportedLanguage(String),

    #[error("unknown stream {0}")]
    UnknownStream(StreamId),

    #[error("stream {0} does not accept input")]
    NotInteractive(StreamId),

    /// The process is not consuming its input; retry later.
    #[error("stream {0} is not reading its input")]
    StreamBusy(StreamId),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Infrastructure failure (pipe, fork, filesystem I/O). Fatal to the
    /// operation only.
    #[error("system failure while {context}: {source}")]
    SystemFailure {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl GatewayError {
    /// Wrap an I/O error that has no more specific meaning.
    pub fn system(context: impl Into<String>, source: std::io::Error) -> Self {
        GatewayError::SystemFailure {
            context: context.into(),
            source,
        }
    }

    /// Stable, client-visible error code.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::PathEscape(_) => "PathEscape",
            GatewayError::NotFound(_) => "NotFound",
            GatewayError::NotADirectory(_) => "NotADirectory",
            GatewayError::IsADirectory(_) => "IsADirectory",
            GatewayError::RootProtected => "RootProtected",
            GatewayError::SpawnFailed { .. } => "SpawnFailed",
            GatewayError::ResourceLimitExceeded { .. } => "ResourceLimitExceeded",
            GatewayError::InvalidPackageName(_) => "InvalidPackageName",
            GatewayError::UnsupportedLanguage(_) => "UnsupportedLanguage",
            GatewayError::UnknownStream(_) => "UnknownStream",
            GatewayError::NotInteractive(_) => "NotInteractive",
            GatewayError::StreamBusy(_) => "StreamBusy",
            GatewayError::Unauthorized(_) => "Unauthorized",
            GatewayError::InvalidRequest(_) => "InvalidRequest",
            GatewayError::SystemFailure { .. } => "SystemFailure",
        }
    }

    /// Whether the failure should be surfaced to the operator log.
    pub fn is_system(&self) -> bool {
        matches!(self, GatewayError::SystemFailure { .. })
    }
}

/// Result type alias for this crate.
pub type Result<T> = std::result::Result<T, GatewayError>;
