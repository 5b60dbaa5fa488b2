//! Error types for the pipeline core.
//!
//! Value-model operations only ever fail eagerly with [`Error::InvalidPath`]
//! or [`Error::InvalidId`]; everything else is deferred until a terminal
//! operation forces evaluation through the backend. Non-zero process exits
//! are *not* errors: they are data, reported through `exit_code`/`stdout`/
//! `stderr` on the executed container.

use std::path::PathBuf;

/// Result type alias for pipeline core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the pipeline core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Value-Model Errors (eager)
    // =========================================================================
    /// An opaque ID failed decoding or refers to an unknown artifact.
    #[error("invalid {kind} id: {reason}")]
    InvalidId { kind: &'static str, reason: String },

    /// A path is not absolute where required, empty, or escapes the rootfs.
    #[error("invalid path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },

    /// `with_exec` was called with an empty effective command.
    #[error("no command was set: neither arguments nor an entrypoint are present")]
    NoCommand,

    /// Incompatible simultaneous mounts at the same path.
    #[error("conflicting mounts at '{path}': {reason}")]
    MountConflict { path: String, reason: String },

    /// A read was attempted through a mount kind that cannot be read back.
    #[error("path '{path}' is under a {kind} mount and cannot be read")]
    MountNotReadable { path: String, kind: &'static str },

    /// `endpoint()` was called with no port and no exposed ports.
    #[error("no ports exposed by service container")]
    NoExposedPort,

    // =========================================================================
    // Backend-Surface Errors (deferred until force)
    // =========================================================================
    /// The backend could not launch a process.
    #[error("failed to start process '{command}': {reason}")]
    ExecStartFailed { command: String, reason: String },

    /// Image pull failed.
    #[error("failed to pull '{reference}': {reason}")]
    PullFailed { reference: String, reason: String },

    /// Dockerfile build failed.
    #[error("build failed: {0}")]
    BuildFailed(String),

    /// Image publication failed.
    #[error("failed to publish '{address}': {reason}")]
    PublishFailed { address: String, reason: String },

    /// OCI tarball export failed.
    #[error("failed to export to {path}: {reason}")]
    ExportFailed { path: PathBuf, reason: String },

    /// The backend rejected or failed a graph solve.
    #[error("solve failed for op {digest}: {reason}")]
    SolveFailed { digest: String, reason: String },

    /// Service start failed.
    #[error("failed to start service '{hostname}': {reason}")]
    ServiceStartFailed { hostname: String, reason: String },

    // =========================================================================
    // Cancellation
    // =========================================================================
    /// The caller's cancellation scope was triggered.
    #[error("operation cancelled")]
    Cancelled,

    // =========================================================================
    // Ambient Errors
    // =========================================================================
    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Internal error (should not happen).
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Shorthand for an [`Error::InvalidPath`].
    pub(crate) fn invalid_path(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::InvalidPath {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Shorthand for an [`Error::InvalidId`].
    pub(crate) fn invalid_id(kind: &'static str, reason: impl Into<String>) -> Self {
        Error::InvalidId {
            kind,
            reason: reason.into(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}
