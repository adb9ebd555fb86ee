//! Error types for the acquire engine.
//!
//! Per-item failures never travel through these types: they become item
//! state (`ItemStatus` plus `error_text`) and are collected into the run
//! summary. `AcquireError` covers what the engine itself cannot recover from
//! and the parse errors of the metadata readers.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::config::ConfigError;
use crate::message::MessageError;
use crate::pdiff::{DiffIndexError, PatchError};
use crate::release::ReleaseError;
use crate::tagfile::TagFileError;

/// Result type for acquire operations.
pub type AcquireResult<T> = Result<T, AcquireError>;

/// Errors that can occur while driving the acquire engine.
#[derive(Debug, Error)]
pub enum AcquireError {
    /// Failed to read a file.
    #[error("failed to read {}: {source}", path.display())]
    ReadFailed { path: PathBuf, source: io::Error },

    /// Failed to write a file.
    #[error("failed to write {}: {source}", path.display())]
    WriteFailed { path: PathBuf, source: io::Error },

    /// Failed to create a directory.
    #[error("failed to create directory {}: {source}", path.display())]
    CreateDirFailed { path: PathBuf, source: io::Error },

    /// Failed to rename a file into place.
    #[error("rename failed, {source} ({} -> {})", from.display(), to.display())]
    RenameFailed {
        from: PathBuf,
        to: PathBuf,
        source: io::Error,
    },

    /// The URI could not be parsed.
    #[error("invalid URI: {0}")]
    InvalidUri(String),

    /// No transport is known for a URI scheme.
    #[error("unable to locate a method for {0}")]
    NoTransport(String),

    /// A transport worker could not be started.
    #[error("failed to start method {access}: {reason}")]
    WorkerSpawn { access: String, reason: String },

    /// A transport worker broke the message protocol.
    #[error("method {access} protocol error: {reason}")]
    Protocol { access: String, reason: String },

    /// Every sender of the worker event channel went away.
    #[error("worker event channel closed")]
    EventChannelClosed,

    /// The signature helper could not be run or rejected its input.
    #[error("gpgv: {0}")]
    Gpgv(String),

    /// A clear-signed file could not be split.
    #[error("splitting clear-signed file {} failed: {reason}", path.display())]
    ClearSign { path: PathBuf, reason: String },

    #[error(transparent)]
    TagFile(#[from] TagFileError),

    #[error(transparent)]
    Message(#[from] MessageError),

    #[error(transparent)]
    Release(#[from] ReleaseError),

    #[error(transparent)]
    DiffIndex(#[from] DiffIndexError),

    #[error(transparent)]
    Patch(#[from] PatchError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl AcquireError {
    /// Shorthand for a read failure on `path`.
    pub fn read(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::ReadFailed {
            path: path.into(),
            source,
        }
    }

    /// Shorthand for a write failure on `path`.
    pub fn write(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::WriteFailed {
            path: path.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_read_failed() {
        let err = AcquireError::read(
            "/var/lib/apt/lists/foo",
            io::Error::new(io::ErrorKind::NotFound, "not found"),
        );
        let msg = err.to_string();
        assert!(msg.contains("/var/lib/apt/lists/foo"));
        assert!(msg.contains("not found"));
    }

    #[test]
    fn test_error_display_rename_failed() {
        let err = AcquireError::RenameFailed {
            from: PathBuf::from("/a/partial/x"),
            to: PathBuf::from("/a/x"),
            source: io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        };
        assert_eq!(err.to_string(), "rename failed, denied (/a/partial/x -> /a/x)");
    }

    #[test]
    fn test_error_display_no_transport() {
        let err = AcquireError::NoTransport("ftp".to_string());
        assert_eq!(err.to_string(), "unable to locate a method for ftp");
    }
}
