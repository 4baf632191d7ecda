//! Error types for the changelog core.

use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Result type for changelog operations.
pub type ChangelogResult<T> = Result<T, ChangelogError>;

/// Errors that can occur in changelog operations.
///
/// Appending a record whose key does not increase and operating on a closed
/// log are deliberately *not* represented here: both are silent no-ops.
#[derive(Debug, Error)]
pub enum ChangelogError {
    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] replog_storage::StorageError),

    /// File-system error with the path and operation that failed.
    #[error("I/O error while trying to {context}: {source}")]
    Io {
        /// Operation and path that failed.
        context: String,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// A record could not be decoded.
    #[error("unable to decode record: {message}")]
    Decoding {
        /// Description of the problem.
        message: String,
    },

    /// One or more files could not be deleted; all deletions were attempted.
    #[error("unable to delete log files while trying to {operation}: {}", display_paths(.paths))]
    UndeletableFiles {
        /// Operation being performed (purge, clear).
        operation: &'static str,
        /// The files left behind.
        paths: Vec<PathBuf>,
    },

    /// The cursor was aborted because the file it was reading was purged.
    #[error("cursor on log {} has been aborted after a purge", .path.display())]
    CursorAborted {
        /// Path of the log the cursor was opened on.
        path: PathBuf,
    },

    /// A state file or a file name does not have the expected format.
    #[error("invalid format: {message}")]
    InvalidFormat {
        /// Description of the format issue.
        message: String,
    },

    /// Operation not permitted in current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why operation is invalid.
        message: String,
    },

    /// Another process holds the changelog directory.
    #[error("changelog directory {} is locked by another process", .path.display())]
    EnvironmentLocked {
        /// Root directory of the changelog.
        path: PathBuf,
    },

    /// The replication environment has been shut down.
    #[error("replication environment is shut down")]
    Shutdown,
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

impl ChangelogError {
    /// Creates an I/O error carrying the operation and path.
    pub fn io(operation: &str, path: &Path, source: io::Error) -> Self {
        Self::Io {
            context: format!("{operation} {}", path.display()),
            source,
        }
    }

    /// Creates a decoding error.
    pub fn decoding(message: impl Into<String>) -> Self {
        Self::Decoding {
            message: message.into(),
        }
    }

    /// Creates an invalid format error.
    pub fn invalid_format(message: impl Into<String>) -> Self {
        Self::InvalidFormat {
            message: message.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Returns true for a decoding failure.
    #[must_use]
    pub fn is_decoding(&self) -> bool {
        matches!(self, Self::Decoding { .. })
    }
}
