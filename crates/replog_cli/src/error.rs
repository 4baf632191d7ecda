//! Error types for the CLI.

use replog_core::ChangelogError;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for CLI commands.
pub type CliResult<T> = Result<T, CliError>;

/// Errors reported by the CLI commands.
#[derive(Debug, Error)]
pub enum CliError {
    /// The directory does not hold a changelog.
    #[error("no changelog found at {}", .0.display())]
    NotAChangelog(PathBuf),

    /// Verification found problems.
    #[error("verification failed: {0} problem(s) found")]
    VerificationFailed(usize),

    /// Changelog error.
    #[error(transparent)]
    Changelog(#[from] ChangelogError),

    /// I/O error.
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        /// Path being accessed.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// JSON output error.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl CliError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
