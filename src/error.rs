//! Error types for the publishing service.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while publishing a release into the package
/// repositories.
#[derive(Error, Debug)]
pub enum RepoError {
    /// A package filename does not match the repository format it was
    /// handed to.
    #[error("all packages must end with '{expected}': {files:?}")]
    FormatMismatch {
        /// Filename suffix the repository expects.
        expected: String,
        /// Offending filenames.
        files: Vec<String>,
    },

    /// The configured repository root directory does not exist.
    #[error("repository root {0} must be an existing directory")]
    MissingRoot(PathBuf),

    /// A path that must be a directory exists but is not one.
    #[error("the file {0} must be a directory")]
    NotADirectory(PathBuf),

    /// A version tag did not match the expected grammar.
    #[error("version tag '{0}' does not match v11.2.3.44-{{lts,prestable,stable,testing}}")]
    InvalidTag(String),

    /// An external command exited non-zero.
    #[error("command '{command}' failed:\n{output}")]
    ExternalTool {
        /// The command line that was run.
        command: String,
        /// Combined stdout/stderr captured from the command.
        output: String,
    },

    /// Copy/archive/rename failure during the snapshot commit or rollback
    /// sequence.
    #[error("transaction failure: {0}")]
    TransactionIo(String),

    /// Artifact download failed after all retries.
    #[error("download failed: {0}")]
    Download(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Release lookup or publication failed.
    #[error("release error: {0}")]
    Release(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for repository operations.
pub type RepoResult<T> = Result<T, RepoError>;
