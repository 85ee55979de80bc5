//! Error types for the git integration.

use crate::scan::ScanStage;
use gitbits_reduce::ReduceError;
use std::path::PathBuf;
use std::process::ExitStatus;
use thiserror::Error;

/// Result type alias for git operations.
pub type GitResult<T> = Result<T, GitError>;

/// Error variants for repository setup, git invocations and history scans.
#[derive(Debug, Error)]
pub enum GitError {
    /// The git executable could not be located.
    #[error("git executable '{name}' couldn't be found, make sure git is installed and in your PATH")]
    ExecutableNotFound {
        /// Name or path that was looked up.
        name: String,
    },

    /// The directory is not a git workspace.
    #[error("dir '{}' doesn't seem to be a git workspace: {source}", .dir.display())]
    NotAWorkspace {
        /// Directory that was opened.
        dir: PathBuf,
        /// Why the metadata directory could not be found.
        source: std::io::Error,
    },

    /// The local chunk directory could not be set up.
    #[error("couldn't set up chunk directory at '{}': {source}", .dir.display())]
    ChunkDirSetup {
        /// Chunk directory.
        dir: PathBuf,
        /// Underlying store error.
        source: ReduceError,
    },

    /// Configuration could not be loaded.
    #[error("failed to load config '{}': {reason}", .path.display())]
    Config {
        /// Config file path.
        path: PathBuf,
        /// Description of the problem.
        reason: String,
    },

    /// git could not be started.
    #[error("failed to run `git {command}`: {source}")]
    Spawn {
        /// Argument list, space separated.
        command: String,
        /// Spawn error.
        source: std::io::Error,
    },

    /// git exited unsuccessfully.
    #[error("failed to run `git {command}`: {status}")]
    CommandFailed {
        /// Argument list, space separated.
        command: String,
        /// Exit status.
        status: ExitStatus,
    },

    /// Streaming data into or out of git failed.
    #[error("failed to stream data for `git {command}`: {source}")]
    Pipe {
        /// Argument list, space separated.
        command: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A scan stage failed.
    #[error("scan stage '{stage}' failed: {source}")]
    Stage {
        /// Stage that failed.
        stage: ScanStage,
        /// What went wrong.
        source: Box<GitError>,
    },

    /// I/O outside of a git invocation.
    #[error("{context}: {source}")]
    Io {
        /// What was being done.
        context: &'static str,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The operation was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// The scan deadline passed.
    #[error("scan exceeded its deadline of {secs}s")]
    DeadlineExceeded {
        /// Deadline in seconds.
        secs: u64,
    },

    /// Chunking, store or framing error.
    #[error(transparent)]
    Reduce(#[from] ReduceError),
}

impl GitError {
    /// Stage that failed, for errors produced by a scan
    pub fn stage(&self) -> Option<ScanStage> {
        match self {
            GitError::Stage { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    /// True for cancellation, including cancellation wrapped by a stage
    pub fn is_cancelled(&self) -> bool {
        match self {
            GitError::Cancelled => true,
            GitError::Stage { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }
}
