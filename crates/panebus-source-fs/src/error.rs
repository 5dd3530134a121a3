//! Error types for root registration and routing.

use std::path::PathBuf;
use thiserror::Error;

use panebus_core::WorktreeId;

#[derive(Debug, Error)]
pub enum FsSourceError {
    #[error("failed to canonicalize {path}: {source}")]
    Canonicalize {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("root path {0} is not a directory")]
    NotADirectory(PathBuf),

    #[error("worktree {0} is already registered")]
    DuplicateWorktree(WorktreeId),

    #[error("root {path} is already registered as worktree {existing}")]
    DuplicatePath { path: PathBuf, existing: WorktreeId },

    #[error("worktree {0} is not registered")]
    NotRegistered(WorktreeId),
}
