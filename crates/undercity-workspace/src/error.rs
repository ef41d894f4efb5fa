//! Errors raised by [`crate::WorkspaceManager`].

use thiserror::Error;
use undercity_git::GitError;

/// Errors [`crate::WorkspaceManager`] operations can raise.
#[derive(Debug, Error)]
pub enum WorkspaceError {
    /// A workspace for this task id already exists.
    #[error("workspace for task `{task_id}` already exists at {path}")]
    WorkspaceBusy {
        /// The task id.
        task_id: String,
        /// The existing workspace path.
        path: String,
    },

    /// The main repository could not be used (missing, bare-mis-configured
    /// and unrepairable, or otherwise not a usable git repository).
    #[error("main repository at {path} is unavailable: {detail}")]
    RepoUnavailable {
        /// The main repository path.
        path: String,
        /// Human-readable detail.
        detail: String,
    },

    /// `Remove` was called with `force = false` on a workspace that still
    /// has uncommitted changes.
    #[error("workspace for task `{task_id}` has uncommitted changes; pass force=true to discard them")]
    DirtyWorkingTree {
        /// The task id.
        task_id: String,
    },

    /// No workspace is registered for this task id.
    #[error("no workspace registered for task `{task_id}`")]
    NotFound {
        /// The task id.
        task_id: String,
    },

    /// `task_id` contains characters outside the restricted set
    /// (letters, digits, `-`, `_`, `.`) and cannot safely become a path or
    /// branch name component.
    #[error("task id `{task_id}` contains characters unsafe for a path/branch name")]
    InvalidTaskId {
        /// The offending task id.
        task_id: String,
    },

    /// A git subprocess invocation failed while provisioning or tearing
    /// down a workspace.
    #[error(transparent)]
    Git(#[from] GitError),

    /// An I/O error occurred that was not raised through `undercity-git`
    /// (registry persistence, directory bookkeeping).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
