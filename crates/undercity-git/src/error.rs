//! Errors raised by subprocess git invocations.

use thiserror::Error;

/// Errors a [`crate::GitBackend`] operation can raise.
#[derive(Debug, Error)]
pub enum GitError {
    /// `git` exited non-zero. Carries the literal argument array (never a
    /// shell-joined string — arguments are never shell-interpolated) and
    /// the tail of stderr, for an agent reader to act on directly.
    #[error("git {args:?} failed: {stderr}")]
    CommandFailed {
        /// The literal argument array passed to `git`.
        args: Vec<String>,
        /// The last lines of stderr.
        stderr: String,
    },

    /// A value destined for a git command argument (ref, path, task id)
    /// failed the restrictive character-class check applied before
    /// subprocess invocation.
    #[error("`{value}` is not a valid {kind} for a git command argument")]
    InvalidArgument {
        /// What the value was supposed to be (`ref`, `path`, `branch`, ...).
        kind: &'static str,
        /// The rejected value.
        value: String,
    },

    /// The `git` binary could not be spawned at all.
    #[error("failed to spawn git: {0}")]
    Spawn(#[source] std::io::Error),

    /// An I/O error occurred reading repository state directly (e.g.
    /// checking for `REBASE_HEAD`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
