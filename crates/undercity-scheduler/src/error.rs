//! Errors raised by [`crate::scheduler::Scheduler`] itself, distinct from
//! a task's own failure (which is reported inline in
//! [`crate::scheduler::BatchTaskOutcome`], not as an `Err`).

use thiserror::Error;
use undercity_core::RecoveryError;
use undercity_workspace::WorkspaceError;

/// Infrastructure failures in the scheduler's own bookkeeping.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Persisting or reading recovery state failed.
    #[error(transparent)]
    Recovery(#[from] RecoveryError),

    /// Provisioning or tearing down a workspace failed in a way that
    /// could not be recorded as a per-task failure (e.g. the initial
    /// recovery-state write itself).
    #[error(transparent)]
    Workspace(#[from] WorkspaceError),
}
