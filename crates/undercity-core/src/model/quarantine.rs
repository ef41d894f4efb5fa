//! Quarantine bookkeeping for merges that fail verification and whose
//! `onFailure` policy is `quarantine` rather than `fail`.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::model::task::TaskId;

/// Persisted alongside `parallel-recovery.json` when a merge candidate is
/// quarantined instead of abandoned outright. Strictly additive
/// bookkeeping: the merge still reports `verification_failed` to its
/// caller either way.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QuarantineRecord {
    /// Identifier for this quarantine (derived from the candidate commit).
    pub merge_id: String,
    /// The task whose merge was quarantined.
    pub task_id: TaskId,
    /// The worker branch the candidate came from.
    pub branch: String,
    /// Path to the quarantine worktree.
    pub workspace_path: PathBuf,
    /// Why verification failed (the last verifier output, or fixer
    /// exhaustion message).
    pub reason: String,
    /// When the quarantine was created, milliseconds since the Unix epoch.
    pub created_at: i64,
}
