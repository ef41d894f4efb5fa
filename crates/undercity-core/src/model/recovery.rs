//! Crash-recovery state data types.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::model::task::TaskId;

/// Per-task status as tracked by the recovery state machine. A narrower
/// view than [`crate::model::task::TaskStatus`]: recovery only ever sees a
/// task reach `Pending` → `Running` → one of the three terminal states.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParallelTaskStatus {
    /// Not yet dispatched.
    #[default]
    Pending,
    /// Dispatched; workspace exists.
    Running,
    /// Worker succeeded; not yet merged.
    Complete,
    /// Worker failed, or merge failed permanently.
    Failed,
    /// Fast-forward merged into main.
    Merged,
}

impl ParallelTaskStatus {
    /// `true` for `Complete`, `Failed`, or `Merged` — the statuses that
    /// make `RecoveryState::is_complete` true when held by every task.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Merged)
    }
}

/// One task's state within a batch's recovery record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParallelTaskState {
    /// The task id.
    pub task_id: TaskId,
    /// The objective text, duplicated here so `Resume` can hand it back to
    /// the caller without re-reading the task board.
    pub objective: String,
    /// Absolute path to the task's workspace, once created.
    #[serde(default)]
    pub workspace_path: Option<PathBuf>,
    /// The workspace's branch name, once created.
    #[serde(default)]
    pub branch: Option<String>,
    /// Current status.
    pub status: ParallelTaskStatus,
    /// When the task started running, milliseconds since the Unix epoch.
    #[serde(default)]
    pub started_at: Option<i64>,
    /// When the task reached a terminal state, milliseconds since the
    /// Unix epoch.
    #[serde(default)]
    pub completed_at: Option<i64>,
    /// Error message, if `status == Failed`.
    #[serde(default)]
    pub error: Option<String>,
    /// Files the workspace modified, once known (from a diff against
    /// main).
    #[serde(default)]
    pub modified_files: Option<Vec<String>>,
}

impl ParallelTaskState {
    /// Construct a fresh `pending` state for `task_id`/`objective`.
    #[must_use]
    pub fn pending(task_id: TaskId, objective: impl Into<String>) -> Self {
        Self {
            task_id,
            objective: objective.into(),
            workspace_path: None,
            branch: None,
            status: ParallelTaskStatus::Pending,
            started_at: None,
            completed_at: None,
            error: None,
            modified_files: None,
        }
    }
}

/// Persisted recovery state for one batch (`parallel-recovery.json`).
///
/// Invariant: `is_complete ⇔` every task in `tasks` is terminal. Enforced
/// by [`crate::recovery::RecoveryStateMachine`], never hand-set by callers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RecoveryState {
    /// Unique id for this batch.
    pub batch_id: String,
    /// When the batch started, milliseconds since the Unix epoch.
    pub started_at: i64,
    /// The model requested for this batch (opaque to the core).
    #[serde(default)]
    pub model: Option<String>,
    /// Opaque caller-supplied options, round-tripped verbatim.
    #[serde(default)]
    pub options: serde_json::Value,
    /// Per-task state.
    pub tasks: Vec<ParallelTaskState>,
    /// Whether every task has reached a terminal state.
    pub is_complete: bool,
    /// Last time this record was persisted, milliseconds since the Unix
    /// epoch.
    pub last_updated: i64,
}

impl RecoveryState {
    /// Recompute and return whether every task is terminal, without
    /// mutating `self`.
    #[must_use]
    pub fn all_terminal(&self) -> bool {
        self.tasks.iter().all(|t| t.status.is_terminal())
    }
}
