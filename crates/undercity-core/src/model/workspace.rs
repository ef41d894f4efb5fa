//! Workspace and per-workspace `TaskAssignment` data types.
//!
//! The behavior that creates/destroys workspaces lives in
//! `undercity-workspace`; this module only holds the shapes both that crate
//! and the health monitor / recovery state machine need to agree on.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::model::task::TaskId;

/// An isolated checkout of the repository at a distinct path, tied to a
/// distinct branch.
///
/// Invariant: at most one active workspace exists per `task_id`, and
/// `path` is never shared between workspaces.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workspace {
    /// The task this workspace was created for.
    pub task_id: TaskId,
    /// Absolute path to the isolated working copy.
    pub path: PathBuf,
    /// Name of the short-lived branch backing this workspace.
    pub branch: String,
    /// Creation timestamp, milliseconds since the Unix epoch.
    pub created_at: i64,
    /// Whether the workspace is still considered live (not yet removed).
    pub is_active: bool,
}

/// Phase of a single worker's progress, as self-reported into its
/// `TaskAssignment` checkpoint. Used exclusively for health monitoring and
/// recovery — the scheduler does not gate on it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointPhase {
    /// Workspace created, worker not yet started.
    Prepared,
    /// Worker is actively making changes.
    Running,
    /// Worker is running post-change verification.
    Verifying,
    /// Worker is running a self-review pass.
    Reviewing,
    /// Worker is finalizing its commit.
    Committing,
    /// Worker finished successfully.
    Complete,
    /// Worker finished with an error.
    Failed,
}

/// A worker-reported progress marker, used by the health monitor to detect
/// inactivity.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Current phase.
    pub phase: CheckpointPhase,
    /// When this checkpoint was written, milliseconds since the Unix epoch.
    pub saved_at: i64,
    /// Opaque, worker-defined payload (e.g. a progress message).
    #[serde(default)]
    pub data: serde_json::Value,
}

/// Persisted inside each workspace at a well-known relative path
/// (`.undercity-assignment.json`). Readable by both the worker and the
/// health monitor.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskAssignment {
    /// The task this assignment covers.
    pub task_id: TaskId,
    /// When the worker started, milliseconds since the Unix epoch.
    pub started_at: i64,
    /// Human-readable name of the worker/agent running this task.
    pub worker_name: String,
    /// The worker's last self-reported checkpoint, if any.
    #[serde(default)]
    pub checkpoint: Option<Checkpoint>,
}

impl TaskAssignment {
    /// Well-known file name for a `TaskAssignment`, relative to a
    /// workspace's root.
    pub const FILE_NAME: &'static str = ".undercity-assignment.json";

    /// Construct a fresh assignment with no checkpoint yet.
    #[must_use]
    pub fn new(task_id: TaskId, started_at: i64, worker_name: impl Into<String>) -> Self {
        Self {
            task_id,
            started_at,
            worker_name: worker_name.into(),
            checkpoint: None,
        }
    }
}
