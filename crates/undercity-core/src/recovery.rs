//! `RecoveryStateMachine` — persists every scheduler state transition so a
//! crash during a batch leaves enough information to resume or abandon
//! cleanly.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde_json::Value;
use tracing::{info, warn};

use crate::atomic::{read_json_opt, write_json_atomic};
use crate::error::RecoveryError;
use crate::model::recovery::{ParallelTaskState, ParallelTaskStatus, RecoveryState};
use crate::model::task::TaskId;

/// A patch to one task's recovery record.
#[derive(Clone, Debug, Default)]
pub struct TaskStatusUpdate {
    /// New status.
    pub status: ParallelTaskStatus,
    /// Error message, if transitioning to `Failed`.
    pub error: Option<String>,
    /// Files the workspace modified, once known.
    pub modified_files: Option<Vec<String>>,
    /// When the task started running.
    pub started_at: Option<i64>,
    /// When the task reached a terminal state.
    pub completed_at: Option<i64>,
}

/// A task surfaced by [`RecoveryStateMachine::resume`], with its stale
/// checkpoint if one was found before the workspace was removed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingResume {
    /// The task id.
    pub task_id: TaskId,
    /// The objective text to re-dispatch.
    pub objective: String,
    /// The checkpoint found in the task's now-removed workspace, if any.
    pub stale_checkpoint: Option<Value>,
}

/// A snapshot summary of recovery state, safe to hand to callers that
/// should not mutate it directly.
#[derive(Clone, Debug, PartialEq)]
pub struct RecoverySummary {
    /// The batch id.
    pub batch_id: String,
    /// Whether the batch is fully terminal.
    pub is_complete: bool,
    /// Count of tasks in each status.
    pub pending: usize,
    /// ditto
    pub running: usize,
    /// ditto
    pub complete: usize,
    /// ditto
    pub failed: usize,
    /// ditto
    pub merged: usize,
}

/// Callback the state machine uses to remove a stale workspace during
/// `Resume`, and to read a stale checkpoint before removing it. Kept
/// abstract so `undercity-core` does not depend on `undercity-workspace`.
pub trait StaleWorkspaceCleaner {
    /// Read the checkpoint (if any) persisted inside the workspace at
    /// `path`, then remove the workspace unconditionally. Errors are
    /// logged by the caller, never propagated — a crashed workspace is
    /// stale by definition.
    fn read_checkpoint_then_remove(&self, path: &Path) -> Option<Value>;
}

/// Owns the single [`RecoveryState`] for the process, serializing every
/// mutation behind one lock and persisting after each write.
pub struct RecoveryStateMachine {
    path: PathBuf,
    state: Mutex<RecoveryState>,
    now_ms: fn() -> i64,
}

impl RecoveryStateMachine {
    /// Create a brand-new recovery record for `batch_id` with every task
    /// `pending`, and persist it immediately.
    ///
    /// # Errors
    /// Returns [`RecoveryError::Io`] if the initial write fails.
    ///
    /// # Panics
    /// Panics if the internal mutex is poisoned.
    pub fn create_state(
        path: impl Into<PathBuf>,
        batch_id: impl Into<String>,
        tasks: &[(TaskId, String)],
        model: Option<String>,
        options: Value,
        now_ms: fn() -> i64,
    ) -> Result<Self, RecoveryError> {
        let now = now_ms();
        let state = RecoveryState {
            batch_id: batch_id.into(),
            started_at: now,
            model,
            options,
            tasks: tasks
                .iter()
                .map(|(id, objective)| ParallelTaskState::pending(id.clone(), objective.clone()))
                .collect(),
            is_complete: tasks.is_empty(),
            last_updated: now,
        };
        let path = path.into();
        write_json_atomic(&path, &state)?;
        Ok(Self {
            path,
            state: Mutex::new(state),
            now_ms,
        })
    }

    /// Load a previously persisted recovery record from `path`, if one
    /// exists.
    ///
    /// # Errors
    /// Returns [`RecoveryError::Corrupted`] if the file exists but cannot
    /// be parsed.
    pub fn load(path: impl Into<PathBuf>, now_ms: fn() -> i64) -> Result<Option<Self>, RecoveryError> {
        let path = path.into();
        match read_json_opt::<RecoveryState>(&path) {
            Ok(Some(state)) => Ok(Some(Self {
                path,
                state: Mutex::new(state),
                now_ms,
            })),
            Ok(None) => Ok(None),
            Err(e) => Err(RecoveryError::Corrupted {
                path,
                detail: e.to_string(),
            }),
        }
    }

    /// Patch one task's recorded state and recompute `is_complete`.
    /// Persists the full state after applying the patch.
    ///
    /// # Errors
    /// Returns [`RecoveryError::UnknownTask`] if `task_id` is not part of
    /// this batch, or [`RecoveryError::Io`] if persistence fails.
    ///
    /// # Panics
    /// Panics if the internal mutex is poisoned.
    pub fn update_task_status(
        &self,
        task_id: &TaskId,
        update: TaskStatusUpdate,
    ) -> Result<(), RecoveryError> {
        let mut state = self.state.lock().unwrap();
        let batch_id = state.batch_id.clone();
        let task = state
            .tasks
            .iter_mut()
            .find(|t| &t.task_id == task_id)
            .ok_or_else(|| RecoveryError::UnknownTask {
                batch_id: batch_id.clone(),
                task_id: task_id.to_string(),
            })?;

        task.status = update.status;
        if update.error.is_some() {
            task.error = update.error;
        }
        if update.modified_files.is_some() {
            task.modified_files = update.modified_files;
        }
        if update.started_at.is_some() {
            task.started_at = update.started_at;
        }
        if update.completed_at.is_some() {
            task.completed_at = update.completed_at;
        }

        state.is_complete = state.all_terminal();
        state.last_updated = (self.now_ms)();
        write_json_atomic(&self.path, &*state)?;
        Ok(())
    }

    /// Persist workspace identity (`path`/`branch`) for a task once its
    /// workspace is created. Separate from [`Self::update_task_status`]
    /// because it can happen before the status transitions to `running`.
    ///
    /// # Errors
    /// Returns [`RecoveryError::UnknownTask`] or [`RecoveryError::Io`].
    ///
    /// # Panics
    /// Panics if the internal mutex is poisoned.
    pub fn record_workspace(
        &self,
        task_id: &TaskId,
        workspace_path: PathBuf,
        branch: String,
    ) -> Result<(), RecoveryError> {
        let mut state = self.state.lock().unwrap();
        let batch_id = state.batch_id.clone();
        let task = state
            .tasks
            .iter_mut()
            .find(|t| &t.task_id == task_id)
            .ok_or(RecoveryError::UnknownTask {
                batch_id,
                task_id: task_id.to_string(),
            })?;
        task.workspace_path = Some(workspace_path);
        task.branch = Some(branch);
        state.last_updated = (self.now_ms)();
        write_json_atomic(&self.path, &*state)?;
        Ok(())
    }

    /// Whether a batch is in progress and not yet complete.
    ///
    /// # Panics
    /// Panics if the internal mutex is poisoned.
    #[must_use]
    pub fn has_active(&self) -> bool {
        !self.state.lock().unwrap().is_complete
    }

    /// Summarize current state.
    ///
    /// # Panics
    /// Panics if the internal mutex is poisoned.
    #[must_use]
    pub fn info(&self) -> RecoverySummary {
        let state = self.state.lock().unwrap();
        let mut summary = RecoverySummary {
            batch_id: state.batch_id.clone(),
            is_complete: state.is_complete,
            pending: 0,
            running: 0,
            complete: 0,
            failed: 0,
            merged: 0,
        };
        for task in &state.tasks {
            match task.status {
                ParallelTaskStatus::Pending => summary.pending += 1,
                ParallelTaskStatus::Running => summary.running += 1,
                ParallelTaskStatus::Complete => summary.complete += 1,
                ParallelTaskStatus::Failed => summary.failed += 1,
                ParallelTaskStatus::Merged => summary.merged += 1,
            }
        }
        summary
    }

    /// Resume protocol (§4.7): for each `running` task with a workspace
    /// path, read its stale checkpoint (if any) via `cleaner`, then
    /// unconditionally remove the workspace. Tasks still `pending` or
    /// `running` after cleanup become the returned list; terminal tasks
    /// are left untouched for auditability until the batch completes.
    ///
    /// Resuming a batch that is already `is_complete` is a no-op and
    /// returns an empty list.
    ///
    /// # Errors
    /// Returns [`RecoveryError::Io`] if persisting the updated state fails.
    ///
    /// # Panics
    /// Panics if the internal mutex is poisoned.
    pub fn resume(
        &self,
        cleaner: &dyn StaleWorkspaceCleaner,
    ) -> Result<Vec<PendingResume>, RecoveryError> {
        let mut state = self.state.lock().unwrap();
        if state.is_complete {
            return Ok(Vec::new());
        }

        let mut pending = Vec::new();
        for task in &mut state.tasks {
            if task.status == ParallelTaskStatus::Running {
                let stale_checkpoint = task
                    .workspace_path
                    .as_ref()
                    .and_then(|p| cleaner.read_checkpoint_then_remove(p));
                pending.push(PendingResume {
                    task_id: task.task_id.clone(),
                    objective: task.objective.clone(),
                    stale_checkpoint,
                });
                // The workspace is gone; the task goes back to pending so
                // it can be redispatched on retry.
                task.status = ParallelTaskStatus::Pending;
                task.workspace_path = None;
                task.branch = None;
            } else if task.status == ParallelTaskStatus::Pending {
                pending.push(PendingResume {
                    task_id: task.task_id.clone(),
                    objective: task.objective.clone(),
                    stale_checkpoint: None,
                });
            }
        }

        state.last_updated = (self.now_ms)();
        write_json_atomic(&self.path, &*state)?;
        info!(batch_id = %state.batch_id, resumed = pending.len(), "recovery resumed");
        Ok(pending)
    }

    /// Abandon this batch: mark every non-terminal task `failed` with an
    /// explanatory error, without attempting cleanup (cleanup is the
    /// caller's responsibility once it decides not to resume).
    ///
    /// # Errors
    /// Returns [`RecoveryError::Io`] if persisting fails.
    ///
    /// # Panics
    /// Panics if the internal mutex is poisoned.
    pub fn abandon(&self) -> Result<(), RecoveryError> {
        let mut state = self.state.lock().unwrap();
        for task in &mut state.tasks {
            if !task.status.is_terminal() {
                warn!(task_id = %task.task_id, "abandoning task");
                task.status = ParallelTaskStatus::Failed;
                task.error = Some("batch abandoned".to_owned());
                task.completed_at = Some((self.now_ms)());
            }
        }
        state.is_complete = true;
        state.last_updated = (self.now_ms)();
        write_json_atomic(&self.path, &*state)?;
        Ok(())
    }

    /// Snapshot full state for inspection.
    ///
    /// # Panics
    /// Panics if the internal mutex is poisoned.
    #[must_use]
    pub fn snapshot(&self) -> RecoveryState {
        self.state.lock().unwrap().clone()
    }
}
