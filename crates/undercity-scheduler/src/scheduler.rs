//! `Scheduler` — runs a batch of tasks as isolated, concurrent workers,
//! then serially merges every successful candidate back into main.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::Value;
use tracing::{info, warn};
use undercity_core::config::OrchestratorConfig;
use undercity_core::error::validate_output_size;
use undercity_core::model::recovery::ParallelTaskStatus;
use undercity_core::model::task::TaskId;
use undercity_core::recovery::{PendingResume, RecoveryStateMachine, StaleWorkspaceCleaner, TaskStatusUpdate};
use undercity_core::{FileTracker, RateLimitController};
use undercity_git::GitBackend;
use undercity_merge::{ConflictResolver, MergeOutcome, MergePipeline, MergeTask, VerificationFixer, Verifier};
use undercity_workspace::{TaskTerminalCheck, WorkspaceManager};

use crate::error::SchedulerError;
use crate::traits::{AgentRunner, Decomposition, ResultHandler, RunStatus};
use crate::worker_pool::run_concurrent;

/// Outcome of one task within a batch, once both its worker and (if
/// applicable) its merge attempt have run to completion.
#[derive(Clone, Debug)]
pub struct BatchTaskOutcome {
    /// The task id.
    pub task_id: TaskId,
    /// Final recovery status (`complete` only if the worker succeeded but
    /// this run's merge step was never reached — in practice every
    /// successful worker ends at `merged` or `failed`).
    pub status: ParallelTaskStatus,
    /// Error detail, if `status == failed`.
    pub error: Option<String>,
    /// The merge pipeline's outcome, if a merge was attempted.
    pub merge_outcome: Option<MergeOutcome>,
}

/// Result of one `RunBatch` (or `RunSingle`, which is `RunBatch` with one
/// task) invocation.
#[derive(Clone, Debug)]
pub struct BatchResult {
    /// The batch id assigned to this run (empty if `paused`).
    pub batch_id: String,
    /// `true` if the batch was not dispatched at all because the rate
    /// limiter is currently paused.
    pub paused: bool,
    /// Per-task outcomes, in dispatch order. Empty if `paused`.
    pub outcomes: Vec<BatchTaskOutcome>,
}

struct DispatchedTask {
    task_id: TaskId,
    status: ParallelTaskStatus,
    error: Option<String>,
    workspace_path: Option<PathBuf>,
    branch: Option<String>,
    needs_decomposition: Option<Decomposition>,
    meta_task_result: Option<Value>,
}

/// Bridges [`RecoveryStateMachine::resume`] to [`WorkspaceManager`] without
/// either crate depending on the other.
struct WorkspaceCleanerAdapter<'a> {
    workspace_manager: &'a WorkspaceManager,
}

impl StaleWorkspaceCleaner for WorkspaceCleanerAdapter<'_> {
    fn read_checkpoint_then_remove(&self, path: &std::path::Path) -> Option<Value> {
        let assignment_path = path.join(undercity_core::model::workspace::TaskAssignment::FILE_NAME);
        let checkpoint = std::fs::read_to_string(&assignment_path)
            .ok()
            .and_then(|raw| serde_json::from_str::<Value>(&raw).ok())
            .and_then(|v| v.get("checkpoint").cloned());

        if let Some(task_id) = path.file_name().and_then(|n| n.to_str()) {
            if let Err(e) = self.workspace_manager.remove(task_id, true) {
                warn!(task_id, error = %e, "failed to remove stale workspace during resume");
            }
        }
        checkpoint
    }
}

/// Bridges [`WorkspaceManager::gc`] to a [`RecoveryStateMachine`] snapshot
/// without either crate depending on the other.
struct RecoveryTerminalAdapter<'a> {
    recovery: &'a RecoveryStateMachine,
}

impl TaskTerminalCheck for RecoveryTerminalAdapter<'_> {
    fn is_terminal(&self, task_id: &str) -> bool {
        self.recovery
            .snapshot()
            .tasks
            .iter()
            .find(|t| t.task_id.as_str() == task_id)
            .map_or(true, |t| t.status.is_terminal())
    }
}

/// Runs batches of tasks through isolated workspaces and the merge
/// pipeline, serializing rate-limit accounting and workspace bookkeeping
/// across however many tasks run concurrently within a sub-batch.
pub struct Scheduler {
    workspace_manager: WorkspaceManager,
    merge_pipeline: MergePipeline,
    file_tracker: FileTracker,
    rate_limiter: RateLimitController,
    max_concurrent: usize,
    max_output_bytes: usize,
    state_dir: PathBuf,
    main_branch: String,
    now_ms: fn() -> i64,
    batch_seq: AtomicU64,
}

impl Scheduler {
    /// Build a scheduler rooted at `main_repo_path`, persisting all state
    /// (recovery records, workspace registry, quarantine) under
    /// `state_dir`.
    ///
    /// # Errors
    /// Returns [`SchedulerError::Workspace`] if `main_repo_path` is not a
    /// usable git repository.
    pub fn new(
        main_repo_path: impl Into<PathBuf>,
        config: &OrchestratorConfig,
        state_dir: impl Into<PathBuf>,
        now_ms: fn() -> i64,
    ) -> Result<Self, SchedulerError> {
        let main_repo_path = main_repo_path.into();
        let state_dir = state_dir.into();
        let main_branch = config.repo.main_branch.clone();

        let workspace_manager = WorkspaceManager::new(&main_repo_path, main_branch.clone(), &state_dir, now_ms)?;
        let merge_pipeline = MergePipeline::new(
            &main_repo_path,
            main_branch.clone(),
            config.merge.clone(),
            config.validation.max_output_bytes,
            &state_dir,
            now_ms,
        );
        let file_tracker = FileTracker::new(&main_repo_path, now_ms);
        let rate_limiter = RateLimitController::new(config.rate_limit.clone(), now_ms);

        Ok(Self {
            workspace_manager,
            merge_pipeline,
            file_tracker,
            rate_limiter,
            max_concurrent: config.scheduler.max_concurrent.max(1),
            max_output_bytes: config.validation.max_output_bytes,
            state_dir,
            main_branch,
            now_ms,
            batch_seq: AtomicU64::new(0),
        })
    }

    fn next_batch_id(&self) -> String {
        let seq = self.batch_seq.fetch_add(1, Ordering::SeqCst);
        format!("batch-{}-{seq}", (self.now_ms)())
    }

    fn recovery_path(&self) -> PathBuf {
        self.state_dir.join("parallel-recovery.json")
    }

    /// Resume the most recently persisted, incomplete batch, if one
    /// exists — removing any stale `running` workspaces and handing their
    /// tasks back to the caller for re-dispatch.
    ///
    /// # Errors
    /// Returns [`SchedulerError::Recovery`] if the recovery record exists
    /// but is corrupted or cannot be re-persisted.
    pub fn resume_pending(&self) -> Result<Vec<PendingResume>, SchedulerError> {
        let Some(recovery) = RecoveryStateMachine::load(self.recovery_path(), self.now_ms)? else {
            return Ok(Vec::new());
        };
        let cleaner = WorkspaceCleanerAdapter {
            workspace_manager: &self.workspace_manager,
        };
        Ok(recovery.resume(&cleaner)?)
    }

    /// Abandon the most recently persisted, incomplete batch, if one
    /// exists, marking every non-terminal task `failed`.
    ///
    /// # Errors
    /// Returns [`SchedulerError::Recovery`] if the recovery record exists
    /// but cannot be loaded or re-persisted.
    pub fn abandon_pending(&self) -> Result<(), SchedulerError> {
        let Some(recovery) = RecoveryStateMachine::load(self.recovery_path(), self.now_ms)? else {
            return Ok(());
        };
        Ok(recovery.abandon()?)
    }

    /// Reclaim workspaces whose owning task has reached a terminal status
    /// in `recovery`'s snapshot (or has no entry in it at all).
    ///
    /// # Errors
    /// Returns [`SchedulerError::Workspace`] if the reclaim sweep itself
    /// fails; a failure to remove one particular stale workspace is
    /// logged and skipped rather than aborting the whole sweep.
    pub fn gc_workspaces(&self, recovery: &RecoveryStateMachine) -> Result<Vec<String>, SchedulerError> {
        let checker = RecoveryTerminalAdapter { recovery };
        Ok(self.workspace_manager.gc(&checker)?)
    }

    /// Run one task directly against the main repository's working tree
    /// — the `RunSingle` fast path (§4.3): no workspace is provisioned and
    /// the merge pipeline is never invoked, since there is no separate
    /// branch to integrate. A successful run is therefore already
    /// `merged`; nothing is dispatched if the rate limiter is paused.
    ///
    /// # Errors
    /// Returns [`SchedulerError::Recovery`] if recovery-state persistence
    /// fails; every runner-level failure is reported inline as a
    /// [`BatchTaskOutcome`], never as an `Err`.
    pub fn run_single(
        &self,
        task_id: impl Into<TaskId>,
        objective: impl Into<String>,
        model: Option<String>,
        options: Value,
        runner: &(dyn AgentRunner + Sync),
        result_handler: &dyn ResultHandler,
    ) -> Result<BatchResult, SchedulerError> {
        self.rate_limiter.check_auto_resume();
        if self.rate_limiter.is_paused() {
            info!("single-task dispatch skipped: rate limiter paused");
            return Ok(BatchResult {
                batch_id: String::new(),
                paused: true,
                outcomes: Vec::new(),
            });
        }

        let task_id = task_id.into();
        let objective = objective.into();
        let batch_id = self.next_batch_id();
        let recovery = RecoveryStateMachine::create_state(
            self.recovery_path(),
            batch_id.clone(),
            &[(task_id.clone(), objective.clone())],
            model,
            options.clone(),
            self.now_ms,
        )?;

        let started_at = (self.now_ms)();
        if let Err(e) = recovery.update_task_status(
            &task_id,
            TaskStatusUpdate {
                status: ParallelTaskStatus::Running,
                started_at: Some(started_at),
                ..TaskStatusUpdate::default()
            },
        ) {
            warn!(%task_id, error = %e, "failed to record running status");
        }

        let session_id = format!("single-{task_id}");
        self.file_tracker
            .start_tracking(task_id.as_str(), Some(task_id.clone()), &session_id);
        let result = runner.run(self.workspace_manager.main_repo_path(), &objective, &options);
        self.file_tracker.stop_tracking(task_id.as_str());

        for attempt in &result.token_usage.attempts {
            self.rate_limiter.record_task(
                task_id.clone(),
                attempt.model.clone(),
                attempt.input_tokens,
                attempt.output_tokens,
                attempt.duration_ms,
            );
        }

        if let Some(decomposition) = &result.needs_decomposition {
            result_handler.handle_needs_decomposition(&task_id, decomposition);
        }
        if let Some(meta) = &result.meta_task_result {
            result_handler.handle_meta_task_result(&task_id, meta);
        }

        let is_failure = result.status == RunStatus::Failed || result.needs_decomposition.is_some();
        let (status, error) = if is_failure {
            let error = result.error.clone().or_else(|| {
                result
                    .needs_decomposition
                    .as_ref()
                    .map(|d| format!("needs decomposition: {}", d.reason))
            });
            (ParallelTaskStatus::Failed, error)
        } else {
            (ParallelTaskStatus::Merged, None)
        };

        if let Err(e) = recovery.update_task_status(
            &task_id,
            TaskStatusUpdate {
                status,
                error: error.clone(),
                completed_at: Some((self.now_ms)()),
                ..TaskStatusUpdate::default()
            },
        ) {
            warn!(%task_id, error = %e, "failed to record task completion");
        }

        Ok(BatchResult {
            batch_id,
            paused: false,
            outcomes: vec![BatchTaskOutcome {
                task_id,
                status,
                error,
                merge_outcome: None,
            }],
        })
    }

    /// Run `tasks` concurrently (bounded by `maxConcurrent` per
    /// sub-batch), then drain every successfully completed task through
    /// the merge pipeline in dispatch order.
    ///
    /// Returns immediately with `paused = true` and no outcomes if the
    /// rate limiter is currently paused — an empty `tasks` slice likewise
    /// yields an immediately-complete batch with no outcomes.
    ///
    /// # Errors
    /// Returns [`SchedulerError`] only for failures in the scheduler's own
    /// bookkeeping (recovery-state persistence); every per-task failure is
    /// reported inline as a [`BatchTaskOutcome`], never as an `Err`.
    pub fn run_batch(
        &self,
        tasks: &[(TaskId, String)],
        model: Option<String>,
        options: Value,
        runner: &(dyn AgentRunner + Sync),
        resolver: &dyn ConflictResolver,
        verifier: &dyn Verifier,
        fixer: &dyn VerificationFixer,
        result_handler: &dyn ResultHandler,
    ) -> Result<BatchResult, SchedulerError> {
        self.rate_limiter.check_auto_resume();
        if self.rate_limiter.is_paused() {
            info!("batch dispatch skipped: rate limiter paused");
            return Ok(BatchResult {
                batch_id: String::new(),
                paused: true,
                outcomes: Vec::new(),
            });
        }

        let batch_id = self.next_batch_id();
        let recovery = RecoveryStateMachine::create_state(
            self.recovery_path(),
            batch_id.clone(),
            tasks,
            model,
            options.clone(),
            self.now_ms,
        )?;

        let mut dispatched: Vec<DispatchedTask> = Vec::with_capacity(tasks.len());
        for chunk in tasks.chunks(self.max_concurrent) {
            self.rate_limiter.check_auto_resume();
            if self.rate_limiter.is_paused() {
                info!(
                    batch_id,
                    dispatched = dispatched.len(),
                    remaining = tasks.len() - dispatched.len(),
                    "rate limiter paused mid-batch; remaining tasks left pending"
                );
                break;
            }
            let chunk_vec: Vec<(TaskId, String)> = chunk.to_vec();
            let options = &options;
            let results = run_concurrent(chunk_vec, |(task_id, objective)| {
                self.dispatch_task(&recovery, runner, &task_id, &objective, options)
            });
            dispatched.extend(results);
        }

        let mut outcomes = Vec::with_capacity(dispatched.len());
        for task in dispatched {
            if let Some(decomposition) = &task.needs_decomposition {
                result_handler.handle_needs_decomposition(&task.task_id, decomposition);
            }
            if let Some(result) = &task.meta_task_result {
                result_handler.handle_meta_task_result(&task.task_id, result);
            }

            let merge_outcome = if task.status == ParallelTaskStatus::Complete {
                self.try_merge(&recovery, &task, resolver, verifier, fixer)
            } else {
                None
            };

            if task.workspace_path.is_some() {
                if merge_outcome.as_ref().is_some_and(preserve_workspace_for_inspection) {
                    if let Err(e) = self.workspace_manager.detach(task.task_id.as_str()) {
                        warn!(task_id = %task.task_id, error = %e, "failed to detach preserved workspace");
                    }
                } else if let Err(e) = self.workspace_manager.remove(task.task_id.as_str(), true) {
                    warn!(task_id = %task.task_id, error = %e, "failed to remove workspace after task completion");
                }
            }

            let (final_status, final_error) = match &merge_outcome {
                Some(outcome) => merge_outcome_status(outcome),
                None => (task.status, task.error),
            };

            outcomes.push(BatchTaskOutcome {
                task_id: task.task_id,
                status: final_status,
                error: final_error,
                merge_outcome,
            });
        }

        info!(batch_id, tasks = outcomes.len(), "batch complete");
        Ok(BatchResult {
            batch_id,
            paused: false,
            outcomes,
        })
    }

    fn dispatch_task(
        &self,
        recovery: &RecoveryStateMachine,
        runner: &(dyn AgentRunner + Sync),
        task_id: &TaskId,
        objective: &str,
        options: &Value,
    ) -> DispatchedTask {
        let started_at = (self.now_ms)();

        let workspace = match self.workspace_manager.create(task_id.as_str()) {
            Ok(ws) => ws,
            Err(e) => {
                warn!(%task_id, error = %e, "workspace creation failed");
                let _ = recovery.update_task_status(
                    task_id,
                    TaskStatusUpdate {
                        status: ParallelTaskStatus::Failed,
                        error: Some(e.to_string()),
                        started_at: Some(started_at),
                        completed_at: Some((self.now_ms)()),
                        ..TaskStatusUpdate::default()
                    },
                );
                return DispatchedTask {
                    task_id: task_id.clone(),
                    status: ParallelTaskStatus::Failed,
                    error: Some(e.to_string()),
                    workspace_path: None,
                    branch: None,
                    needs_decomposition: None,
                    meta_task_result: None,
                };
            }
        };

        if let Err(e) = recovery.record_workspace(task_id, workspace.path.clone(), workspace.branch.clone()) {
            warn!(%task_id, error = %e, "failed to record workspace in recovery state");
        }
        if let Err(e) = recovery.update_task_status(
            task_id,
            TaskStatusUpdate {
                status: ParallelTaskStatus::Running,
                started_at: Some(started_at),
                ..TaskStatusUpdate::default()
            },
        ) {
            warn!(%task_id, error = %e, "failed to record running status");
        }

        let session_id = format!("batch-{task_id}");
        self.file_tracker
            .start_tracking(task_id.as_str(), Some(task_id.clone()), &session_id);
        let result = runner.run(&workspace.path, objective, options);
        self.file_tracker.stop_tracking(task_id.as_str());

        for attempt in &result.token_usage.attempts {
            self.rate_limiter.record_task(
                task_id.clone(),
                attempt.model.clone(),
                attempt.input_tokens,
                attempt.output_tokens,
                attempt.duration_ms,
            );
        }

        let modified_files = GitBackend::at(&workspace.path)
            .diff_name_only(&self.main_branch, "HEAD")
            .ok()
            .filter(|files| !files.is_empty())
            .and_then(|files| match validate_output_size(&files.join("\n"), self.max_output_bytes) {
                Ok(()) => Some(files),
                Err(e) => {
                    warn!(%task_id, error = %e, "modified-files diff exceeded the output-size limit, discarding");
                    None
                }
            })
            .or_else(|| result.modified_files_hint.clone());

        let is_failure = result.status == RunStatus::Failed || result.needs_decomposition.is_some();
        let status = if is_failure {
            ParallelTaskStatus::Failed
        } else {
            ParallelTaskStatus::Complete
        };
        let error = if is_failure {
            result.error.clone().or_else(|| {
                result
                    .needs_decomposition
                    .as_ref()
                    .map(|d| format!("needs decomposition: {}", d.reason))
            })
        } else {
            None
        };

        let completed_at = (self.now_ms)();
        if let Err(e) = recovery.update_task_status(
            task_id,
            TaskStatusUpdate {
                status,
                error: error.clone(),
                modified_files: modified_files.clone(),
                completed_at: Some(completed_at),
                ..TaskStatusUpdate::default()
            },
        ) {
            warn!(%task_id, error = %e, "failed to record task completion");
        }

        DispatchedTask {
            task_id: task_id.clone(),
            status,
            error,
            workspace_path: Some(workspace.path),
            branch: Some(workspace.branch),
            needs_decomposition: result.needs_decomposition,
            meta_task_result: result.meta_task_result,
        }
    }

    fn try_merge(
        &self,
        recovery: &RecoveryStateMachine,
        task: &DispatchedTask,
        resolver: &dyn ConflictResolver,
        verifier: &dyn Verifier,
        fixer: &dyn VerificationFixer,
    ) -> Option<MergeOutcome> {
        let (workspace_path, branch) = match (&task.workspace_path, &task.branch) {
            (Some(p), Some(b)) => (p.clone(), b.clone()),
            _ => return None,
        };

        let merge_task = MergeTask {
            task_id: task.task_id.clone(),
            workspace_path,
            branch,
        };

        let outcome = match self.merge_pipeline.merge(&merge_task, resolver, verifier, fixer) {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(task_id = %task.task_id, error = %e, "merge pipeline bookkeeping failed");
                MergeOutcome::Fatal {
                    message: e.to_string(),
                }
            }
        };

        let (status, error) = merge_outcome_status(&outcome);
        if let Err(e) = recovery.update_task_status(
            &task.task_id,
            TaskStatusUpdate {
                status,
                error,
                completed_at: Some((self.now_ms)()),
                ..TaskStatusUpdate::default()
            },
        ) {
            warn!(task_id = %task.task_id, error = %e, "failed to record merge outcome");
        }

        Some(outcome)
    }
}

/// Whether a failed merge candidate's workspace/branch should be left on
/// disk for manual inspection rather than force-removed.
///
/// An unresolved rebase conflict always preserves the branch. A
/// verification failure preserves it only when it was not already copied
/// into a separate quarantine worktree (`on_failure = quarantine`).
fn preserve_workspace_for_inspection(outcome: &MergeOutcome) -> bool {
    matches!(
        outcome,
        MergeOutcome::ConflictUnresolved | MergeOutcome::VerificationFailed { quarantined: false }
    )
}

/// Map a merge outcome to the recovery status and error text it implies.
fn merge_outcome_status(outcome: &MergeOutcome) -> (ParallelTaskStatus, Option<String>) {
    match outcome {
        MergeOutcome::Merged { .. } => (ParallelTaskStatus::Merged, None),
        MergeOutcome::ConflictUnresolved => (
            ParallelTaskStatus::Failed,
            Some("merge conflict could not be resolved".to_owned()),
        ),
        MergeOutcome::VerificationFailed { quarantined } => (
            ParallelTaskStatus::Failed,
            Some(if *quarantined {
                "verification failed; candidate quarantined".to_owned()
            } else {
                "verification failed".to_owned()
            }),
        ),
        MergeOutcome::Fatal { message } => (ParallelTaskStatus::Failed, Some(message.clone())),
    }
}
