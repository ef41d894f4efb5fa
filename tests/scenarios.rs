//! End-to-end scenarios from the specification's testable-properties
//! section (§8), exercised against the public scheduler/merge/workspace
//! API rather than any one crate's internals.

use std::path::Path;
use std::process::Command;

use serde_json::Value;
use undercity_core::ast_index::{AstIndex, ExportedSymbol};
use undercity_core::config::OrchestratorConfig;
use undercity_core::model::file_tracking::{FileOperation, SymbolKind};
use undercity_core::model::recovery::ParallelTaskStatus;
use undercity_core::model::task::TaskId;
use undercity_core::recovery::RecoveryStateMachine;
use undercity_core::FileTracker;
use undercity_merge::{ConflictBundle, ConflictResolver, MergeOutcome, VerificationFixer, VerifyResult, Verifier};
use undercity_scheduler::{AgentRunner, Decomposition, ResultHandler, RunResult, RunStatus, Scheduler, TokenUsage, TokenUsageAttempt};

fn clock() -> i64 {
    1_700_000_000_000
}

fn run_git(dir: &Path, args: &[&str]) {
    let status = Command::new("git").args(args).current_dir(dir).status().unwrap();
    assert!(status.success(), "git {args:?} failed in {}", dir.display());
}

fn commit_count(dir: &Path) -> usize {
    let out = Command::new("git")
        .args(["rev-list", "--count", "HEAD"])
        .current_dir(dir)
        .output()
        .unwrap();
    String::from_utf8_lossy(&out.stdout).trim().parse().unwrap()
}

fn init_main_repo() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    run_git(dir.path(), &["init", "-q", "-b", "main"]);
    run_git(dir.path(), &["config", "user.email", "test@example.com"]);
    run_git(dir.path(), &["config", "user.name", "Test"]);
    std::fs::write(dir.path().join("README.md"), "seed\n").unwrap();
    run_git(dir.path(), &["add", "-A"]);
    run_git(dir.path(), &["commit", "-q", "-m", "initial"]);
    dir
}

fn scheduler_with(main: &Path, config: &OrchestratorConfig) -> Scheduler {
    let state_dir = main.join(".undercity");
    Scheduler::new(main, config, state_dir, clock).unwrap()
}

/// Writes one file named after its objective and commits it — models a
/// worker that touches a distinct, non-conflicting file per task.
struct DistinctFileRunner;
impl AgentRunner for DistinctFileRunner {
    fn run(&self, workspace_path: &Path, task_objective: &str, _options: &Value) -> RunResult {
        let file_name = format!("{}.txt", task_objective.replace([' ', '/'], "_"));
        std::fs::write(workspace_path.join(&file_name), "worker output\n").unwrap();
        run_git(workspace_path, &["add", "-A"]);
        run_git(workspace_path, &["commit", "-q", "-m", "worker change"]);
        RunResult {
            status: RunStatus::Complete,
            error: None,
            attempts: 1,
            token_usage: TokenUsage {
                attempts: vec![TokenUsageAttempt {
                    model: "test-model".to_owned(),
                    input_tokens: 100,
                    output_tokens: 100,
                    duration_ms: 5,
                }],
            },
            modified_files_hint: None,
            needs_decomposition: None,
            meta_task_result: None,
        }
    }
}

/// Always writes the same file, with content derived from the objective
/// — models two workers contending for the same path.
struct SameFileRunner;
impl AgentRunner for SameFileRunner {
    fn run(&self, workspace_path: &Path, task_objective: &str, _options: &Value) -> RunResult {
        std::fs::write(
            workspace_path.join("shared.txt"),
            format!("written by {task_objective}\n"),
        )
        .unwrap();
        run_git(workspace_path, &["add", "-A"]);
        run_git(workspace_path, &["commit", "-q", "-m", "worker change"]);
        RunResult {
            status: RunStatus::Complete,
            error: None,
            attempts: 1,
            token_usage: TokenUsage::default(),
            modified_files_hint: None,
            needs_decomposition: None,
            meta_task_result: None,
        }
    }
}

struct FailingRunner;
impl AgentRunner for FailingRunner {
    fn run(&self, _workspace_path: &Path, _task_objective: &str, _options: &Value) -> RunResult {
        RunResult {
            status: RunStatus::Failed,
            error: Some("worker could not complete the objective".to_owned()),
            attempts: 1,
            token_usage: TokenUsage::default(),
            modified_files_hint: None,
            needs_decomposition: None,
            meta_task_result: None,
        }
    }
}

/// Reports a fixed, large token usage regardless of what it actually did
/// — used to deterministically trip the rate limiter.
struct HeavyUsageRunner;
impl AgentRunner for HeavyUsageRunner {
    fn run(&self, workspace_path: &Path, task_objective: &str, _options: &Value) -> RunResult {
        let file_name = format!("{}.txt", task_objective.replace([' ', '/'], "_"));
        std::fs::write(workspace_path.join(&file_name), "worker output\n").unwrap();
        run_git(workspace_path, &["add", "-A"]);
        run_git(workspace_path, &["commit", "-q", "-m", "worker change"]);
        RunResult {
            status: RunStatus::Complete,
            error: None,
            attempts: 1,
            token_usage: TokenUsage {
                attempts: vec![TokenUsageAttempt {
                    model: "test-model".to_owned(),
                    input_tokens: 10_000,
                    output_tokens: 10_000,
                    duration_ms: 5,
                }],
            },
            modified_files_hint: None,
            needs_decomposition: None,
            meta_task_result: None,
        }
    }
}

struct AlwaysFailsResolver;
impl ConflictResolver for AlwaysFailsResolver {
    fn resolve(&self, _workspace_path: &Path, _bundle: &ConflictBundle) -> bool {
        false
    }
}

/// Resolves a rebase conflict by taking its own file content verbatim and
/// completing the rebase.
struct TakeOursResolver;
impl ConflictResolver for TakeOursResolver {
    fn resolve(&self, workspace_path: &Path, bundle: &ConflictBundle) -> bool {
        for file in &bundle.files {
            std::fs::write(workspace_path.join(&file.path), "resolved by external resolver\n").unwrap();
        }
        run_git(workspace_path, &["add", "-A"]);
        let status = Command::new("git")
            .args(["-c", "core.editor=true", "rebase", "--continue"])
            .current_dir(workspace_path)
            .status()
            .unwrap();
        status.success()
    }
}

struct AlwaysPassVerifier;
impl Verifier for AlwaysPassVerifier {
    fn run(&self, _workspace_path: &Path) -> VerifyResult {
        VerifyResult {
            success: true,
            output: String::new(),
        }
    }
}

struct NeverFixes;
impl VerificationFixer for NeverFixes {
    fn fix(&self, _workspace_path: &Path, _verify_output: &str) -> bool {
        false
    }
}

struct NoopHandler;
impl ResultHandler for NoopHandler {
    fn handle_meta_task_result(&self, _task_id: &TaskId, _result: &Value) {}
    fn handle_needs_decomposition(&self, _task_id: &TaskId, _decomposition: &Decomposition) {}
}

/// Reports every file as exporting a `Config` symbol, regardless of path
/// — used to deterministically trigger a semantic conflict.
struct SharedSymbolIndex;
impl AstIndex for SharedSymbolIndex {
    fn exported_symbols(&self, _path: &str) -> Vec<ExportedSymbol> {
        vec![ExportedSymbol {
            name: "Config".to_owned(),
            kind: SymbolKind::Class,
        }]
    }
}

/// S1: two tasks touching distinct files both succeed and both merge.
#[test]
fn s1_two_non_conflicting_tasks_both_succeed() {
    let main = init_main_repo();
    let commits_before = commit_count(main.path());
    let scheduler = scheduler_with(main.path(), &OrchestratorConfig::default());

    let tasks = vec![
        (TaskId::from("t1"), "Add flag X in src/a.ts".to_owned()),
        (TaskId::from("t2"), "Add flag Y in src/b.ts".to_owned()),
    ];
    let result = scheduler
        .run_batch(
            &tasks,
            None,
            Value::Null,
            &DistinctFileRunner,
            &AlwaysFailsResolver,
            &AlwaysPassVerifier,
            &NeverFixes,
            &NoopHandler,
        )
        .unwrap();

    assert!(!result.paused);
    assert_eq!(result.outcomes.len(), 2);
    let successful = result
        .outcomes
        .iter()
        .filter(|o| o.status == ParallelTaskStatus::Complete || o.status == ParallelTaskStatus::Merged)
        .count();
    let merged = result
        .outcomes
        .iter()
        .filter(|o| o.status == ParallelTaskStatus::Merged)
        .count();
    assert_eq!(successful, 2);
    assert_eq!(merged, 2);
    assert_eq!(commit_count(main.path()), commits_before + 2);

    let recovery = RecoveryStateMachine::load(main.path().join(".undercity/parallel-recovery.json"), clock)
        .unwrap()
        .unwrap();
    assert!(recovery.info().is_complete);
    let state_dir = main.path().join(".undercity");
    let workspace_manager_empty =
        undercity_workspace::WorkspaceManager::new(main.path(), "main", &state_dir, clock).unwrap();
    assert!(workspace_manager_empty.list_active().is_empty());
}

/// S2: both tasks modify the same file; the resolver stub succeeds, so
/// both candidates end up merged.
#[test]
fn s2_same_file_conflict_resolved_by_external_resolver() {
    let main = init_main_repo();
    let scheduler = scheduler_with(main.path(), &OrchestratorConfig::default());

    let tasks = vec![
        (TaskId::from("t1"), "first writer".to_owned()),
        (TaskId::from("t2"), "second writer".to_owned()),
    ];
    let result = scheduler
        .run_batch(
            &tasks,
            None,
            Value::Null,
            &SameFileRunner,
            &TakeOursResolver,
            &AlwaysPassVerifier,
            &NeverFixes,
            &NoopHandler,
        )
        .unwrap();

    assert_eq!(result.outcomes.len(), 2);
    let merged = result
        .outcomes
        .iter()
        .filter(|o| o.status == ParallelTaskStatus::Merged)
        .count();
    assert_eq!(merged, 2, "{:?}", result.outcomes);
}

/// S2 (failure branch): a resolver that cannot resolve the conflict
/// leaves one candidate merged and the other reported as a failed merge,
/// with its branch preserved rather than force-removed.
#[test]
fn s2_unresolvable_conflict_yields_one_merge_failure() {
    let main = init_main_repo();
    let scheduler = scheduler_with(main.path(), &OrchestratorConfig::default());

    let tasks = vec![
        (TaskId::from("t1"), "first writer".to_owned()),
        (TaskId::from("t2"), "second writer".to_owned()),
    ];
    let result = scheduler
        .run_batch(
            &tasks,
            None,
            Value::Null,
            &SameFileRunner,
            &AlwaysFailsResolver,
            &AlwaysPassVerifier,
            &NeverFixes,
            &NoopHandler,
        )
        .unwrap();

    let merged = result
        .outcomes
        .iter()
        .filter(|o| o.status == ParallelTaskStatus::Merged)
        .count();
    let merge_failed = result
        .outcomes
        .iter()
        .filter(|o| matches!(o.merge_outcome, Some(MergeOutcome::ConflictUnresolved)))
        .count();
    assert_eq!(merged, 1);
    assert_eq!(merge_failed, 1);
}

/// S3: a health monitor sweeps a stuck worker's workspace, nudges it
/// twice, then gives up — without killing anything.
#[test]
fn s3_health_monitor_nudges_then_gives_up_on_a_stuck_worker() {
    use undercity_core::config::HealthConfig;
    use undercity_core::model::workspace::{Checkpoint, CheckpointPhase, TaskAssignment};
    use undercity_scheduler::{HealthAction, HealthMonitor, RunningTask, StuckReason};

    let workspace = tempfile::tempdir().unwrap();
    let assignment = TaskAssignment {
        task_id: TaskId::from("stuck-1"),
        started_at: 0,
        worker_name: "stub-worker".to_owned(),
        checkpoint: Some(Checkpoint {
            phase: CheckpointPhase::Running,
            saved_at: 0,
            data: Value::Null,
        }),
    };
    std::fs::write(
        workspace.path().join(TaskAssignment::FILE_NAME),
        serde_json::to_vec(&assignment).unwrap(),
    )
    .unwrap();

    let config = HealthConfig {
        interval_ms: 60_000,
        stuck_threshold_ms: 300_000,
        max_recovery_attempts: 2,
    };
    let monitor = HealthMonitor::new(config, || 400_000);
    let running = [RunningTask {
        task_id: TaskId::from("stuck-1"),
        workspace_path: workspace.path(),
        started_at: 0,
    }];

    assert_eq!(
        monitor.sweep(&running),
        vec![HealthAction::Nudged {
            reason: StuckReason::StaleCheckpoint,
            attempt: 1,
        }]
    );
    assert!(workspace.path().join(".undercity-nudge").exists());

    assert_eq!(
        monitor.sweep(&running),
        vec![HealthAction::Nudged {
            reason: StuckReason::StaleCheckpoint,
            attempt: 2,
        }]
    );
    assert_eq!(
        monitor.sweep(&running),
        vec![HealthAction::GaveUp {
            reason: StuckReason::StaleCheckpoint,
        }]
    );
}

/// S4: usage recorded by the first task pushes the 5-hour budget over
/// its limit; the remaining tasks in the same `RunBatch` call are never
/// dispatched, and a subsequent call while still paused returns
/// immediately.
#[test]
fn s4_rate_limit_pause_mid_batch() {
    let main = init_main_repo();
    let mut config = OrchestratorConfig::default();
    config.scheduler.max_concurrent = 1;
    config.rate_limit.max_tokens_per_5_hours = 5_000;
    let scheduler = scheduler_with(main.path(), &config);

    let tasks = vec![
        (TaskId::from("t1"), "task one".to_owned()),
        (TaskId::from("t2"), "task two".to_owned()),
        (TaskId::from("t3"), "task three".to_owned()),
    ];
    let result = scheduler
        .run_batch(
            &tasks,
            None,
            Value::Null,
            &HeavyUsageRunner,
            &AlwaysFailsResolver,
            &AlwaysPassVerifier,
            &NeverFixes,
            &NoopHandler,
        )
        .unwrap();

    assert!(!result.paused);
    assert_eq!(result.outcomes.len(), 1, "only the first task should dispatch");
    assert_eq!(result.outcomes[0].task_id, TaskId::from("t1"));

    let recovery = RecoveryStateMachine::load(main.path().join(".undercity/parallel-recovery.json"), clock)
        .unwrap()
        .unwrap();
    let summary = recovery.info();
    assert_eq!(summary.pending, 2, "t2 and t3 were never dispatched");
    assert!(!summary.is_complete);

    let second_call = scheduler
        .run_batch(
            &[(TaskId::from("t4"), "task four".to_owned())],
            None,
            Value::Null,
            &HeavyUsageRunner,
            &AlwaysFailsResolver,
            &AlwaysPassVerifier,
            &NeverFixes,
            &NoopHandler,
        )
        .unwrap();
    assert!(second_call.paused);
    assert!(second_call.outcomes.is_empty());
}

/// S5: a batch crashes with one task complete-and-merged, one still
/// running, and one pending. A fresh `Scheduler` over the same state
/// directory resumes: the stale `running` workspace is cleared and both
/// non-terminal tasks come back as pending for redispatch, while the
/// already-merged task is left untouched.
#[test]
fn s5_crash_during_batch_then_resume() {
    let main = init_main_repo();
    let config = OrchestratorConfig::default();
    let state_dir = main.path().join(".undercity");

    // Simulate the crashed batch's on-disk state directly: this is what
    // a prior `Scheduler::run_batch` invocation would have persisted up
    // to the moment the process was killed.
    {
        let workspace_manager =
            undercity_workspace::WorkspaceManager::new(main.path(), "main", &state_dir, clock).unwrap();
        let t2_workspace = workspace_manager.create("t2").unwrap();
        std::fs::write(t2_workspace.path.join("in-progress.txt"), "partial work\n").unwrap();

        let tasks = vec![
            (TaskId::from("t1"), "first".to_owned()),
            (TaskId::from("t2"), "second".to_owned()),
            (TaskId::from("t3"), "third".to_owned()),
        ];
        let recovery = RecoveryStateMachine::create_state(
            state_dir.join("parallel-recovery.json"),
            "batch-crashed",
            &tasks,
            None,
            Value::Null,
            clock,
        )
        .unwrap();
        recovery
            .update_task_status(
                &TaskId::from("t1"),
                undercity_core::TaskStatusUpdate {
                    status: ParallelTaskStatus::Merged,
                    completed_at: Some(clock()),
                    ..Default::default()
                },
            )
            .unwrap();
        recovery
            .record_workspace(&TaskId::from("t2"), t2_workspace.path.clone(), t2_workspace.branch.clone())
            .unwrap();
        recovery
            .update_task_status(
                &TaskId::from("t2"),
                undercity_core::TaskStatusUpdate {
                    status: ParallelTaskStatus::Running,
                    started_at: Some(clock()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(!recovery.info().is_complete);
        // `recovery` and `workspace_manager` drop here, as if the process died.
    }

    let scheduler = scheduler_with(main.path(), &config);
    assert!(RecoveryStateMachine::load(state_dir.join("parallel-recovery.json"), clock)
        .unwrap()
        .unwrap()
        .has_active());

    let pending = scheduler.resume_pending().unwrap();
    let mut objectives: Vec<&str> = pending.iter().map(|p| p.objective.as_str()).collect();
    objectives.sort_unstable();
    assert_eq!(objectives, vec!["second", "third"]);
    assert!(!main.path().join(".undercity/workspaces/t2").exists());

    let recovery = RecoveryStateMachine::load(state_dir.join("parallel-recovery.json"), clock)
        .unwrap()
        .unwrap();
    let summary = recovery.info();
    assert_eq!(summary.merged, 1);
    assert_eq!(summary.pending, 2);
    assert!(!summary.is_complete);

    for task_id in [TaskId::from("t2"), TaskId::from("t3")] {
        recovery
            .update_task_status(
                &task_id,
                undercity_core::TaskStatusUpdate {
                    status: ParallelTaskStatus::Merged,
                    completed_at: Some(clock()),
                    ..Default::default()
                },
            )
            .unwrap();
    }
    assert!(recovery.info().is_complete);
}

/// S6: two tasks modify different files that both export a symbol named
/// `Config`, per a stub AST index; the tracker reports one semantic
/// conflict naming both agents.
#[test]
fn s6_semantic_conflict_on_exported_symbol() {
    let repo = tempfile::tempdir().unwrap();
    let tracker = FileTracker::new(repo.path(), clock);

    tracker.start_tracking("agent-a", Some(TaskId::from("t1")), "session-1");
    tracker.record_file_access("agent-a", "src/a.ts", FileOperation::Write, None);

    tracker.start_tracking("agent-b", Some(TaskId::from("t2")), "session-1");
    tracker.record_file_access("agent-b", "src/b.ts", FileOperation::Write, None);

    let report = tracker.detect_semantic_conflicts(&SharedSymbolIndex);
    assert_eq!(report.conflicts.len(), 1);
    let conflict = &report.conflicts[0];
    assert_eq!(conflict.symbol_name, "Config");
    assert_eq!(conflict.symbol_kind, SymbolKind::Class);
    let mut touched_by = conflict.touched_by.clone();
    touched_by.sort();
    assert_eq!(touched_by, vec!["agent-a", "agent-b"]);
}

/// Boundary: `RunBatch([])` is a no-op.
#[test]
fn run_batch_with_no_tasks_is_a_noop() {
    let main = init_main_repo();
    let scheduler = scheduler_with(main.path(), &OrchestratorConfig::default());
    let result = scheduler
        .run_batch(
            &[],
            None,
            Value::Null,
            &DistinctFileRunner,
            &AlwaysFailsResolver,
            &AlwaysPassVerifier,
            &NeverFixes,
            &NoopHandler,
        )
        .unwrap();
    assert!(!result.paused);
    assert!(result.outcomes.is_empty());
}

/// Boundary: `RunSingle` never provisions a workspace and never invokes
/// the merge pipeline — its one outcome is terminal without a
/// `merge_outcome`.
#[test]
fn run_single_is_the_no_workspace_fast_path() {
    let main = init_main_repo();
    let scheduler = scheduler_with(main.path(), &OrchestratorConfig::default());
    let result = scheduler
        .run_single("t1", "do the thing", None, Value::Null, &DistinctFileRunner, &NoopHandler)
        .unwrap();
    assert_eq!(result.outcomes.len(), 1);
    assert_eq!(result.outcomes[0].status, ParallelTaskStatus::Merged);
    assert!(result.outcomes[0].merge_outcome.is_none());
    assert!(!main.path().join(".undercity/workspaces").exists());
}

/// Boundary + failure reporting: a worker-level failure is reported
/// inline, never escalated to `run_batch`'s own `Result::Err`.
#[test]
fn worker_failure_is_reported_not_propagated() {
    let main = init_main_repo();
    let scheduler = scheduler_with(main.path(), &OrchestratorConfig::default());
    let tasks = vec![(TaskId::from("t1"), "doomed task".to_owned())];
    let result = scheduler
        .run_batch(
            &tasks,
            None,
            Value::Null,
            &FailingRunner,
            &AlwaysFailsResolver,
            &AlwaysPassVerifier,
            &NeverFixes,
            &NoopHandler,
        )
        .unwrap();
    assert_eq!(result.outcomes[0].status, ParallelTaskStatus::Failed);
    assert!(result.outcomes[0].merge_outcome.is_none());
}
