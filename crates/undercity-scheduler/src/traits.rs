//! `AgentRunner` / `ResultHandler` — the external collaborators that
//! actually run an LLM-driven worker and consume its opaque result
//! payload. Deliberately out of scope per §1: the scheduler only ever
//! calls through these interfaces.

use std::path::Path;

use serde_json::Value;
use undercity_core::model::task::TaskId;

/// One model invocation's token accounting, as self-reported by the
/// runner.
#[derive(Clone, Debug, PartialEq)]
pub struct TokenUsageAttempt {
    /// The model used for this attempt.
    pub model: String,
    /// Input tokens consumed.
    pub input_tokens: u64,
    /// Output tokens produced.
    pub output_tokens: u64,
    /// Wall-clock duration of this attempt.
    pub duration_ms: u64,
}

/// Token usage across every attempt the runner made internally (retries,
/// model escalation). The scheduler never sees a single aggregate figure
/// — it is handed the full per-attempt breakdown so the rate limiter can
/// apply per-model multipliers correctly.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TokenUsage {
    /// One entry per model invocation.
    pub attempts: Vec<TokenUsageAttempt>,
}

/// A runner's request that a task be split rather than merged as-is.
#[derive(Clone, Debug, PartialEq)]
pub struct Decomposition {
    /// Why the task could not be completed as a single unit.
    pub reason: String,
    /// Optional suggested subtask objectives.
    pub suggested_subtasks: Option<Vec<String>>,
}

/// Whether the runner completed its objective.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunStatus {
    /// The objective was completed; the workspace holds the result.
    Complete,
    /// The objective could not be completed.
    Failed,
}

/// The result of one `AgentRunner::run` invocation.
#[derive(Clone, Debug, PartialEq)]
pub struct RunResult {
    /// Final status.
    pub status: RunStatus,
    /// Error detail, if `status == Failed`.
    pub error: Option<String>,
    /// Number of internal attempts the runner made.
    pub attempts: u32,
    /// Per-attempt token usage.
    pub token_usage: TokenUsage,
    /// The runner's own guess at which files it touched, used as a
    /// fallback when a git diff against main is unavailable.
    pub modified_files_hint: Option<Vec<String>>,
    /// Set when the runner determined the task should be decomposed
    /// rather than merged.
    pub needs_decomposition: Option<Decomposition>,
    /// Opaque payload handed to the `ResultHandler` unexamined.
    pub meta_task_result: Option<Value>,
}

/// Runs one task's worker to completion inside an already-provisioned
/// workspace.
///
/// The runner is expected to perform its own internal retries, model
/// escalation, and verification; the scheduler observes only the final
/// result.
pub trait AgentRunner {
    /// Run `task_objective` in `workspace_path`.
    fn run(&self, workspace_path: &Path, task_objective: &str, options: &Value) -> RunResult;
}

/// Consumes a runner's opaque `meta_task_result` and `needs_decomposition`
/// signals. The scheduler does not interpret either itself.
pub trait ResultHandler {
    /// Called once per task that returned a `meta_task_result`.
    fn handle_meta_task_result(&self, task_id: &TaskId, result: &Value);

    /// Called once per task that returned `needs_decomposition`. The
    /// scheduler does not merge such a task; it only marks the workspace
    /// "failed (decomposed)" and defers to this handler for task-board
    /// bookkeeping.
    fn handle_needs_decomposition(&self, task_id: &TaskId, decomposition: &Decomposition);
}
