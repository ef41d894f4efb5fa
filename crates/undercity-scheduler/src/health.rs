//! `HealthMonitor` — periodically sweeps running tasks for stalled
//! workers, nudging them via a well-known file before giving up once a
//! recovery-attempt budget is exhausted.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use serde::Serialize;
use tracing::{info, warn};
use undercity_core::config::HealthConfig;
use undercity_core::model::task::TaskId;
use undercity_core::model::workspace::TaskAssignment;

/// Well-known file a nudged worker is expected to notice and act on.
const NUDGE_FILE_NAME: &str = ".undercity-nudge";

#[derive(Clone, Debug, Serialize)]
struct Nudge {
    timestamp: i64,
    reason: String,
    attempt: u32,
    message: String,
}

/// Why a task was judged stuck.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StuckReason {
    /// A checkpoint exists but hasn't been updated recently enough.
    StaleCheckpoint,
    /// No checkpoint was ever written and the task has been running long
    /// enough that one should have appeared by now.
    NoCheckpoint,
}

/// What the monitor did about one running task during a sweep.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HealthAction {
    /// The task looks healthy; no action taken.
    Healthy,
    /// The task was stuck and a nudge was written.
    Nudged { reason: StuckReason, attempt: u32 },
    /// The task was stuck but the recovery-attempt budget is exhausted;
    /// logged only, no further nudge written.
    GaveUp { reason: StuckReason },
}

/// A running task the monitor should examine, supplied fresh by the
/// caller on every sweep — the monitor holds no view of the task board
/// itself, only its own per-task attempt counters.
pub struct RunningTask<'a> {
    /// The task id.
    pub task_id: TaskId,
    /// Path to the task's isolated workspace.
    pub workspace_path: &'a Path,
    /// When the worker started, milliseconds since the Unix epoch.
    pub started_at: i64,
}

/// Checks running tasks' self-reported checkpoints (`TaskAssignment`,
/// written by the worker inside its own workspace) and nudges, or gives
/// up on, ones that appear stuck.
pub struct HealthMonitor {
    config: HealthConfig,
    attempts: Mutex<HashMap<TaskId, u32>>,
    now_ms: fn() -> i64,
}

impl HealthMonitor {
    /// Build a monitor from `config`.
    #[must_use]
    pub fn new(config: HealthConfig, now_ms: fn() -> i64) -> Self {
        Self {
            config,
            attempts: Mutex::new(HashMap::new()),
            now_ms,
        }
    }

    /// How often the caller should invoke [`Self::sweep`], in
    /// milliseconds.
    #[must_use]
    pub fn interval_ms(&self) -> u64 {
        self.config.interval_ms
    }

    /// Examine every `running` task once, nudging (or giving up on) the
    /// ones that appear stuck. Returns one [`HealthAction`] per task, in
    /// input order.
    ///
    /// # Panics
    /// Panics if the internal attempt-tracking mutex is poisoned.
    pub fn sweep(&self, running: &[RunningTask<'_>]) -> Vec<HealthAction> {
        let now = (self.now_ms)();
        running.iter().map(|task| self.check_one(task, now)).collect()
    }

    /// Forget a task's recovery-attempt count, once it leaves the running
    /// set for good (merged, failed, or canceled).
    ///
    /// # Panics
    /// Panics if the internal attempt-tracking mutex is poisoned.
    pub fn forget(&self, task_id: &TaskId) {
        self.attempts.lock().unwrap().remove(task_id);
    }

    fn check_one(&self, task: &RunningTask<'_>, now: i64) -> HealthAction {
        let assignment: Option<TaskAssignment> =
            std::fs::read_to_string(task.workspace_path.join(TaskAssignment::FILE_NAME))
                .ok()
                .and_then(|raw| serde_json::from_str(&raw).ok());

        let threshold = i64::try_from(self.config.stuck_threshold_ms).unwrap_or(i64::MAX);
        let reason = match assignment.as_ref().and_then(|a| a.checkpoint.as_ref()) {
            Some(checkpoint) if now - checkpoint.saved_at > threshold => Some(StuckReason::StaleCheckpoint),
            None if now - task.started_at > threshold => Some(StuckReason::NoCheckpoint),
            _ => None,
        };

        let Some(reason) = reason else {
            self.attempts.lock().unwrap().remove(&task.task_id);
            return HealthAction::Healthy;
        };

        let attempt = {
            let mut attempts = self.attempts.lock().unwrap();
            let count = attempts.entry(task.task_id.clone()).or_insert(0);
            if *count >= self.config.max_recovery_attempts {
                warn!(task_id = %task.task_id, attempts = *count, "giving up on stuck worker");
                return HealthAction::GaveUp { reason };
            }
            *count += 1;
            *count
        };

        let nudge = Nudge {
            timestamp: now,
            reason: match reason {
                StuckReason::StaleCheckpoint => "stale checkpoint".to_owned(),
                StuckReason::NoCheckpoint => "no checkpoint written".to_owned(),
            },
            attempt,
            message: "no progress detected; report a checkpoint or wrap up".to_owned(),
        };
        if let Err(e) = write_nudge(task.workspace_path, &nudge) {
            warn!(task_id = %task.task_id, error = %e, "failed to write nudge file");
        } else {
            info!(task_id = %task.task_id, attempt, "nudged stuck worker");
        }
        HealthAction::Nudged { reason, attempt }
    }
}

fn write_nudge(workspace_path: &Path, nudge: &Nudge) -> std::io::Result<()> {
    let body = serde_json::to_vec_pretty(nudge)?;
    std::fs::write(workspace_path.join(NUDGE_FILE_NAME), body)
}
