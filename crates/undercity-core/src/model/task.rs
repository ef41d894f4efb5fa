//! Task identity, status, and the backlog's dependency/subtask tree.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Opaque task identifier. A newtype rather than a bare `String` so call
/// sites can't accidentally pass a branch name or path where a task id is
/// expected.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    /// Borrow the inner string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Mutable status of a [`Task`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Queued, not yet dispatched.
    Pending,
    /// Dispatched to a worker; a workspace exists.
    Running,
    /// The worker returned successfully but has not yet merged.
    Complete,
    /// The worker returned an error, or merge failed permanently.
    Failed,
    /// The worker's changes were fast-forward merged into main.
    Merged,
    /// Blocked on an unsatisfied dependency.
    Blocked,
    /// Canceled before or during dispatch (shutdown, fatal rate-limit hit).
    Canceled,
    /// Superseded — no longer relevant to the current backlog.
    Obsolete,
}

impl TaskStatus {
    /// Terminal statuses are the ones [`super::recovery::ParallelTaskState`]
    /// treats as "done" for `isComplete` purposes.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Merged)
    }
}

/// A structured, opaque description of the work a task represents. The
/// orchestrator core never interprets this beyond passing it to an
/// `AgentRunner` — see `undercity-scheduler::AgentRunner`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticket {
    /// Free-form human-readable summary.
    pub summary: String,
    /// Free-form body; may be empty.
    #[serde(default)]
    pub body: String,
}

/// A single backlog task.
///
/// Identity (`id`, `objective`, `created_at`) is immutable once created;
/// `status` and the optional fields mutate as the task progresses through
/// the backlog and the scheduler.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier.
    pub id: TaskId,
    /// The objective text handed to the `AgentRunner`.
    pub objective: String,
    /// Creation timestamp, milliseconds since the Unix epoch.
    pub created_at: i64,
    /// Current status.
    pub status: TaskStatus,
    /// Scheduling priority; lower sorts first. Default `500`.
    #[serde(default = "default_priority")]
    pub priority: i32,
    /// Tasks that must reach a terminal, non-failed status before this one
    /// may be dispatched.
    #[serde(default)]
    pub depends_on: BTreeSet<TaskId>,
    /// The parent task, if this is a subtask.
    #[serde(default)]
    pub parent_id: Option<TaskId>,
    /// Subtask ids, if this task was decomposed.
    #[serde(default)]
    pub subtask_ids: BTreeSet<TaskId>,
    /// Free-form labels.
    #[serde(default)]
    pub tags: BTreeSet<String>,
    /// Optional structured description.
    #[serde(default)]
    pub ticket: Option<Ticket>,
}

const fn default_priority() -> i32 {
    500
}

impl Task {
    /// Construct a new, `pending` task with default priority and no
    /// relationships.
    #[must_use]
    pub fn new(id: impl Into<TaskId>, objective: impl Into<String>, created_at: i64) -> Self {
        Self {
            id: id.into(),
            objective: objective.into(),
            created_at,
            status: TaskStatus::Pending,
            priority: default_priority(),
            depends_on: BTreeSet::new(),
            parent_id: None,
            subtask_ids: BTreeSet::new(),
            tags: BTreeSet::new(),
            ticket: None,
        }
    }
}

/// Check the invariant that a set of tasks' `dependsOn` edges form a DAG
/// (no cycles).
///
/// # Errors
/// Returns the id of a task that participates in a cycle.
pub fn check_acyclic(tasks: &[Task]) -> Result<(), TaskId> {
    use std::collections::HashMap;

    let by_id: HashMap<&TaskId, &Task> = tasks.iter().map(|t| (&t.id, t)).collect();

    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Done,
    }

    let mut marks: HashMap<&TaskId, Mark> = HashMap::new();

    fn visit<'a>(
        id: &'a TaskId,
        by_id: &HashMap<&'a TaskId, &'a Task>,
        marks: &mut HashMap<&'a TaskId, Mark>,
    ) -> Result<(), TaskId> {
        match marks.get(id) {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::Visiting) => return Err(id.clone()),
            None => {}
        }
        marks.insert(id, Mark::Visiting);
        if let Some(task) = by_id.get(id) {
            for dep in &task.depends_on {
                visit(dep, by_id, marks)?;
            }
        }
        marks.insert(id, Mark::Done);
        Ok(())
    }

    for task in tasks {
        visit(&task.id, &by_id, &mut marks)?;
    }
    Ok(())
}

/// Check the invariant that `parentId`/`subtaskIds` are mutually consistent:
/// if `A.subtaskIds` contains `B` then `B.parentId == Some(A.id)`.
///
/// # Errors
/// Returns the ids of the first inconsistent parent/child pair found.
pub fn check_parent_child_consistent(tasks: &[Task]) -> Result<(), (TaskId, TaskId)> {
    use std::collections::HashMap;
    let by_id: HashMap<&TaskId, &Task> = tasks.iter().map(|t| (&t.id, t)).collect();

    for task in tasks {
        for child_id in &task.subtask_ids {
            if let Some(child) = by_id.get(child_id) {
                if child.parent_id.as_ref() != Some(&task.id) {
                    return Err((task.id.clone(), child_id.clone()));
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str, deps: &[&str]) -> Task {
        let mut t = Task::new(id, "do something", 0);
        t.depends_on = deps.iter().map(|d| TaskId::from(*d)).collect();
        t
    }

    #[test]
    fn acyclic_graph_passes() {
        let tasks = vec![task("a", &[]), task("b", &["a"]), task("c", &["a", "b"])];
        assert!(check_acyclic(&tasks).is_ok());
    }

    #[test]
    fn self_cycle_detected() {
        let tasks = vec![task("a", &["a"])];
        assert_eq!(check_acyclic(&tasks), Err(TaskId::from("a")));
    }

    #[test]
    fn longer_cycle_detected() {
        let tasks = vec![task("a", &["b"]), task("b", &["c"]), task("c", &["a"])];
        assert!(check_acyclic(&tasks).is_err());
    }

    #[test]
    fn parent_child_consistency_holds() {
        let mut parent = task("a", &[]);
        parent.subtask_ids.insert(TaskId::from("b"));
        let mut child = task("b", &[]);
        child.parent_id = Some(TaskId::from("a"));
        assert!(check_parent_child_consistent(&[parent, child]).is_ok());
    }

    #[test]
    fn parent_child_inconsistency_detected() {
        let mut parent = task("a", &[]);
        parent.subtask_ids.insert(TaskId::from("b"));
        let child = task("b", &[]); // missing parent_id back-reference
        assert!(check_parent_child_consistent(&[parent, child]).is_err());
    }

    #[test]
    fn terminal_statuses() {
        assert!(TaskStatus::Complete.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Merged.is_terminal());
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(!TaskStatus::Blocked.is_terminal());
    }
}
