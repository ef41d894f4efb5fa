//! `WorkspaceManager` — provisions and destroys isolated git worktrees, one
//! per concurrently running task.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{debug, info, warn};
use undercity_core::atomic::{read_json_or_default, write_json_atomic};
use undercity_core::model::task::TaskId;
use undercity_core::model::workspace::{TaskAssignment, Workspace};
use undercity_git::GitBackend;

use crate::error::WorkspaceError;
use crate::registry::Registry;
use crate::validate::validate_task_id;

/// Something that knows whether a task has reached a terminal status, so
/// [`WorkspaceManager::gc`] can tell a stuck-but-live workspace from a
/// genuinely abandoned one without depending on the scheduler crate.
pub trait TaskTerminalCheck {
    /// `true` if `task_id`'s task is in a terminal state (complete,
    /// failed, or merged) and its workspace is therefore safe to reclaim.
    fn is_terminal(&self, task_id: &str) -> bool;
}

/// Provisions and destroys one isolated working copy per task, under
/// `<state_dir>/workspaces/<task_id>` on a branch named
/// `undercity/<task_id>`.
pub struct WorkspaceManager {
    main_repo: GitBackend,
    main_branch: String,
    workspaces_root: PathBuf,
    registry_path: PathBuf,
    registry: Mutex<Registry>,
    now_ms: fn() -> i64,
}

impl WorkspaceManager {
    /// Open a manager rooted at `main_repo_path`, persisting its registry
    /// under `state_dir`.
    ///
    /// # Errors
    /// Returns [`WorkspaceError::RepoUnavailable`] if `main_repo_path` is
    /// not a usable git repository.
    pub fn new(
        main_repo_path: impl Into<PathBuf>,
        main_branch: impl Into<String>,
        state_dir: impl Into<PathBuf>,
        now_ms: fn() -> i64,
    ) -> Result<Self, WorkspaceError> {
        let main_repo_path = main_repo_path.into();
        let main_repo = GitBackend::at(&main_repo_path);
        main_repo.current_branch().map_err(|e| WorkspaceError::RepoUnavailable {
            path: main_repo_path.display().to_string(),
            detail: e.to_string(),
        })?;

        let state_dir = state_dir.into();
        let registry_path = state_dir.join("workspaces.json");
        let registry: Registry = read_json_or_default(&registry_path);

        Ok(Self {
            main_repo,
            main_branch: main_branch.into(),
            workspaces_root: state_dir.join("workspaces"),
            registry_path,
            registry: Mutex::new(registry),
            now_ms,
        })
    }

    /// The main repository's path.
    #[must_use]
    pub fn main_repo_path(&self) -> &Path {
        self.main_repo.path()
    }

    /// The main repository's integration branch.
    #[must_use]
    pub fn main_branch(&self) -> &str {
        &self.main_branch
    }

    /// Provision an isolated worktree for `task_id` on a fresh branch cut
    /// from the current main branch tip.
    ///
    /// # Errors
    /// Returns [`WorkspaceError::InvalidTaskId`] if `task_id` contains
    /// characters unsafe for a path/branch component,
    /// [`WorkspaceError::WorkspaceBusy`] if one already exists for this
    /// task, or [`WorkspaceError::Git`]/[`WorkspaceError::RepoUnavailable`]
    /// on repository failures. A failed create leaves no partial state:
    /// the worktree and branch are both removed before returning.
    ///
    /// # Panics
    /// Panics if the internal registry mutex is poisoned.
    pub fn create(&self, task_id: &str) -> Result<Workspace, WorkspaceError> {
        validate_task_id(task_id)?;
        self.repair_if_bare()?;

        let mut registry = self.registry.lock().unwrap();
        if let Some(existing) = registry.find(task_id) {
            return Err(WorkspaceError::WorkspaceBusy {
                task_id: task_id.to_owned(),
                path: existing.path.display().to_string(),
            });
        }

        let path = self.workspaces_root.join(task_id);
        let branch = format!("undercity/{task_id}");

        let main_tip = self
            .main_repo
            .rev_parse(&self.main_branch)
            .map_err(WorkspaceError::Git)?;

        if let Err(e) = self.main_repo.worktree_add(&path, &branch, &main_tip) {
            // Leave no partial state: best-effort revert of anything that
            // might have landed before the failure.
            let _ = self.main_repo.worktree_remove(&path, true);
            let _ = self.main_repo.branch_delete_force(&branch);
            return Err(WorkspaceError::Git(e));
        }

        let created_at = (self.now_ms)();
        let workspace = Workspace {
            task_id: TaskId::from(task_id),
            path,
            branch,
            created_at,
            is_active: true,
        };

        // `prepared`-phase assignment: the worker has not yet been
        // dispatched into this workspace, so there is no checkpoint and
        // no real worker identity yet — the worker overwrites this file
        // with its own checkpoints once it starts.
        let assignment = TaskAssignment::new(workspace.task_id.clone(), created_at, "unassigned");
        write_json_atomic(&workspace.path.join(TaskAssignment::FILE_NAME), &assignment)?;

        registry.upsert(workspace.clone());
        write_json_atomic(&self.registry_path, &*registry)?;
        info!(task_id, path = %workspace.path.display(), "workspace created");
        Ok(workspace)
    }

    /// Tear down the worktree and delete its branch.
    ///
    /// # Errors
    /// Returns [`WorkspaceError::NotFound`] if no workspace is registered
    /// for `task_id`, [`WorkspaceError::DirtyWorkingTree`] if `force` is
    /// `false` and uncommitted changes remain, or
    /// [`WorkspaceError::Git`]/[`WorkspaceError::Io`] on failure.
    ///
    /// # Panics
    /// Panics if the internal registry mutex is poisoned.
    pub fn remove(&self, task_id: &str, force: bool) -> Result<(), WorkspaceError> {
        validate_task_id(task_id)?;
        let mut registry = self.registry.lock().unwrap();
        let workspace = registry
            .find(task_id)
            .cloned()
            .ok_or_else(|| WorkspaceError::NotFound {
                task_id: task_id.to_owned(),
            })?;

        if !force {
            let wt_backend = GitBackend::at(&workspace.path);
            if wt_backend.is_dirty()? {
                return Err(WorkspaceError::DirtyWorkingTree {
                    task_id: task_id.to_owned(),
                });
            }
        }

        self.main_repo.worktree_remove(&workspace.path, true)?;
        self.main_repo.branch_delete_force(&workspace.branch)?;
        registry.remove(task_id);
        write_json_atomic(&self.registry_path, &*registry)?;
        info!(task_id, "workspace removed");
        Ok(())
    }

    /// Mark a workspace inactive without touching its worktree or branch
    /// on disk — used when a failed merge candidate must be left for
    /// manual inspection (`on_failure = fail`, or an unresolved rebase
    /// conflict). Satisfies the same "no workspace remains registered as
    /// active" end-of-batch invariant as [`Self::remove`] without
    /// discarding the candidate.
    ///
    /// # Errors
    /// Returns [`WorkspaceError::NotFound`] if no workspace is registered
    /// for `task_id`, or [`WorkspaceError::Io`] if persisting the registry
    /// fails.
    ///
    /// # Panics
    /// Panics if the internal registry mutex is poisoned.
    pub fn detach(&self, task_id: &str) -> Result<(), WorkspaceError> {
        validate_task_id(task_id)?;
        let mut registry = self.registry.lock().unwrap();
        let Some(workspace) = registry.workspaces.iter_mut().find(|w| w.task_id.as_str() == task_id) else {
            return Err(WorkspaceError::NotFound {
                task_id: task_id.to_owned(),
            });
        };
        workspace.is_active = false;
        write_json_atomic(&self.registry_path, &*registry)?;
        info!(task_id, "workspace detached; branch preserved for inspection");
        Ok(())
    }

    /// List every workspace currently registered as active.
    ///
    /// # Panics
    /// Panics if the internal registry mutex is poisoned.
    #[must_use]
    pub fn list_active(&self) -> Vec<Workspace> {
        self.registry
            .lock()
            .unwrap()
            .workspaces
            .iter()
            .filter(|w| w.is_active)
            .cloned()
            .collect()
    }

    /// Reclaim workspaces whose task has reached a terminal state per
    /// `checker` but whose directory or branch was never cleaned up
    /// (e.g. because the cleanup attempt after a merge failed and only
    /// logged, per the error-handling design). Never touches a
    /// workspace `checker` reports as non-terminal.
    ///
    /// # Errors
    /// Returns [`WorkspaceError::Io`] if persisting the updated registry
    /// fails. Individual worktree-removal failures are logged and
    /// skipped rather than aborting the whole sweep.
    ///
    /// # Panics
    /// Panics if the internal registry mutex is poisoned.
    pub fn gc(&self, checker: &dyn TaskTerminalCheck) -> Result<Vec<String>, WorkspaceError> {
        let mut registry = self.registry.lock().unwrap();
        let stale: Vec<Workspace> = registry
            .workspaces
            .iter()
            .filter(|w| checker.is_terminal(w.task_id.as_str()))
            .cloned()
            .collect();

        let mut reclaimed = Vec::new();
        for workspace in stale {
            let task_id = workspace.task_id.as_str().to_owned();
            match self.main_repo.worktree_remove(&workspace.path, true) {
                Ok(()) => {
                    let _ = self.main_repo.branch_delete_force(&workspace.branch);
                    registry.remove(&task_id);
                    reclaimed.push(task_id);
                }
                Err(e) => {
                    warn!(task_id, error = %e, "gc: failed to reclaim workspace, leaving registered");
                }
            }
        }

        if !reclaimed.is_empty() {
            write_json_atomic(&self.registry_path, &*registry)?;
            debug!(count = reclaimed.len(), "gc reclaimed workspaces");
        }
        Ok(reclaimed)
    }

    /// Detect and repair the main repository being mis-configured as
    /// bare — a known race hazard when many `worktree remove`s run
    /// concurrently and one leaves `core.bare` toggled.
    fn repair_if_bare(&self) -> Result<(), WorkspaceError> {
        if self.main_repo.is_bare()? {
            warn!("main repository mis-configured as bare; repairing");
            self.main_repo.set_not_bare()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    fn clock() -> i64 {
        1_700_000_000_000
    }

    fn init_repo() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let run = |args: &[&str]| {
            Command::new("git").args(args).current_dir(dir.path()).output().unwrap();
        };
        run(&["init", "-q", "-b", "main"]);
        run(&["config", "user.email", "test@example.com"]);
        run(&["config", "user.name", "Test"]);
        std::fs::write(dir.path().join("a.txt"), "hello\n").unwrap();
        run(&["add", "-A"]);
        run(&["commit", "-q", "-m", "initial"]);
        dir
    }

    struct AllTerminal;
    impl TaskTerminalCheck for AllTerminal {
        fn is_terminal(&self, _task_id: &str) -> bool {
            true
        }
    }

    struct NoneTerminal;
    impl TaskTerminalCheck for NoneTerminal {
        fn is_terminal(&self, _task_id: &str) -> bool {
            false
        }
    }

    #[test]
    fn create_then_list_active() {
        let repo = init_repo();
        let state_dir = tempfile::tempdir().unwrap();
        let mgr =
            WorkspaceManager::new(repo.path(), "main", state_dir.path(), clock).unwrap();
        let ws = mgr.create("task-1").unwrap();
        assert!(ws.path.exists());
        assert_eq!(mgr.list_active().len(), 1);
    }

    #[test]
    fn duplicate_create_is_rejected() {
        let repo = init_repo();
        let state_dir = tempfile::tempdir().unwrap();
        let mgr = WorkspaceManager::new(repo.path(), "main", state_dir.path(), clock).unwrap();
        mgr.create("task-1").unwrap();
        let err = mgr.create("task-1").unwrap_err();
        assert!(matches!(err, WorkspaceError::WorkspaceBusy { .. }));
    }

    #[test]
    fn invalid_task_id_is_rejected_before_touching_git() {
        let repo = init_repo();
        let state_dir = tempfile::tempdir().unwrap();
        let mgr = WorkspaceManager::new(repo.path(), "main", state_dir.path(), clock).unwrap();
        let err = mgr.create("../escape").unwrap_err();
        assert!(matches!(err, WorkspaceError::InvalidTaskId { .. }));
    }

    #[test]
    fn remove_clean_workspace_succeeds() {
        let repo = init_repo();
        let state_dir = tempfile::tempdir().unwrap();
        let mgr = WorkspaceManager::new(repo.path(), "main", state_dir.path(), clock).unwrap();
        let ws = mgr.create("task-1").unwrap();
        mgr.remove("task-1", false).unwrap();
        assert!(!ws.path.exists());
        assert!(mgr.list_active().is_empty());
    }

    #[test]
    fn remove_refuses_dirty_tree_without_force() {
        let repo = init_repo();
        let state_dir = tempfile::tempdir().unwrap();
        let mgr = WorkspaceManager::new(repo.path(), "main", state_dir.path(), clock).unwrap();
        let ws = mgr.create("task-1").unwrap();
        std::fs::write(ws.path.join("dirty.txt"), "oops\n").unwrap();
        let err = mgr.remove("task-1", false).unwrap_err();
        assert!(matches!(err, WorkspaceError::DirtyWorkingTree { .. }));
    }

    #[test]
    fn remove_force_discards_dirty_changes() {
        let repo = init_repo();
        let state_dir = tempfile::tempdir().unwrap();
        let mgr = WorkspaceManager::new(repo.path(), "main", state_dir.path(), clock).unwrap();
        let ws = mgr.create("task-1").unwrap();
        std::fs::write(ws.path.join("dirty.txt"), "oops\n").unwrap();
        mgr.remove("task-1", true).unwrap();
        assert!(mgr.list_active().is_empty());
    }

    #[test]
    fn remove_unknown_task_errors() {
        let repo = init_repo();
        let state_dir = tempfile::tempdir().unwrap();
        let mgr = WorkspaceManager::new(repo.path(), "main", state_dir.path(), clock).unwrap();
        let err = mgr.remove("ghost", true).unwrap_err();
        assert!(matches!(err, WorkspaceError::NotFound { .. }));
    }

    #[test]
    fn gc_reclaims_only_terminal_workspaces() {
        let repo = init_repo();
        let state_dir = tempfile::tempdir().unwrap();
        let mgr = WorkspaceManager::new(repo.path(), "main", state_dir.path(), clock).unwrap();
        mgr.create("task-1").unwrap();
        mgr.create("task-2").unwrap();

        let reclaimed = mgr.gc(&NoneTerminal).unwrap();
        assert!(reclaimed.is_empty());
        assert_eq!(mgr.list_active().len(), 2);

        let reclaimed = mgr.gc(&AllTerminal).unwrap();
        assert_eq!(reclaimed.len(), 2);
        assert!(mgr.list_active().is_empty());
    }

    #[test]
    fn registry_persists_across_reopen() {
        let repo = init_repo();
        let state_dir = tempfile::tempdir().unwrap();
        {
            let mgr =
                WorkspaceManager::new(repo.path(), "main", state_dir.path(), clock).unwrap();
            mgr.create("task-1").unwrap();
        }
        let mgr = WorkspaceManager::new(repo.path(), "main", state_dir.path(), clock).unwrap();
        assert_eq!(mgr.list_active().len(), 1);
    }
}
