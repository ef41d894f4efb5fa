//! Subprocess `git` invocation, argument-array only, never shell-joined.

use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::debug;

use crate::error::GitError;
use crate::validate::{validate_message, validate_path, validate_ref};

/// A git repository (or worktree) addressed by its working directory.
///
/// Every operation shells out to the `git` binary with a literal argument
/// array — no string ever passes through a shell, and every ref/path/
/// message argument is checked by [`crate::validate`] first.
#[derive(Clone, Debug)]
pub struct GitBackend {
    path: PathBuf,
}

impl GitBackend {
    /// Address the repository (or worktree) rooted at `path`.
    #[must_use]
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The working directory this backend operates on.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `git fetch <remote> <branch>`.
    ///
    /// # Errors
    /// Returns [`GitError::InvalidArgument`] if `branch` fails validation,
    /// or [`GitError::CommandFailed`] if git exits non-zero.
    pub fn fetch(&self, remote: &str, branch: &str) -> Result<(), GitError> {
        validate_ref(branch)?;
        self.run(&["fetch", remote, branch]).map(drop)
    }

    /// `git rebase <onto>`.
    ///
    /// # Errors
    /// See [`Self::fetch`].
    pub fn rebase(&self, onto: &str) -> Result<(), GitError> {
        validate_ref(onto)?;
        self.run(&["rebase", onto]).map(drop)
    }

    /// `git rebase --abort`.
    ///
    /// # Errors
    /// Returns [`GitError::CommandFailed`] if git exits non-zero.
    pub fn rebase_abort(&self) -> Result<(), GitError> {
        self.run(&["rebase", "--abort"]).map(drop)
    }

    /// `git rebase --continue`.
    ///
    /// # Errors
    /// Returns [`GitError::CommandFailed`] if git exits non-zero.
    pub fn rebase_continue(&self) -> Result<(), GitError> {
        self.run(&["rebase", "--continue"]).map(drop)
    }

    /// `git reset --hard <reference>`.
    ///
    /// # Errors
    /// See [`Self::fetch`].
    pub fn reset_hard(&self, reference: &str) -> Result<(), GitError> {
        validate_ref(reference)?;
        self.run(&["reset", "--hard", reference]).map(drop)
    }

    /// `git diff --name-only --diff-filter=U` — paths with unresolved
    /// rebase/merge conflicts.
    ///
    /// # Errors
    /// Returns [`GitError::CommandFailed`] if git exits non-zero.
    pub fn conflicted_files(&self) -> Result<Vec<String>, GitError> {
        let stdout = self.run(&["diff", "--name-only", "--diff-filter=U"])?;
        Ok(stdout.lines().map(str::to_owned).collect())
    }

    /// Whether a rebase is currently in progress, detected by the
    /// presence of `rebase-merge`/`rebase-apply` under the git dir (the
    /// same heuristic `git status` itself uses).
    ///
    /// # Errors
    /// Returns [`GitError::CommandFailed`] if `git rev-parse --git-dir`
    /// fails (e.g. `self.path` is not inside a git repository).
    pub fn rebase_in_progress(&self) -> Result<bool, GitError> {
        let git_dir = self.git_dir()?;
        Ok(git_dir.join("rebase-merge").exists() || git_dir.join("rebase-apply").exists())
    }

    /// `git rev-parse --git-dir`.
    ///
    /// # Errors
    /// Returns [`GitError::CommandFailed`] if git exits non-zero.
    pub fn git_dir(&self) -> Result<PathBuf, GitError> {
        let stdout = self.run(&["rev-parse", "--git-dir"])?;
        Ok(self.path.join(stdout.trim()))
    }

    /// `git rev-parse --is-bare-repository`.
    ///
    /// # Errors
    /// Returns [`GitError::CommandFailed`] if git exits non-zero (e.g.
    /// `self.path` is not inside a git repository at all).
    pub fn is_bare(&self) -> Result<bool, GitError> {
        let stdout = self.run(&["rev-parse", "--is-bare-repository"])?;
        Ok(stdout.trim() == "true")
    }

    /// `git config core.bare false`. Repairs the mis-configuration where a
    /// repository that should have a working tree ends up flagged bare —
    /// a known race when many workspaces are torn down concurrently and
    /// one leaves `core.bare` toggled.
    ///
    /// # Errors
    /// Returns [`GitError::CommandFailed`] if git exits non-zero.
    pub fn set_not_bare(&self) -> Result<(), GitError> {
        self.run(&["config", "core.bare", "false"]).map(drop)
    }

    /// `git status --porcelain`, parsed into one path per changed file.
    ///
    /// # Errors
    /// Returns [`GitError::CommandFailed`] if git exits non-zero.
    pub fn status_porcelain(&self) -> Result<Vec<String>, GitError> {
        let stdout = self.run(&["status", "--porcelain"])?;
        Ok(stdout
            .lines()
            .filter_map(|line| line.get(3..).map(str::to_owned))
            .collect())
    }

    /// Whether the working tree has any uncommitted changes.
    ///
    /// # Errors
    /// Returns [`GitError::CommandFailed`] if git exits non-zero.
    pub fn is_dirty(&self) -> Result<bool, GitError> {
        Ok(!self.status_porcelain()?.is_empty())
    }

    /// `git diff --name-only <range>`.
    ///
    /// # Errors
    /// Returns [`GitError::InvalidArgument`] if either ref fails
    /// validation, or [`GitError::CommandFailed`].
    pub fn diff_name_only(&self, base: &str, head: &str) -> Result<Vec<String>, GitError> {
        validate_ref(base)?;
        validate_ref(head)?;
        let range = format!("{base}..{head}");
        let stdout = self.run(&["diff", "--name-only", &range])?;
        Ok(stdout.lines().map(str::to_owned).collect())
    }

    /// `git diff <range>` — the full unified patch text.
    ///
    /// # Errors
    /// Returns [`GitError::InvalidArgument`] if either ref fails
    /// validation, or [`GitError::CommandFailed`].
    pub fn diff(&self, base: &str, head: &str) -> Result<String, GitError> {
        validate_ref(base)?;
        validate_ref(head)?;
        let range = format!("{base}..{head}");
        self.run(&["diff", &range])
    }

    /// `git checkout <ref>`.
    ///
    /// # Errors
    /// See [`Self::fetch`].
    pub fn checkout(&self, reference: &str) -> Result<(), GitError> {
        validate_ref(reference)?;
        self.run(&["checkout", reference]).map(drop)
    }

    /// `git checkout --detach <ref>`.
    ///
    /// # Errors
    /// See [`Self::fetch`].
    pub fn checkout_detached(&self, reference: &str) -> Result<(), GitError> {
        validate_ref(reference)?;
        self.run(&["checkout", "--detach", reference]).map(drop)
    }

    /// `git merge --ff-only <commit>`.
    ///
    /// # Errors
    /// See [`Self::fetch`].
    pub fn merge_ff_only(&self, commit: &str) -> Result<(), GitError> {
        validate_ref(commit)?;
        self.run(&["merge", "--ff-only", commit]).map(drop)
    }

    /// `git stash push -m <message>`.
    ///
    /// # Errors
    /// Returns [`GitError::InvalidArgument`] if `message` fails
    /// validation, or [`GitError::CommandFailed`].
    pub fn stash_push(&self, message: &str) -> Result<(), GitError> {
        validate_message(message)?;
        self.run(&["stash", "push", "-u", "-m", message]).map(drop)
    }

    /// `git stash pop`.
    ///
    /// # Errors
    /// Returns [`GitError::CommandFailed`] if git exits non-zero.
    pub fn stash_pop(&self) -> Result<(), GitError> {
        self.run(&["stash", "pop"]).map(drop)
    }

    /// `git add -A`.
    ///
    /// # Errors
    /// Returns [`GitError::CommandFailed`] if git exits non-zero.
    pub fn add_all(&self) -> Result<(), GitError> {
        self.run(&["add", "-A"]).map(drop)
    }

    /// `git commit -m <message>`.
    ///
    /// # Errors
    /// See [`Self::stash_push`].
    pub fn commit(&self, message: &str) -> Result<(), GitError> {
        validate_message(message)?;
        self.run(&["commit", "-m", message]).map(drop)
    }

    /// `git clean -fd`.
    ///
    /// # Errors
    /// Returns [`GitError::CommandFailed`] if git exits non-zero.
    pub fn clean_fd(&self) -> Result<(), GitError> {
        self.run(&["clean", "-fd"]).map(drop)
    }

    /// `git worktree add -b <branch> <path> <base>`.
    ///
    /// # Errors
    /// Returns [`GitError::InvalidArgument`] if `branch`/`base` fail
    /// validation, or [`GitError::CommandFailed`].
    pub fn worktree_add(&self, path: &Path, branch: &str, base: &str) -> Result<(), GitError> {
        validate_ref(branch)?;
        validate_ref(base)?;
        let path_str = path.to_string_lossy().into_owned();
        self.run(&["worktree", "add", "-b", branch, &path_str, base])
            .map(drop)
    }

    /// `git worktree remove [--force] <path>`.
    ///
    /// # Errors
    /// Returns [`GitError::CommandFailed`] if git exits non-zero.
    pub fn worktree_remove(&self, path: &Path, force: bool) -> Result<(), GitError> {
        let path_str = path.to_string_lossy().into_owned();
        let mut args = vec!["worktree", "remove"];
        if force {
            args.push("--force");
        }
        args.push(&path_str);
        self.run(&args).map(drop)
    }

    /// `git worktree prune`.
    ///
    /// # Errors
    /// Returns [`GitError::CommandFailed`] if git exits non-zero.
    pub fn worktree_prune(&self) -> Result<(), GitError> {
        self.run(&["worktree", "prune"]).map(drop)
    }

    /// `git branch -D <name>`.
    ///
    /// # Errors
    /// Returns [`GitError::InvalidArgument`] if `name` fails validation,
    /// or [`GitError::CommandFailed`].
    pub fn branch_delete_force(&self, name: &str) -> Result<(), GitError> {
        validate_ref(name)?;
        self.run(&["branch", "-D", name]).map(drop)
    }

    /// `git rev-parse <rev>`, trimmed.
    ///
    /// # Errors
    /// Returns [`GitError::InvalidArgument`] if `rev` fails validation, or
    /// [`GitError::CommandFailed`].
    pub fn rev_parse(&self, rev: &str) -> Result<String, GitError> {
        validate_ref(rev)?;
        Ok(self.run(&["rev-parse", rev])?.trim().to_owned())
    }

    /// `git branch --show-current`, or `None` in detached HEAD.
    ///
    /// # Errors
    /// Returns [`GitError::CommandFailed`] if git exits non-zero.
    pub fn current_branch(&self) -> Result<Option<String>, GitError> {
        let stdout = self.run(&["branch", "--show-current"])?;
        let trimmed = stdout.trim();
        Ok(if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_owned())
        })
    }

    /// `path` passed to [`validate::validate_path`] and then
    /// `git diff --name-only <range> -- <path>`'s single-path counterpart:
    /// whether `path` changed between `base` and `head`.
    ///
    /// # Errors
    /// Returns [`GitError::InvalidArgument`] or [`GitError::CommandFailed`].
    pub fn path_changed_in_range(&self, base: &str, head: &str, path: &str) -> Result<bool, GitError> {
        validate_ref(base)?;
        validate_ref(head)?;
        validate_path(path)?;
        let range = format!("{base}..{head}");
        let stdout = self.run(&["diff", "--name-only", &range, "--", path])?;
        Ok(!stdout.trim().is_empty())
    }

    /// Run `git` with a literal argument array in this repository's
    /// working directory, returning stdout on success.
    fn run(&self, args: &[&str]) -> Result<String, GitError> {
        debug!(path = %self.path.display(), args = ?args, "running git");
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.path)
            .output()
            .map_err(GitError::Spawn)?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail: String = stderr.lines().rev().take(20).collect::<Vec<_>>().join("\n");
            return Err(GitError::CommandFailed {
                args: args.iter().map(|s| (*s).to_owned()).collect(),
                stderr: tail,
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command as StdCommand;

    fn init_repo() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let run = |args: &[&str]| {
            StdCommand::new("git")
                .args(args)
                .current_dir(dir.path())
                .output()
                .unwrap();
        };
        run(&["init", "-q", "-b", "main"]);
        run(&["config", "user.email", "test@example.com"]);
        run(&["config", "user.name", "Test"]);
        std::fs::write(dir.path().join("a.txt"), "hello\n").unwrap();
        run(&["add", "-A"]);
        run(&["commit", "-q", "-m", "initial"]);
        dir
    }

    #[test]
    fn status_is_clean_after_commit() {
        let dir = init_repo();
        let backend = GitBackend::at(dir.path());
        assert!(!backend.is_dirty().unwrap());
    }

    #[test]
    fn status_reports_new_file() {
        let dir = init_repo();
        std::fs::write(dir.path().join("b.txt"), "new\n").unwrap();
        let backend = GitBackend::at(dir.path());
        assert!(backend.is_dirty().unwrap());
        let status = backend.status_porcelain().unwrap();
        assert!(status.iter().any(|p| p.contains("b.txt")));
    }

    #[test]
    fn current_branch_reports_main() {
        let dir = init_repo();
        let backend = GitBackend::at(dir.path());
        assert_eq!(backend.current_branch().unwrap(), Some("main".to_owned()));
    }

    #[test]
    fn rebase_in_progress_is_false_on_clean_repo() {
        let dir = init_repo();
        let backend = GitBackend::at(dir.path());
        assert!(!backend.rebase_in_progress().unwrap());
    }

    #[test]
    fn invalid_ref_is_rejected_before_spawning_git() {
        let dir = init_repo();
        let backend = GitBackend::at(dir.path());
        let err = backend.fetch("origin", "--upload-pack=evil").unwrap_err();
        assert!(matches!(err, GitError::InvalidArgument { kind: "ref", .. }));
    }

    #[test]
    fn worktree_add_and_remove_round_trip() {
        let dir = init_repo();
        let backend = GitBackend::at(dir.path());
        let wt_dir = tempfile::tempdir().unwrap();
        let wt_path = wt_dir.path().join("task-1");
        backend.worktree_add(&wt_path, "task/1", "main").unwrap();
        assert!(wt_path.join("a.txt").exists());
        backend.worktree_remove(&wt_path, true).unwrap();
        assert!(!wt_path.exists());
    }

    #[test]
    fn command_failure_carries_stderr_tail() {
        let dir = init_repo();
        let backend = GitBackend::at(dir.path());
        let err = backend.checkout("does-not-exist").unwrap_err();
        match err {
            GitError::CommandFailed { stderr, .. } => assert!(!stderr.is_empty()),
            other => panic!("expected CommandFailed, got {other:?}"),
        }
    }

    #[test]
    fn diff_name_only_reports_changed_files() {
        let dir = init_repo();
        let backend = GitBackend::at(dir.path());
        StdCommand::new("git")
            .args(["checkout", "-b", "feature"])
            .current_dir(dir.path())
            .output()
            .unwrap();
        std::fs::write(dir.path().join("a.txt"), "changed\n").unwrap();
        StdCommand::new("git")
            .args(["commit", "-aqm", "change"])
            .current_dir(dir.path())
            .output()
            .unwrap();
        let files = backend.diff_name_only("main", "feature").unwrap();
        assert_eq!(files, vec!["a.txt".to_owned()]);
    }
}
