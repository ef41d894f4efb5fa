//! `MergePipeline` — integrates one successful worker's changes into the
//! main branch serially, under rebase semantics, with verification gating.

use std::path::PathBuf;
use std::sync::Mutex;

use tracing::{info, warn};
use undercity_core::atomic::write_json_atomic;
use undercity_core::config::{MergeConfig, OnFailure};
use undercity_core::error::{validate_output_size, validate_text_input};
use undercity_core::model::quarantine::QuarantineRecord;
use undercity_core::model::task::TaskId;
use undercity_git::GitBackend;

use crate::error::MergeError;
use crate::traits::{ConflictBundle, ConflictFile, ConflictResolver, VerificationFixer, Verifier};
use crate::validate::validate_repo_path;

/// One worker's candidate to integrate.
#[derive(Clone, Debug)]
pub struct MergeTask {
    /// The task this candidate belongs to.
    pub task_id: TaskId,
    /// Path to the worker's isolated workspace.
    pub workspace_path: PathBuf,
    /// The worker's branch, holding the candidate commits.
    pub branch: String,
}

/// Result of attempting to merge one task's candidate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Fast-forwarded into main at this commit.
    Merged {
        /// The commit now at the tip of main.
        sha: String,
    },
    /// The rebase still had unresolved conflicts after the resolver ran.
    ConflictUnresolved,
    /// Verification failed even after exhausting fix attempts.
    VerificationFailed {
        /// Whether the candidate was preserved in a quarantine workspace.
        quarantined: bool,
    },
    /// An unrecoverable condition (missing workspace, concurrent
    /// destruction, an unrestorable stash) — carries a diagnostic for the
    /// caller, distinct from the two domain-specific failure outcomes.
    Fatal {
        /// Human-readable diagnostic.
        message: String,
    },
}

/// Serially integrates successful workers into main. Holds an internal
/// mutex so at most one merge runs at a time globally, regardless of how
/// many callers invoke [`Self::merge`] concurrently.
pub struct MergePipeline {
    main_repo: GitBackend,
    main_branch: String,
    config: MergeConfig,
    max_output_bytes: usize,
    quarantine_dir: PathBuf,
    serial: Mutex<()>,
    now_ms: fn() -> i64,
}

impl MergePipeline {
    /// Construct a pipeline operating on `main_repo_path`/`main_branch`,
    /// persisting quarantine records under `state_dir`. `max_output_bytes`
    /// bounds any command output or diff content the pipeline reads across
    /// an interface boundary (see `OrchestratorConfig::validation`).
    #[must_use]
    pub fn new(
        main_repo_path: impl Into<PathBuf>,
        main_branch: impl Into<String>,
        config: MergeConfig,
        max_output_bytes: usize,
        state_dir: impl Into<PathBuf>,
        now_ms: fn() -> i64,
    ) -> Self {
        let state_dir = state_dir.into();
        Self {
            main_repo: GitBackend::at(main_repo_path),
            main_branch: main_branch.into(),
            config,
            max_output_bytes,
            quarantine_dir: state_dir.join("quarantine"),
            serial: Mutex::new(()),
            now_ms,
        }
    }

    /// Run the full merge algorithm for `task`.
    ///
    /// # Errors
    /// Returns [`MergeError`] only for failures in the pipeline's own
    /// bookkeeping (e.g. persisting a quarantine record); every merge
    /// failure mode has a corresponding [`MergeOutcome`] variant instead.
    ///
    /// # Panics
    /// Panics if the internal serialization mutex is poisoned.
    pub fn merge(
        &self,
        task: &MergeTask,
        resolver: &dyn ConflictResolver,
        verifier: &dyn Verifier,
        fixer: &dyn VerificationFixer,
    ) -> Result<MergeOutcome, MergeError> {
        let _serial_guard = self.serial.lock().unwrap();

        // 1. Validate workspace.
        if !task.workspace_path.is_dir() {
            return Ok(MergeOutcome::Fatal {
                message: format!("workspace {} does not exist", task.workspace_path.display()),
            });
        }
        let workspace = GitBackend::at(&task.workspace_path);

        // 2. Clean working tree.
        if let Some(outcome) = self.clean_working_tree(&workspace) {
            return Ok(outcome);
        }

        // 3. Fetch main.
        let main_repo_path = self.main_repo.path().to_string_lossy().into_owned();
        validate_repo_path(&main_repo_path)?;
        if let Err(e) = workspace.fetch(&main_repo_path, &self.main_branch) {
            return Ok(MergeOutcome::Fatal {
                message: format!("fetch failed: {e}"),
            });
        }

        // 4. Rebase.
        if let Some(outcome) = self.rebase_with_resolver(&workspace, resolver)? {
            return Ok(outcome);
        }

        // 5. Post-rebase verification (with bounded fix-retry).
        if let Some(outcome) = self.verify_with_fixer(task, &workspace, verifier, fixer)? {
            return Ok(outcome);
        }

        // 6. Validate the rebased candidate's diff before it lands on main.
        if let Some(outcome) = self.validate_candidate_diff(&workspace)? {
            return Ok(outcome);
        }

        // 7. Fast-forward merge into main.
        self.fast_forward_merge(&workspace, task)
    }

    /// Collects the diff the candidate is about to contribute to main and
    /// checks it against the same interface-boundary rules as any other
    /// captured command output: a rebase that reports clean but leaves
    /// residual conflict markers, or an unreasonably large diff, is
    /// rejected here rather than fast-forwarded.
    fn validate_candidate_diff(&self, workspace: &GitBackend) -> Result<Option<MergeOutcome>, MergeError> {
        let diff = match workspace.diff("FETCH_HEAD", "HEAD") {
            Ok(diff) => diff,
            Err(e) => {
                return Ok(Some(MergeOutcome::Fatal {
                    message: format!("failed to collect candidate diff: {e}"),
                }))
            }
        };
        match validate_text_input(&diff, self.max_output_bytes) {
            Ok(()) => Ok(None),
            Err(e) => Ok(Some(MergeOutcome::Fatal { message: e.to_string() })),
        }
    }

    fn clean_working_tree(&self, workspace: &GitBackend) -> Option<MergeOutcome> {
        for result in [workspace.reset_hard("HEAD"), workspace.clean_fd()] {
            if let Err(e) = result {
                let message = e.to_string();
                if message.contains("not a work tree") {
                    return Some(MergeOutcome::Fatal {
                        message: format!("workspace was concurrently destroyed: {message}"),
                    });
                }
                return Some(MergeOutcome::Fatal { message });
            }
        }
        None
    }

    /// Returns `Some(outcome)` if the merge should stop here (unresolved
    /// conflict or a fatal rebase failure); `None` to continue to
    /// verification.
    fn rebase_with_resolver(
        &self,
        workspace: &GitBackend,
        resolver: &dyn ConflictResolver,
    ) -> Result<Option<MergeOutcome>, MergeError> {
        if workspace.rebase("FETCH_HEAD").is_ok() {
            return Ok(None);
        }

        if !workspace.rebase_in_progress().unwrap_or(false) {
            // Rebase failed but left nothing in progress — not a conflict,
            // something else went wrong (hooks, permissions, ...).
            return Ok(Some(MergeOutcome::Fatal {
                message: "rebase failed without entering a conflict state".to_owned(),
            }));
        }

        let bundle = self.collect_conflict_bundle(workspace)?;
        resolver.resolve(workspace.path(), &bundle);

        if workspace.rebase_in_progress().unwrap_or(false) {
            warn!("rebase conflicts remain unresolved after resolver ran");
            let _ = workspace.rebase_abort();
            return Ok(Some(MergeOutcome::ConflictUnresolved));
        }

        Ok(None)
    }

    /// Reads each conflicted file's content for the resolver. Only the
    /// size half of the interface-boundary validation applies here — an
    /// in-progress rebase's conflicted files necessarily contain
    /// `<<<<<<<`/`=======`/`>>>>>>>` markers, so rejecting on their
    /// presence would reject every real conflict.
    fn collect_conflict_bundle(&self, workspace: &GitBackend) -> Result<ConflictBundle, MergeError> {
        let conflicted = workspace.conflicted_files().unwrap_or_default();
        let mut files = Vec::new();
        for path in conflicted.into_iter().take(ConflictBundle::MAX_FILES) {
            let content = std::fs::read_to_string(workspace.path().join(&path)).unwrap_or_default();
            validate_output_size(&content, self.max_output_bytes)?;
            let truncated: String = content.chars().take(ConflictBundle::MAX_BYTES_PER_FILE).collect();
            files.push(ConflictFile {
                path,
                content: truncated,
            });
        }
        Ok(ConflictBundle { files })
    }

    /// Returns `Some(outcome)` if verification never succeeded (terminal
    /// failure, possibly quarantined); `None` to continue to the
    /// fast-forward merge step.
    fn verify_with_fixer(
        &self,
        task: &MergeTask,
        workspace: &GitBackend,
        verifier: &dyn Verifier,
        fixer: &dyn VerificationFixer,
    ) -> Result<Option<MergeOutcome>, MergeError> {
        let mut result = verifier.run(workspace.path());
        let mut attempts = 0;
        while !result.success && attempts < self.config.max_merge_fix_attempts {
            attempts += 1;
            if !fixer.fix(workspace.path(), &result.output) {
                break;
            }
            if workspace.add_all().is_err() || workspace.commit("fix: merge verification failure").is_err() {
                break;
            }
            result = verifier.run(workspace.path());
        }

        if result.success {
            return Ok(None);
        }

        let quarantined = if self.config.on_failure == OnFailure::Quarantine {
            self.quarantine(task, workspace, &result.output)?
        } else {
            false
        };
        Ok(Some(MergeOutcome::VerificationFailed { quarantined }))
    }

    fn quarantine(
        &self,
        task: &MergeTask,
        workspace: &GitBackend,
        reason: &str,
    ) -> Result<bool, MergeError> {
        let Ok(candidate_sha) = workspace.rev_parse("HEAD") else {
            warn!(task_id = %task.task_id, "quarantine: could not resolve candidate sha, skipping");
            return Ok(false);
        };
        let merge_id = candidate_sha.chars().take(12).collect::<String>();
        let quarantine_path = self.quarantine_dir.join(format!("merge-quarantine-{merge_id}"));

        if self
            .main_repo
            .worktree_add(&quarantine_path, &format!("{merge_id}-quarantine"), &candidate_sha)
            .is_err()
        {
            warn!(task_id = %task.task_id, "quarantine: worktree creation failed, reporting unquarantined");
            return Ok(false);
        }

        let record = QuarantineRecord {
            merge_id: merge_id.clone(),
            task_id: task.task_id.clone(),
            branch: task.branch.clone(),
            workspace_path: quarantine_path,
            reason: reason.to_owned(),
            created_at: (self.now_ms)(),
        };
        let record_path = self.quarantine_dir.join(format!("{merge_id}.json"));
        write_json_atomic(&record_path, &record)?;
        info!(task_id = %task.task_id, merge_id, "merge candidate quarantined");
        Ok(true)
    }

    fn fast_forward_merge(&self, workspace: &GitBackend, task: &MergeTask) -> Result<MergeOutcome, MergeError> {
        let sha = match workspace.rev_parse(&task.branch) {
            Ok(sha) => sha,
            Err(e) => return Ok(MergeOutcome::Fatal { message: e.to_string() }),
        };

        if let Err(e) = workspace.checkout_detached(&sha) {
            return Ok(MergeOutcome::Fatal {
                message: format!("failed to detach HEAD to release branch lock: {e}"),
            });
        }

        let stash_label = format!("undercity-merge-stash-{}", task.task_id);
        let stashed = match self.main_repo.is_dirty() {
            Ok(true) => match self.main_repo.stash_push(&stash_label) {
                Ok(()) => true,
                Err(e) => {
                    return Ok(MergeOutcome::Fatal {
                        message: format!("failed to stash main repo changes before merge: {e}"),
                    })
                }
            },
            Ok(false) => false,
            Err(e) => return Ok(MergeOutcome::Fatal { message: e.to_string() }),
        };

        let result = self
            .main_repo
            .checkout(&self.main_branch)
            .and_then(|()| self.main_repo.merge_ff_only(&sha));

        if let Err(e) = result {
            if stashed {
                if let Err(restore_err) = self.main_repo.stash_pop() {
                    return Ok(MergeOutcome::Fatal {
                        message: format!(
                            "merge failed ({e}) and stash restore also failed ({restore_err}); main repo's stash may need manual recovery"
                        ),
                    });
                }
            }
            return Ok(MergeOutcome::Fatal {
                message: format!("fast-forward merge failed: {e}"),
            });
        }

        if stashed {
            if let Err(e) = self.main_repo.stash_pop() {
                warn!(task_id = %task.task_id, error = %e, "merge succeeded but stash pop failed; main repo's stash needs manual recovery");
            }
        }

        Ok(MergeOutcome::Merged { sha })
    }
}
