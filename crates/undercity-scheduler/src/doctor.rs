//! A narrow, no-UI self-check: reports repository and state-directory
//! problems that would otherwise surface as a confusing mid-batch
//! failure. Returns plain data — callers decide how, or whether, to
//! present it.

use std::path::Path;

use undercity_git::GitBackend;

/// One diagnostic check's result.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Check {
    /// Short, stable name for this check.
    pub name: &'static str,
    /// Whether the check passed.
    pub ok: bool,
    /// Human-readable detail, regardless of outcome.
    pub detail: String,
}

/// Every check this diagnostic runs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DoctorReport {
    /// Individual check results, in the order they ran.
    pub checks: Vec<Check>,
}

impl DoctorReport {
    /// Whether every check passed.
    #[must_use]
    pub fn all_ok(&self) -> bool {
        self.checks.iter().all(|c| c.ok)
    }
}

/// Run every check against `main_repo_path`/`state_dir`.
#[must_use]
pub fn run(main_repo_path: &Path, state_dir: &Path) -> DoctorReport {
    DoctorReport {
        checks: vec![
            check_repo_not_bare(main_repo_path),
            check_no_rebase_in_progress(main_repo_path),
            check_state_dir_writable(state_dir),
        ],
    }
}

fn check_repo_not_bare(main_repo_path: &Path) -> Check {
    let name = "repo-not-bare";
    match GitBackend::at(main_repo_path).is_bare() {
        Ok(false) => Check {
            name,
            ok: true,
            detail: "main repository has a working tree".to_owned(),
        },
        Ok(true) => Check {
            name,
            ok: false,
            detail: "main repository is bare; workspace creation requires a working tree".to_owned(),
        },
        Err(e) => Check {
            name,
            ok: false,
            detail: format!("could not inspect repository: {e}"),
        },
    }
}

fn check_no_rebase_in_progress(main_repo_path: &Path) -> Check {
    let name = "no-rebase-in-progress";
    match GitBackend::at(main_repo_path).rebase_in_progress() {
        Ok(false) => Check {
            name,
            ok: true,
            detail: "main repository has no rebase in progress".to_owned(),
        },
        Ok(true) => Check {
            name,
            ok: false,
            detail: "main repository has a rebase in progress; merges will fail until it is resolved or aborted"
                .to_owned(),
        },
        Err(e) => Check {
            name,
            ok: false,
            detail: format!("could not inspect repository: {e}"),
        },
    }
}

fn check_state_dir_writable(state_dir: &Path) -> Check {
    let name = "state-dir-writable";
    if let Err(e) = std::fs::create_dir_all(state_dir) {
        return Check {
            name,
            ok: false,
            detail: format!("could not create {}: {e}", state_dir.display()),
        };
    }
    let probe = state_dir.join(".doctor-write-probe");
    match std::fs::write(&probe, b"ok") {
        Ok(()) => {
            let _ = std::fs::remove_file(&probe);
            Check {
                name,
                ok: true,
                detail: format!("{} is writable", state_dir.display()),
            }
        }
        Err(e) => Check {
            name,
            ok: false,
            detail: format!("{} is not writable: {e}", state_dir.display()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    fn run_git(dir: &Path, args: &[&str]) {
        let status = Command::new("git").args(args).current_dir(dir).status().unwrap();
        assert!(status.success(), "git {args:?} failed");
    }

    #[test]
    fn non_bare_repo_with_writable_state_dir_passes_every_check() {
        let repo = tempfile::tempdir().unwrap();
        run_git(repo.path(), &["init", "-q", "-b", "main"]);
        run_git(repo.path(), &["config", "user.email", "test@example.com"]);
        run_git(repo.path(), &["config", "user.name", "Test"]);
        std::fs::write(repo.path().join("a.txt"), "hello\n").unwrap();
        run_git(repo.path(), &["add", "-A"]);
        run_git(repo.path(), &["commit", "-q", "-m", "initial"]);

        let state_dir = tempfile::tempdir().unwrap();
        let report = run(repo.path(), state_dir.path());
        assert!(report.all_ok(), "{report:?}");
    }

    #[test]
    fn bare_repo_fails_the_bare_check() {
        let repo = tempfile::tempdir().unwrap();
        run_git(repo.path(), &["init", "-q", "--bare"]);

        let state_dir = tempfile::tempdir().unwrap();
        let report = run(repo.path(), state_dir.path());
        let bare_check = report.checks.iter().find(|c| c.name == "repo-not-bare").unwrap();
        assert!(!bare_check.ok);
        assert!(!report.all_ok());
    }

    #[test]
    fn unwritable_state_dir_fails_its_check() {
        let repo = tempfile::tempdir().unwrap();
        run_git(repo.path(), &["init", "-q", "-b", "main"]);
        run_git(repo.path(), &["config", "user.email", "test@example.com"]);
        run_git(repo.path(), &["config", "user.name", "Test"]);
        std::fs::write(repo.path().join("a.txt"), "hello\n").unwrap();
        run_git(repo.path(), &["add", "-A"]);
        run_git(repo.path(), &["commit", "-q", "-m", "initial"]);

        // A regular file where the state directory should be: `create_dir_all`
        // fails because a non-directory already occupies that path.
        let parent = tempfile::tempdir().unwrap();
        let state_dir = parent.path().join("not-a-dir");
        std::fs::write(&state_dir, b"occupied").unwrap();

        let report = run(repo.path(), &state_dir);
        let writable_check = report.checks.iter().find(|c| c.name == "state-dir-writable").unwrap();
        assert!(!writable_check.ok);
    }
}
