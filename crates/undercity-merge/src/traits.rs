//! External-collaborator interfaces the merge pipeline invokes but does
//! not implement itself (conflict resolution and verification are
//! typically backed by an LLM agent or the target project's own CI
//! tooling).

use std::path::Path;

/// One conflicted file's bounded content, handed to a [`ConflictResolver`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConflictFile {
    /// Path to the conflicted file, relative to the workspace root.
    pub path: String,
    /// File content, truncated to at most 3 KB.
    pub content: String,
}

/// At most 3 conflicted files, each capped at 3 KB, handed to an external
/// resolver — bounded so the resolver's context stays small even when a
/// rebase produces many conflicts.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConflictBundle {
    /// The conflicted files.
    pub files: Vec<ConflictFile>,
}

impl ConflictBundle {
    /// Maximum number of files included in a bundle.
    pub const MAX_FILES: usize = 3;
    /// Maximum bytes of content kept per file.
    pub const MAX_BYTES_PER_FILE: usize = 3 * 1024;
}

/// Attempts to resolve rebase conflicts by editing files in the
/// workspace and running `git add`/`git rebase --continue` itself. The
/// pipeline re-checks whether a rebase is still in progress afterward
/// rather than trusting the return value alone.
pub trait ConflictResolver {
    /// Attempt resolution. The return value is advisory; the pipeline's
    /// own follow-up check of rebase-in-progress is authoritative.
    fn resolve(&self, workspace_path: &Path, bundle: &ConflictBundle) -> bool;
}

/// Outcome of running the project's verification step (build, lint,
/// test suite — whatever the target project defines).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VerifyResult {
    /// Whether verification passed.
    pub success: bool,
    /// Captured output, shown to a [`VerificationFixer`] on failure.
    pub output: String,
}

/// Runs post-rebase verification in a workspace.
pub trait Verifier {
    /// Run verification in `workspace_path`.
    fn run(&self, workspace_path: &Path) -> VerifyResult;
}

/// Attempts to fix a verification failure by editing files in the
/// workspace. Does not commit — the pipeline commits on the caller's
/// behalf once a fix attempt reports success.
pub trait VerificationFixer {
    /// Attempt a fix given the verifier's failing output. Returns `true`
    /// if it made changes worth re-verifying.
    fn fix(&self, workspace_path: &Path, verify_output: &str) -> bool;
}
