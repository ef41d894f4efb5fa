//! Restrictive character-class validation applied to anything that becomes
//! a `git` subprocess argument. Spec §7 requires every ref, path, and task
//! id be checked before it reaches `Command::arg` — arguments are passed
//! as a literal array and never shell-interpolated, but a ref or path
//! built from attacker- or agent-controlled text can still smuggle a
//! leading `-` flag or a `..` traversal if it is not constrained first.

use crate::error::GitError;

/// Branch/ref names: alphanumerics, `_`, `-`, `.`, `/`. Must not start with
/// `-` (would be parsed as a flag) and must not contain `..` (ambiguous
/// range syntax) or whitespace.
pub fn validate_ref(value: &str) -> Result<(), GitError> {
    validate(value, "ref", |s| {
        !s.is_empty()
            && !s.starts_with('-')
            && !s.contains("..")
            && s.chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '/'))
    })
}

/// Relative file paths passed to `git diff`/`git add`: same charset as
/// refs, plus no leading `/` (must stay relative to the repo root).
pub fn validate_path(value: &str) -> Result<(), GitError> {
    validate(value, "path", |s| {
        !s.is_empty()
            && !s.starts_with('-')
            && !s.starts_with('/')
            && !s.contains("..")
            && s.chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '/'))
    })
}

/// Commit messages and stash labels: printable text, no control
/// characters, and — critically — must not start with `-` (would be
/// parsed as a flag by `git commit -m`).
pub fn validate_message(value: &str) -> Result<(), GitError> {
    validate(value, "message", |s| {
        !s.is_empty() && !s.starts_with('-') && !s.chars().any(|c| c.is_control() && c != '\n')
    })
}

fn validate(value: &str, kind: &'static str, ok: impl FnOnce(&str) -> bool) -> Result<(), GitError> {
    if ok(value) {
        Ok(())
    } else {
        Err(GitError::InvalidArgument {
            kind,
            value: value.to_owned(),
        })
    }
}
