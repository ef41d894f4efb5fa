//! Unified error taxonomy for the orchestrator core.
//!
//! Each crate in the workspace defines its own narrow error enum for the
//! failures it can actually produce (see `undercity-workspace::WorkspaceError`,
//! `undercity-merge::MergeError`) rather than funneling everything through one
//! god-enum. This module holds only the errors that belong to `undercity-core`
//! itself: recovery-state corruption and input-validation failures that can
//! occur at any interface boundary.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while reading or mutating persisted recovery state.
#[derive(Debug, Error)]
pub enum RecoveryError {
    /// The recovery-state file exists but could not be parsed.
    #[error("recovery state at {path} is corrupted: {detail}")]
    Corrupted {
        /// Path to the offending file.
        path: PathBuf,
        /// Parse error detail.
        detail: String,
    },

    /// A task status transition was requested that the state machine does
    /// not recognize (unknown `taskId`).
    #[error("unknown task `{task_id}` in recovery state for batch `{batch_id}`")]
    UnknownTask {
        /// The batch being updated.
        batch_id: String,
        /// The task id that was not found.
        task_id: String,
    },

    /// An I/O error occurred while reading or writing persisted state.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Structural-validation failures at an interface boundary (oversized
/// command output, malformed lines, merge-conflict markers leaking into a
/// diff that is about to be applied).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InvalidInputError {
    /// The input exceeded the configured size limit.
    #[error("input of {actual} bytes exceeds the {limit}-byte limit")]
    TooLarge {
        /// The limit that was exceeded.
        limit: usize,
        /// The actual observed size.
        actual: usize,
    },

    /// The input contained unresolved merge-conflict markers.
    #[error("input contains unresolved merge-conflict markers ({marker})")]
    ConflictMarkers {
        /// Which marker was found (`<<<<<<<`, `=======`, or `>>>>>>>`).
        marker: &'static str,
    },
}

/// The three canonical git conflict markers. Any of these appearing in a
/// diff or patch about to be committed indicates an unresolved conflict.
pub const CONFLICT_MARKERS: [&str; 3] = ["<<<<<<<", "=======", ">>>>>>>"];

/// Reject input over `max_bytes`, without regard to its content.
///
/// Split out from [`validate_text_input`] for boundaries that legitimately
/// see conflict markers in clean input (e.g. an in-progress rebase's
/// conflicted file content) and only want the size half of the check.
///
/// # Errors
/// Returns [`InvalidInputError::TooLarge`].
pub fn validate_output_size(input: &str, max_bytes: usize) -> Result<(), InvalidInputError> {
    if input.len() > max_bytes {
        return Err(InvalidInputError::TooLarge {
            limit: max_bytes,
            actual: input.len(),
        });
    }
    Ok(())
}

/// Reject inputs over `max_bytes`, or containing conflict markers.
///
/// # Errors
/// Returns [`InvalidInputError::TooLarge`] or
/// [`InvalidInputError::ConflictMarkers`].
pub fn validate_text_input(input: &str, max_bytes: usize) -> Result<(), InvalidInputError> {
    validate_output_size(input, max_bytes)?;
    for marker in CONFLICT_MARKERS {
        if input.contains(marker) {
            return Err(InvalidInputError::ConflictMarkers { marker });
        }
    }
    Ok(())
}
