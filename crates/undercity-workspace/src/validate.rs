//! Restricted character-set validation for task ids before they become
//! path or branch name components.

use crate::error::WorkspaceError;

/// `task_id` must consist only of letters, digits, `-`, `_`, `.` — the
/// same constraint every path/branch built from it inherits, so it must
/// be checked once here rather than re-derived at each call site.
pub fn validate_task_id(task_id: &str) -> Result<(), WorkspaceError> {
    let ok = !task_id.is_empty()
        && task_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if ok {
        Ok(())
    } else {
        Err(WorkspaceError::InvalidTaskId {
            task_id: task_id.to_owned(),
        })
    }
}
