//! File-touch records and conflict descriptions.
//!
//! These are the shapes the [`crate::file_tracker::FileTracker`] owns and
//! persists; the types themselves carry no behavior.

use serde::{Deserialize, Serialize};

use crate::model::task::TaskId;

/// A single file operation attributed to an agent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileOperation {
    /// The agent read the file.
    Read,
    /// The agent wrote the file (full overwrite).
    Write,
    /// The agent made a targeted edit to the file.
    Edit,
    /// The agent deleted the file.
    Delete,
}

impl FileOperation {
    /// `true` for operations that can conflict with another agent's
    /// simultaneous write-class touch on the same path.
    #[must_use]
    pub const fn is_write_class(self) -> bool {
        matches!(self, Self::Write | Self::Edit | Self::Delete)
    }
}

/// One recorded file access, with its path already normalized relative to
/// the repository root.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileTouch {
    /// Repository-root-relative path.
    pub path: String,
    /// What kind of access this was.
    pub operation: FileOperation,
    /// When the touch was recorded, milliseconds since the Unix epoch.
    pub timestamp: i64,
}

/// A single agent's append-only log of file touches for the lifetime of one
/// workspace execution.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileTrackingEntry {
    /// The agent that owns this entry.
    pub agent_id: String,
    /// The task the agent is working on.
    pub task_id: Option<TaskId>,
    /// The session this entry belongs to (used for bulk cleanup).
    pub session_id: String,
    /// When tracking started, milliseconds since the Unix epoch.
    pub started_at: i64,
    /// When tracking was sealed (`StopTracking`), if ever.
    pub ended_at: Option<i64>,
    /// Ordered file touches.
    pub files: Vec<FileTouch>,
}

impl FileTrackingEntry {
    /// An entry is "active" — and thus eligible to participate in conflict
    /// detection — until it has been sealed.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.ended_at.is_none()
    }
}

/// One touch contributing to a [`FileConflict`], identifying who touched
/// the path and how.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictingTouch {
    /// The agent that made the touch.
    pub agent_id: String,
    /// The task the agent was working on.
    pub task_id: Option<TaskId>,
    /// The operation performed.
    pub operation: FileOperation,
    /// When the touch happened, milliseconds since the Unix epoch.
    pub timestamp: i64,
}

/// Two or more active agents have write-class touches on the same
/// normalized path.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileConflict {
    /// The contended path.
    pub path: String,
    /// Every write-class touch on `path`, across all contending agents.
    pub touched_by: Vec<ConflictingTouch>,
}

/// The kind of symbol a [`SemanticConflict`] concerns.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SymbolKind {
    /// A free function.
    Function,
    /// A class.
    Class,
    /// An interface.
    Interface,
    /// A type alias.
    Type,
    /// A constant.
    Const,
    /// An enum.
    Enum,
}

/// How severe a [`SemanticConflict`] is, based on how many agents are
/// contending for the same exported symbol.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictSeverity {
    /// Informational: a symbol is touched by exactly... fewer than the
    /// normal contention threshold (reserved for future stricter modes).
    Warning,
    /// Two agents are touching files exporting the same symbol.
    Error,
    /// Three or more agents are touching files exporting the same symbol.
    Critical,
}

impl ConflictSeverity {
    /// Derive severity from the number of distinct contending agents, per
    /// the normative rule in the spec: 2 agents = `error`, 3+ = `critical`.
    #[must_use]
    pub const fn for_agent_count(count: usize) -> Self {
        if count >= 3 {
            Self::Critical
        } else if count == 2 {
            Self::Error
        } else {
            Self::Warning
        }
    }
}

/// Two or more active agents modified files that export a common top-level
/// symbol.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SemanticConflict {
    /// The contended symbol's name.
    pub symbol_name: String,
    /// The contended symbol's kind.
    pub symbol_kind: SymbolKind,
    /// Every file that exports `symbol_name` and was touched by a
    /// contending agent.
    pub files: Vec<String>,
    /// The contending agents' ids.
    pub touched_by: Vec<String>,
    /// Derived severity.
    pub severity: ConflictSeverity,
}
