//! Shared data model, persistence, and pure-logic components for the
//! orchestrator: file/semantic conflict tracking, rate limiting, and
//! crash-recovery state. No git or process I/O lives here — see
//! `undercity-git`, `undercity-workspace`, and `undercity-merge` for that.

pub mod ast_index;
pub mod atomic;
pub mod config;
pub mod error;
pub mod file_tracker;
pub mod model;
pub mod rate_limit;
pub mod recovery;

pub use ast_index::{AstIndex, ExportedSymbol, NullAstIndex};
pub use config::{ConfigError, OrchestratorConfig};
pub use error::{validate_text_input, InvalidInputError, RecoveryError, CONFLICT_MARKERS};
pub use file_tracker::FileTracker;
pub use rate_limit::RateLimitController;
pub use recovery::{PendingResume, RecoveryStateMachine, RecoverySummary, StaleWorkspaceCleaner, TaskStatusUpdate};
