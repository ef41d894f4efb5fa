//! `undercity` — a parallel multi-agent task orchestrator: batches
//! isolated git worktree workers, detects file and semantic conflicts
//! between them, and serially rebases-and-merges successful results back
//! into the main branch.
//!
//! This crate is a thin re-export over the workspace's individually
//! publishable crates, each scoped to one concern:
//!
//! - [`undercity_core`] — data model, configuration, rate limiting,
//!   crash-recovery state. No git or process I/O.
//! - [`undercity_git`] — subprocess-only git backend.
//! - [`undercity_workspace`] — per-task git worktree isolation.
//! - [`undercity_merge`] — serial rebase-and-merge pipeline.
//! - [`undercity_scheduler`] — the batch executor, health monitor, and
//!   doctor self-check tying the others together.

pub use undercity_core as core;
pub use undercity_git as git;
pub use undercity_merge as merge;
pub use undercity_scheduler as scheduler;
pub use undercity_workspace as workspace;

pub use undercity_core::config::OrchestratorConfig;
pub use undercity_core::recovery::RecoveryStateMachine;
pub use undercity_merge::{MergeOutcome, MergePipeline, MergeTask};
pub use undercity_scheduler::{AgentRunner, BatchResult, BatchTaskOutcome, ResultHandler, Scheduler};
pub use undercity_workspace::WorkspaceManager;
