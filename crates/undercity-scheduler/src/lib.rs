//! Parallel batch executor: dispatches isolated workers, drains
//! successful ones through the merge pipeline, and watches for stuck
//! workers in between.

pub mod doctor;
pub mod error;
pub mod health;
pub mod scheduler;
pub mod traits;
pub mod worker_pool;

pub use doctor::{Check, DoctorReport};
pub use error::SchedulerError;
pub use health::{HealthAction, HealthMonitor, RunningTask, StuckReason};
pub use scheduler::{BatchResult, BatchTaskOutcome, Scheduler};
pub use traits::{AgentRunner, Decomposition, ResultHandler, RunResult, RunStatus, TokenUsage, TokenUsageAttempt};
pub use worker_pool::run_concurrent;
