//! Token-accounting and rate-limit-pause data types.

use serde::{Deserialize, Serialize};

use crate::model::task::TaskId;

/// One task's recorded token usage.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskUsage {
    /// The task this usage is attributed to.
    pub task_id: TaskId,
    /// The model that was invoked.
    pub model: String,
    /// Prompt tokens consumed.
    pub input_tokens: u64,
    /// Completion tokens consumed.
    pub output_tokens: u64,
    /// When the usage was recorded, milliseconds since the Unix epoch.
    pub at: i64,
    /// Wall-clock duration of the invocation, in milliseconds.
    pub duration_ms: u64,
}

/// A recorded explicit rate-limit rejection from the model provider.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RateLimitHit {
    /// The model that was rejected.
    pub model: String,
    /// When the hit was recorded, milliseconds since the Unix epoch.
    pub at: i64,
    /// Optional provider-supplied message.
    #[serde(default)]
    pub message: Option<String>,
}

/// Current pause state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Default)]
pub struct PauseState {
    /// Whether dispatch is currently suspended.
    pub is_paused: bool,
    /// Why, if paused.
    #[serde(default)]
    pub reason: Option<String>,
    /// When the pause is expected to lift, milliseconds since the Unix
    /// epoch.
    #[serde(default)]
    pub resume_at: Option<i64>,
}

/// Persisted rate-limit controller state (`rate-limit-state.json`).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Default)]
pub struct RateLimitState {
    /// Every recorded task usage, oldest first.
    #[serde(default)]
    pub tasks: Vec<TaskUsage>,
    /// Every recorded explicit rate-limit hit, oldest first.
    #[serde(default)]
    pub rate_limit_hits: Vec<RateLimitHit>,
    /// Current pause state.
    #[serde(default)]
    pub pause: PauseState,
}

/// A usage-summary snapshot for display/telemetry.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct UsageSummary {
    /// Fraction (may exceed `1.0`) of the 5-hour budget consumed.
    pub five_hour: f64,
    /// Fraction (may exceed `1.0`) of the weekly budget consumed.
    pub weekly: f64,
}
