//! Orchestrator configuration (`.undercity/config.toml`).
//!
//! Parsed from TOML; every field has a default, and unknown fields are
//! rejected so a typo in the config file surfaces immediately instead of
//! silently doing nothing.

use std::fmt;
use std::path::Path;

use serde::Deserialize;

/// Top-level orchestrator configuration.
///
/// Missing file → all defaults, never an error.
#[derive(Clone, Debug, PartialEq, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct OrchestratorConfig {
    /// Repository-level settings.
    #[serde(default)]
    pub repo: RepoConfig,

    /// Scheduler settings.
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Rate-limit accounting settings.
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Health-monitor settings.
    #[serde(default)]
    pub health: HealthConfig,

    /// Merge-pipeline settings.
    #[serde(default)]
    pub merge: MergeConfig,

    /// Interface-boundary validation settings.
    #[serde(default)]
    pub validation: ValidationConfig,
}

impl OrchestratorConfig {
    /// Load configuration from `path`, falling back to all defaults if the
    /// file does not exist.
    ///
    /// # Errors
    /// Returns a [`ConfigError`] if the file exists but is not valid TOML,
    /// or a TOML file with fields that do not match the schema.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => {
                return Err(ConfigError {
                    path: path.to_path_buf(),
                    message: e.to_string(),
                });
            }
        };
        toml::from_str(&contents).map_err(|e| ConfigError {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }
}

/// A configuration file could not be loaded or parsed.
#[derive(Clone, Debug)]
pub struct ConfigError {
    /// Path to the configuration file.
    pub path: std::path::PathBuf,
    /// Human-readable description of the problem.
    pub message: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "configuration error in '{}': {}", self.path.display(), self.message)
    }
}

impl std::error::Error for ConfigError {}

/// Repository-level settings.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RepoConfig {
    /// The canonical integration branch name (default: `"main"`).
    #[serde(default = "default_main_branch")]
    pub main_branch: String,

    /// Name of the state directory, relative to the repository root
    /// (default: `".undercity"`).
    #[serde(default = "default_state_dir")]
    pub state_dir: String,
}

impl Default for RepoConfig {
    fn default() -> Self {
        Self {
            main_branch: default_main_branch(),
            state_dir: default_state_dir(),
        }
    }
}

fn default_main_branch() -> String {
    "main".to_owned()
}

fn default_state_dir() -> String {
    ".undercity".to_owned()
}

/// Scheduler / batch-executor settings.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SchedulerConfig {
    /// Maximum number of tasks run concurrently within one sub-batch.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
        }
    }
}

const fn default_max_concurrent() -> usize {
    4
}

/// Rate-limit / token-budget settings.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimitConfig {
    /// Token budget for any rolling 5-hour window.
    #[serde(default = "default_five_hour_budget")]
    pub max_tokens_per_5_hours: u64,

    /// Token budget for any rolling weekly window.
    #[serde(default = "default_weekly_budget")]
    pub max_tokens_per_week: u64,

    /// Fraction of a budget (in `[0, 1]`) at which usage summaries start
    /// reporting a warning-level percentage.
    #[serde(default = "default_warning_threshold")]
    pub warning_threshold: f64,

    /// Minimum cool-off, in milliseconds, after an explicit rate-limit hit.
    #[serde(default = "default_min_cooloff_ms")]
    pub min_cooloff_ms: u64,

    /// Per-model token multipliers (cheap models consume budget
    /// sub-linearly). Unknown model names default to `1.0` — see
    /// DESIGN.md for the Open Question this resolves.
    #[serde(default)]
    pub token_multipliers: std::collections::BTreeMap<String, f64>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_tokens_per_5_hours: default_five_hour_budget(),
            max_tokens_per_week: default_weekly_budget(),
            warning_threshold: default_warning_threshold(),
            min_cooloff_ms: default_min_cooloff_ms(),
            token_multipliers: std::collections::BTreeMap::new(),
        }
    }
}

const fn default_five_hour_budget() -> u64 {
    1_000_000
}

const fn default_weekly_budget() -> u64 {
    10_000_000
}

const fn default_warning_threshold() -> f64 {
    0.8
}

const fn default_min_cooloff_ms() -> u64 {
    60_000
}

/// Health-monitor settings.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HealthConfig {
    /// How often the monitor sweeps active tasks, in milliseconds.
    #[serde(default = "default_health_interval_ms")]
    pub interval_ms: u64,

    /// How long a checkpoint may go stale before a worker is "stuck".
    #[serde(default = "default_stuck_threshold_ms")]
    pub stuck_threshold_ms: u64,

    /// How many nudges the monitor writes before giving up on a worker.
    #[serde(default = "default_max_recovery_attempts")]
    pub max_recovery_attempts: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_health_interval_ms(),
            stuck_threshold_ms: default_stuck_threshold_ms(),
            max_recovery_attempts: default_max_recovery_attempts(),
        }
    }
}

const fn default_health_interval_ms() -> u64 {
    60_000
}

const fn default_stuck_threshold_ms() -> u64 {
    300_000
}

const fn default_max_recovery_attempts() -> u32 {
    2
}

/// Merge-pipeline settings.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MergeConfig {
    /// How many times post-rebase verification may be retried with a fix
    /// applied before giving up.
    #[serde(default = "default_max_merge_fix_attempts")]
    pub max_merge_fix_attempts: u32,

    /// What to do when all fix attempts are exhausted.
    #[serde(default)]
    pub on_failure: OnFailure,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            max_merge_fix_attempts: default_max_merge_fix_attempts(),
            on_failure: OnFailure::default(),
        }
    }
}

const fn default_max_merge_fix_attempts() -> u32 {
    2
}

/// What the merge pipeline does when verification cannot be fixed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OnFailure {
    /// Report `verification_failed` and leave the branch for manual cleanup.
    #[default]
    Fail,
    /// Report `verification_failed` but also preserve the candidate commit
    /// in a quarantine workspace for later inspection.
    Quarantine,
}

/// Interface-boundary validation settings.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ValidationConfig {
    /// Maximum size, in bytes, of any single captured command output or
    /// diff passed across an interface boundary.
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            max_output_bytes: default_max_output_bytes(),
        }
    }
}

const fn default_max_output_bytes() -> usize {
    10 * 1024 * 1024
}
