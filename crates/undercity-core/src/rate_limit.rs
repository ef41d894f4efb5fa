//! `RateLimitController` — accounts token consumption against rolling
//! 5-hour and weekly budgets, pauses dispatch when budgets are near
//! exhausted or after explicit provider rate-limit hits, and auto-resumes
//! once enough time has passed.

use std::sync::Mutex;

use tracing::{info, warn};

use crate::config::RateLimitConfig;
use crate::model::rate_limit::{PauseState, RateLimitHit, RateLimitState, TaskUsage, UsageSummary};
use crate::model::task::TaskId;

const FIVE_HOURS_MS: i64 = 5 * 60 * 60 * 1000;
const ONE_WEEK_MS: i64 = 7 * 24 * 60 * 60 * 1000;

/// Serializes all token accounting and pause-state mutation behind one
/// owner, per §3 ("RateLimitState is shared-read, single-writer").
pub struct RateLimitController {
    config: RateLimitConfig,
    state: Mutex<RateLimitState>,
    now_ms: fn() -> i64,
}

impl RateLimitController {
    /// Build a controller from `config`, starting with empty usage history
    /// and no pause.
    #[must_use]
    pub fn new(config: RateLimitConfig, now_ms: fn() -> i64) -> Self {
        Self {
            config,
            state: Mutex::new(RateLimitState::default()),
            now_ms,
        }
    }

    /// Restore a controller from previously persisted state.
    #[must_use]
    pub fn from_state(config: RateLimitConfig, state: RateLimitState, now_ms: fn() -> i64) -> Self {
        Self {
            config,
            state: Mutex::new(state),
            now_ms,
        }
    }

    fn multiplier(&self, model: &str) -> f64 {
        self.config
            .token_multipliers
            .get(model)
            .copied()
            .unwrap_or(1.0)
    }

    fn weighted_tokens(&self, usage: &TaskUsage) -> f64 {
        (usage.input_tokens + usage.output_tokens) as f64 * self.multiplier(&usage.model)
    }

    fn windowed_total(&self, state: &RateLimitState, window_ms: i64, now: i64) -> f64 {
        state
            .tasks
            .iter()
            .filter(|u| now - u.at <= window_ms)
            .map(|u| self.weighted_tokens(u))
            .sum()
    }

    /// Append a task's usage. If either rolling window would then exceed
    /// its budget, enter (or extend) a pause whose `resume_at` is the
    /// earliest moment that window re-enters budget.
    ///
    /// Recording usage is always permitted, even while already paused
    /// (§8 invariant 7).
    ///
    /// # Panics
    /// Panics if the internal mutex is poisoned.
    pub fn record_task(
        &self,
        task_id: TaskId,
        model: impl Into<String>,
        input_tokens: u64,
        output_tokens: u64,
        duration_ms: u64,
    ) {
        let now = (self.now_ms)();
        let mut state = self.state.lock().unwrap();
        let usage = TaskUsage {
            task_id,
            model: model.into(),
            input_tokens,
            output_tokens,
            at: now,
            duration_ms,
        };
        state.tasks.push(usage);

        let five_hour_total = self.windowed_total(&state, FIVE_HOURS_MS, now);
        let weekly_total = self.windowed_total(&state, ONE_WEEK_MS, now);

        let five_hour_over = five_hour_total > self.config.max_tokens_per_5_hours as f64;
        let weekly_over = weekly_total > self.config.max_tokens_per_week as f64;

        if five_hour_over || weekly_over {
            // See DESIGN.md for the resolved Open Question on precedence
            // when both windows trip simultaneously: we resume at the
            // later of the two resume times, since dispatch must stay
            // paused until *both* windows are back in budget.
            let mut resume_at = now;
            if five_hour_over {
                resume_at = resume_at.max(self.earliest_resume(&state, FIVE_HOURS_MS, now));
            }
            if weekly_over {
                resume_at = resume_at.max(self.earliest_resume(&state, ONE_WEEK_MS, now));
            }
            let reason = match (five_hour_over, weekly_over) {
                (true, true) => "5-hour and weekly token budgets exceeded",
                (true, false) => "5-hour token budget exceeded",
                (false, true) => "weekly token budget exceeded",
                (false, false) => unreachable!(),
            };
            warn!(reason, resume_at, "rate limit pause entered");
            state.pause = PauseState {
                is_paused: true,
                reason: Some(reason.to_owned()),
                resume_at: Some(resume_at),
            };
        }
    }

    /// Earliest time at which the total within `window_ms` (as of `now`)
    /// would drop back under budget: the moment the oldest entry still in
    /// the window ages out of it. A conservative estimate — it does not
    /// attempt to find the *first* instant a partial drop clears budget,
    /// only the point at which the window's composition next changes.
    fn earliest_resume(&self, state: &RateLimitState, window_ms: i64, now: i64) -> i64 {
        let oldest_in_window = state
            .tasks
            .iter()
            .filter(|u| now - u.at <= window_ms)
            .map(|u| u.at)
            .min();
        oldest_in_window.map_or(now, |oldest| oldest + window_ms + 1)
    }

    /// Record an explicit provider rate-limit rejection and enter a pause
    /// with at least the configured minimum cool-off (extending, never
    /// shortening, any pause already in force).
    ///
    /// # Panics
    /// Panics if the internal mutex is poisoned.
    pub fn record_rate_limit_hit(&self, model: impl Into<String>, message: Option<String>) {
        let now = (self.now_ms)();
        let mut state = self.state.lock().unwrap();
        state.rate_limit_hits.push(RateLimitHit {
            model: model.into(),
            at: now,
            message,
        });

        let min_resume = now + i64::try_from(self.config.min_cooloff_ms).unwrap_or(i64::MAX);
        let resume_at = state
            .pause
            .resume_at
            .map_or(min_resume, |existing| existing.max(min_resume));

        info!(resume_at, "rate limit hit recorded, pausing dispatch");
        state.pause = PauseState {
            is_paused: true,
            reason: Some("explicit provider rate-limit hit".to_owned()),
            resume_at: Some(resume_at),
        };
    }

    /// If paused and `now >= resume_at`, clear the pause.
    ///
    /// # Panics
    /// Panics if the internal mutex is poisoned.
    pub fn check_auto_resume(&self) {
        let now = (self.now_ms)();
        let mut state = self.state.lock().unwrap();
        if state.pause.is_paused {
            if let Some(resume_at) = state.pause.resume_at {
                if now >= resume_at {
                    info!("rate limit pause lifted");
                    state.pause = PauseState::default();
                }
            }
        }
    }

    /// Whether dispatch is currently suspended.
    ///
    /// # Panics
    /// Panics if the internal mutex is poisoned.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.state.lock().unwrap().pause.is_paused
    }

    /// Snapshot of the current pause state.
    ///
    /// # Panics
    /// Panics if the internal mutex is poisoned.
    #[must_use]
    pub fn get_pause_state(&self) -> PauseState {
        self.state.lock().unwrap().pause.clone()
    }

    /// Snapshot usage as a fraction of each budget.
    ///
    /// # Panics
    /// Panics if the internal mutex is poisoned.
    #[must_use]
    pub fn get_usage_summary(&self) -> UsageSummary {
        let now = (self.now_ms)();
        let state = self.state.lock().unwrap();
        UsageSummary {
            five_hour: self.windowed_total(&state, FIVE_HOURS_MS, now)
                / self.config.max_tokens_per_5_hours as f64,
            weekly: self.windowed_total(&state, ONE_WEEK_MS, now)
                / self.config.max_tokens_per_week as f64,
        }
    }

    /// Snapshot full state for persistence.
    ///
    /// # Panics
    /// Panics if the internal mutex is poisoned.
    #[must_use]
    pub fn get_state(&self) -> RateLimitState {
        self.state.lock().unwrap().clone()
    }

    /// Drop usage entries older than the weekly window, to bound memory
    /// and file size over a long-running orchestrator.
    ///
    /// # Panics
    /// Panics if the internal mutex is poisoned.
    pub fn gc_old_usage(&self) {
        let now = (self.now_ms)();
        let mut state = self.state.lock().unwrap();
        state.tasks.retain(|u| now - u.at <= ONE_WEEK_MS);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clock() -> i64 {
        1_700_000_000_000
    }

    fn small_budget_config() -> RateLimitConfig {
        RateLimitConfig {
            max_tokens_per_5_hours: 1_000,
            max_tokens_per_week: 5_000,
            warning_threshold: 0.8,
            min_cooloff_ms: 60_000,
            token_multipliers: std::collections::BTreeMap::new(),
        }
    }

    #[test]
    fn recording_under_budget_does_not_pause() {
        let ctl = RateLimitController::new(small_budget_config(), clock);
        ctl.record_task(TaskId::from("t1"), "opus", 100, 100, 500);
        assert!(!ctl.is_paused());
    }

    #[test]
    fn exceeding_five_hour_budget_pauses() {
        let ctl = RateLimitController::new(small_budget_config(), clock);
        ctl.record_task(TaskId::from("t1"), "opus", 600, 600, 500);
        assert!(ctl.is_paused());
        assert!(ctl.get_pause_state().resume_at.unwrap() > clock());
    }

    #[test]
    fn recording_is_permitted_while_paused() {
        let ctl = RateLimitController::new(small_budget_config(), clock);
        ctl.record_task(TaskId::from("t1"), "opus", 600, 600, 500);
        assert!(ctl.is_paused());
        // Still permitted per spec invariant 7.
        ctl.record_task(TaskId::from("t2"), "opus", 10, 10, 500);
        assert!(ctl.is_paused());
    }

    #[test]
    fn cheap_model_multiplier_reduces_weighted_usage() {
        let mut cfg = small_budget_config();
        cfg.token_multipliers.insert("haiku".to_owned(), 0.1);
        let ctl = RateLimitController::new(cfg, clock);
        ctl.record_task(TaskId::from("t1"), "haiku", 5000, 5000, 500);
        // 10000 raw * 0.1 = 1000, exactly at budget, not over.
        assert!(!ctl.is_paused());
    }

    #[test]
    fn unknown_model_defaults_to_multiplier_one() {
        let ctl = RateLimitController::new(small_budget_config(), clock);
        ctl.record_task(TaskId::from("t1"), "some-new-model", 600, 600, 500);
        assert!(ctl.is_paused());
    }

    #[test]
    fn rate_limit_hit_pauses_with_min_cooloff() {
        let ctl = RateLimitController::new(small_budget_config(), clock);
        ctl.record_rate_limit_hit("opus", Some("429".to_owned()));
        assert!(ctl.is_paused());
        assert_eq!(ctl.get_pause_state().resume_at, Some(clock() + 60_000));
    }

    #[test]
    fn auto_resume_clears_pause_once_due() {
        let ctl = RateLimitController::new(small_budget_config(), clock);
        ctl.record_rate_limit_hit("opus", None);
        assert!(ctl.is_paused());

        // Simulate time passing by constructing a controller whose clock
        // has advanced past resume_at, reusing the persisted state.
        let advanced_clock: fn() -> i64 = || 1_700_000_120_000;
        let state = ctl.get_state();
        let ctl2 = RateLimitController::from_state(small_budget_config(), state, advanced_clock);
        ctl2.check_auto_resume();
        assert!(!ctl2.is_paused());
    }

    #[test]
    fn auto_resume_is_noop_before_due() {
        let ctl = RateLimitController::new(small_budget_config(), clock);
        ctl.record_rate_limit_hit("opus", None);
        ctl.check_auto_resume();
        assert!(ctl.is_paused());
    }

    #[test]
    fn state_round_trips() {
        let ctl = RateLimitController::new(small_budget_config(), clock);
        ctl.record_task(TaskId::from("t1"), "opus", 10, 10, 500);
        let state = ctl.get_state();
        let json = serde_json::to_string(&state).unwrap();
        let restored: RateLimitState = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, state);
    }

    #[test]
    fn gc_drops_entries_older_than_a_week() {
        let ctl = RateLimitController::new(small_budget_config(), clock);
        ctl.record_task(TaskId::from("old"), "opus", 1, 1, 1);
        {
            let mut state = ctl.state.lock().unwrap();
            state.tasks[0].at = clock() - ONE_WEEK_MS - 1;
        }
        ctl.gc_old_usage();
        assert!(ctl.get_state().tasks.is_empty());
    }

    proptest::proptest! {
        /// For any sequence of same-model recordings, the controller is
        /// paused exactly when cumulative raw usage has crossed the
        /// 5-hour budget — recording itself never under- or over-counts.
        #[test]
        fn pauses_iff_cumulative_usage_exceeds_budget(amounts in proptest::collection::vec(1u64..200, 1..20)) {
            let ctl = RateLimitController::new(small_budget_config(), clock);
            let mut total = 0u64;
            for (i, amount) in amounts.iter().enumerate() {
                total += amount;
                ctl.record_task(TaskId::from(format!("t{i}")), "opus", *amount, 0, 10);
                proptest::prop_assert_eq!(ctl.is_paused(), total > small_budget_config().max_tokens_per_5_hours);
            }
        }
    }
}
