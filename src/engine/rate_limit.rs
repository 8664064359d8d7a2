//! Rate limit state management.
//!
//! When a backend reports a provider rate limit, the engine either waits the
//! limit out and resumes, or aborts the run, per the configured policy. This
//! module tracks the transient limit state and computes how long to wait.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How the engine reacts to a detected rate limit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RateLimitPolicy {
    /// Sleep until the reported (or a default) reset time and resume
    #[default]
    Wait,
    /// Terminate the run immediately with status `rate_limited`
    Raise,
}

/// Transient rate-limit state owned by the engine for one run.
#[derive(Debug)]
pub struct RateLimitState {
    /// Whether a limit is currently active.
    pub active: bool,
    /// Detected reset time in epoch seconds, if the provider reported one.
    pub reset_at: Option<i64>,
    /// Consecutive hits without an intervening success.
    pub consecutive_hits: u32,
    /// Total encounters over the run.
    pub encounters: u32,
    /// Cumulative wait time over the run.
    pub total_wait: Duration,
}

impl RateLimitState {
    pub fn new() -> Self {
        Self {
            active: false,
            reset_at: None,
            consecutive_hits: 0,
            encounters: 0,
            total_wait: Duration::ZERO,
        }
    }

    /// Record a rate-limit hit and compute the wait before resuming.
    ///
    /// The wait is the maximum of the provider's reset hint and an
    /// exponential backoff (2^hits seconds, capped at 64s); without a usable
    /// hint the configured default applies instead.
    pub fn record_hit(&mut self, reset_at: Option<i64>, default_backoff: Duration) -> Duration {
        self.active = true;
        self.consecutive_hits += 1;
        self.encounters += 1;
        self.reset_at = reset_at;

        let exp_backoff = Duration::from_secs(2u64.pow(self.consecutive_hits.min(6)));
        let hint = reset_at.and_then(|at| {
            let now = chrono::Utc::now().timestamp();
            (at > now).then(|| Duration::from_secs((at - now) as u64))
        });

        let wait = hint.unwrap_or(default_backoff).max(exp_backoff);
        self.total_wait += wait;

        tracing::warn!(
            wait_secs = wait.as_secs(),
            consecutive_hits = self.consecutive_hits,
            "rate limited, backing off"
        );

        wait
    }

    /// Clear the active limit after a successful call or a completed wait.
    pub fn clear(&mut self) {
        self.active = false;
        self.consecutive_hits = 0;
        self.reset_at = None;
        // encounters and total_wait are run-lifetime metrics
    }
}

impl Default for RateLimitState {
    fn default() -> Self {
        Self::new()
    }
}
