//! Retry and dead-letter policy.
//!
//! Backoff uses a fixed ascending schedule; any attempt beyond the schedule's
//! length reuses the last entry. `attempts` is incremented at claim time, so
//! the delay for the N-th failure is `schedule[min(N - 1, len - 1)]`.

use std::time::Duration;

/// Default schedule: 30s, 2m, 8m.
pub const DEFAULT_BACKOFF_SECS: [u64; 3] = [30, 120, 480];

/// Fixed ascending backoff schedule.
#[derive(Debug, Clone)]
pub struct BackoffSchedule {
    steps: Vec<Duration>,
}

impl Default for BackoffSchedule {
    fn default() -> Self {
        Self::new(DEFAULT_BACKOFF_SECS.iter().map(|s| Duration::from_secs(*s)))
    }
}

impl BackoffSchedule {
    /// Build a schedule from explicit steps. Empty input falls back to the default.
    pub fn new(steps: impl IntoIterator<Item = Duration>) -> Self {
        let steps: Vec<Duration> = steps.into_iter().collect();
        if steps.is_empty() {
            return Self::default();
        }
        Self { steps }
    }

    /// Delay before the next claim after failure number `attempt` (1-indexed,
    /// post-claim). Attempts beyond the schedule reuse the last entry.
    pub fn delay_for_attempt(&self, attempt: i32) -> Duration {
        let idx = (attempt.max(1) as usize - 1).min(self.steps.len() - 1);
        self.steps[idx]
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }
}

/// What to do with a job after a retryable failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Park the job for `backoff`, then it becomes claimable again.
    Retry { backoff: Duration },
    /// Attempts exhausted: dead-letter.
    Exhausted,
}

/// Decide between another retry and dead-lettering.
///
/// `attempts` is the post-claim count for the attempt that just failed.
pub fn dispose_retryable(attempts: i32, max_attempts: i32, schedule: &BackoffSchedule) -> Disposition {
    if attempts >= max_attempts {
        Disposition::Exhausted
    } else {
        Disposition::Retry {
            backoff: schedule.delay_for_attempt(attempts),
        }
    }
}
