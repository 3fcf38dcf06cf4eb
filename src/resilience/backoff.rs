//! Linear backoff with jitter for repeatedly failing loop iterations.

use std::time::Duration;

use rand::Rng;

use crate::config::EventLoopConfig;

/// Calculate linear backoff delay with jitter.
///
/// `overdraft` is how many failures exceeded the budget; each adds `step_ms`.
pub fn calculate_backoff(overdraft: u32, step_ms: u64, max_ms: u64) -> Duration {
    if overdraft == 0 {
        return Duration::from_millis(0);
    }

    let delay_ms = step_ms.saturating_mul(u64::from(overdraft));
    let capped_delay = delay_ms.min(max_ms);

    // Apply jitter (0 to 10% of the delay)
    let jitter_range = capped_delay / 10;
    let jitter = if jitter_range > 0 {
        rand::thread_rng().gen_range(0..jitter_range)
    } else {
        0
    };

    Duration::from_millis(capped_delay + jitter)
}

/// Failure budget for the event loop.
///
/// Failures are free until the budget is spent; after that every further
/// consecutive failure asks for a longer pause. One success restores the
/// full budget.
#[derive(Debug, Clone)]
pub struct ErrorThrottle {
    budget: u32,
    failures: u32,
    step_ms: u64,
    max_ms: u64,
}

impl ErrorThrottle {
    pub fn new(budget: u32, step_ms: u64, max_ms: u64) -> Self {
        Self {
            budget,
            failures: 0,
            step_ms,
            max_ms,
        }
    }

    pub fn from_config(config: &EventLoopConfig) -> Self {
        Self::new(config.error_budget, config.backoff_step_ms, config.max_backoff_ms)
    }

    /// Record a successful iteration.
    pub fn success(&mut self) {
        self.failures = 0;
    }

    /// Record a failed iteration, returning how long to pause, if at all.
    pub fn failure(&mut self) -> Option<Duration> {
        self.failures = self.failures.saturating_add(1);
        let overdraft = self.failures.saturating_sub(self.budget.saturating_sub(1));
        match overdraft {
            0 => None,
            n => Some(calculate_backoff(n, self.step_ms, self.max_ms)),
        }
    }

    /// Consecutive failures recorded so far.
    pub fn failures(&self) -> u32 {
        self.failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_calculation() {
        let b1 = calculate_backoff(1, 100, 2000);
        assert!(b1.as_millis() >= 100 && b1.as_millis() < 110);

        let b2 = calculate_backoff(2, 100, 2000);
        assert!(b2.as_millis() >= 200);

        let max = calculate_backoff(50, 100, 1000);
        assert!(max.as_millis() >= 1000 && max.as_millis() < 1100);

        assert_eq!(calculate_backoff(0, 100, 1000), Duration::ZERO);
    }

    #[test]
    fn budget_absorbs_early_failures() {
        let mut throttle = ErrorThrottle::new(3, 1000, 30_000);
        assert_eq!(throttle.failure(), None);
        assert_eq!(throttle.failure(), None);

        let first = throttle.failure().unwrap();
        assert!(first >= Duration::from_millis(1000));
        let second = throttle.failure().unwrap();
        assert!(second >= Duration::from_millis(2000));
    }

    #[test]
    fn success_restores_budget() {
        let mut throttle = ErrorThrottle::new(2, 10, 100);
        throttle.failure();
        assert!(throttle.failure().is_some());
        throttle.success();
        assert_eq!(throttle.failures(), 0);
        assert_eq!(throttle.failure(), None);
    }
}
