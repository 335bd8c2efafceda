//! Soft runtime budget for cron-style workers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::clock::SharedClock;

/// Budget used when a worker does not pick its own.
pub const DEFAULT_MAX_RUNTIME: Duration = Duration::from_secs(200);

/// Tracks elapsed time against a maximum duration.
///
/// The limiter never interrupts anything. Callers poll [`over_time`] between
/// units of work and stop on their own when it returns `true`.
///
/// [`over_time`]: RuntimeLimiter::over_time
#[derive(Debug)]
pub struct RuntimeLimiter {
    clock: SharedClock,
    start: Duration,
    max_runtime: Duration,
    last_check: AtomicBool,
}

impl RuntimeLimiter {
    pub fn new(max_runtime: Duration, clock: SharedClock) -> Self {
        let start = clock.monotonic();
        Self {
            clock,
            start,
            max_runtime,
            last_check: AtomicBool::new(false),
        }
    }

    pub fn with_default_budget(clock: SharedClock) -> Self {
        Self::new(DEFAULT_MAX_RUNTIME, clock)
    }

    pub fn max_runtime(&self) -> Duration {
        self.max_runtime
    }

    pub fn elapsed_time(&self) -> Duration {
        self.clock.monotonic().saturating_sub(self.start)
    }

    /// True once elapsed time has reached the budget. The answer is
    /// remembered for [`was_over_time`](Self::was_over_time).
    pub fn over_time(&self) -> bool {
        let over = self.elapsed_time() >= self.max_runtime;
        self.last_check.store(over, Ordering::Relaxed);
        over
    }

    /// Result of the most recent [`over_time`](Self::over_time) call, without
    /// reading the clock again. False if it was never called.
    pub fn was_over_time(&self) -> bool {
        self.last_check.load(Ordering::Relaxed)
    }

    pub fn usage(&self) -> RuntimeUsage {
        RuntimeUsage {
            elapsed_seconds: self.elapsed_time().as_secs_f64(),
            max_runtime_seconds: self.max_runtime.as_secs_f64(),
            over_time: self.was_over_time(),
        }
    }
}

/// Serializable snapshot of a limiter, attached to worker reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeUsage {
    pub elapsed_seconds: f64,
    pub max_runtime_seconds: f64,
    pub over_time: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::Utc;

    fn budgeted(budget_secs: u64) -> (ManualClock, RuntimeLimiter) {
        let clock = ManualClock::new(Utc::now());
        let limiter = RuntimeLimiter::new(Duration::from_secs(budget_secs), clock.shared());
        (clock, limiter)
    }

    #[test]
    fn starts_with_zero_elapsed() {
        let (_clock, limiter) = budgeted(10);
        assert_eq!(limiter.elapsed_time(), Duration::ZERO);
        assert!(!limiter.over_time());
    }

    #[test]
    fn over_time_exactly_at_budget() {
        let (clock, limiter) = budgeted(10);

        clock.advance(Duration::from_millis(9_999));
        assert!(!limiter.over_time());

        clock.advance(Duration::from_millis(1));
        assert!(limiter.over_time());
    }

    #[test]
    fn predicate_matches_elapsed_ge_budget() {
        for budget in [0u64, 1, 5, 250] {
            for elapsed in [0u64, 1, 4, 5, 6, 249, 250, 251] {
                let (clock, limiter) = budgeted(budget);
                clock.advance(Duration::from_secs(elapsed));
                assert_eq!(
                    limiter.over_time(),
                    elapsed >= budget,
                    "budget={budget} elapsed={elapsed}"
                );
            }
        }
    }

    #[test]
    fn was_over_time_remembers_last_check() {
        let (clock, limiter) = budgeted(5);
        assert!(!limiter.was_over_time());

        clock.advance(Duration::from_secs(6));
        // Not checked yet, so nothing recorded.
        assert!(!limiter.was_over_time());

        assert!(limiter.over_time());
        assert!(limiter.was_over_time());
    }

    #[test]
    fn zero_budget_is_immediately_over() {
        let (_clock, limiter) = budgeted(0);
        assert!(limiter.over_time());
    }

    #[test]
    fn default_budget_is_200_seconds() {
        let clock = ManualClock::new(Utc::now());
        let limiter = RuntimeLimiter::with_default_budget(clock.shared());
        assert_eq!(limiter.max_runtime(), Duration::from_secs(200));
    }

    #[test]
    fn usage_serializes_with_snake_case_fields() {
        let (clock, limiter) = budgeted(2);
        clock.advance(Duration::from_secs(3));
        limiter.over_time();

        let json = serde_json::to_value(limiter.usage()).unwrap();
        assert_eq!(json["elapsed_seconds"], 3.0);
        assert_eq!(json["max_runtime_seconds"], 2.0);
        assert_eq!(json["over_time"], true);
    }
}
