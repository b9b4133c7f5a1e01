//! Bounded exponential backoff schedule
//!
//! The retry loop is specified as data (attempt counter, delay schedule,
//! terminal classification) rather than control flow, so the executor can
//! drive it with blocking sleeps today without changing observable behavior
//! if scheduling ever moves elsewhere.

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffSchedule {
    base: Duration,
    cap: Duration,
}

impl BackoffSchedule {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }

    /// Delay to wait after failed attempt `attempt` (1-based): base doubling
    /// per attempt, capped. Monotonically non-decreasing in `attempt`.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        // 2^20 * base already exceeds any sane cap; clamp the shift so the
        // multiplier cannot overflow.
        let exp = attempt.saturating_sub(1).min(20);
        self.base.saturating_mul(1u32 << exp).min(self.cap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_per_attempt() {
        let schedule = BackoffSchedule::new(Duration::from_millis(100), Duration::from_secs(60));
        assert_eq!(schedule.delay_after(1), Duration::from_millis(100));
        assert_eq!(schedule.delay_after(2), Duration::from_millis(200));
        assert_eq!(schedule.delay_after(3), Duration::from_millis(400));
        assert_eq!(schedule.delay_after(4), Duration::from_millis(800));
    }

    #[test]
    fn non_decreasing_and_capped() {
        let cap = Duration::from_secs(8);
        let schedule = BackoffSchedule::new(Duration::from_millis(500), cap);
        let mut previous = Duration::ZERO;
        for attempt in 1..=64 {
            let delay = schedule.delay_after(attempt);
            assert!(delay >= previous, "delay shrank at attempt {attempt}");
            assert!(delay <= cap, "delay exceeded cap at attempt {attempt}");
            previous = delay;
        }
        assert_eq!(schedule.delay_after(64), cap);
    }
}
