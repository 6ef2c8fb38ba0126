//! Adaptive poll cadence.

use std::time::Duration;

use crate::config::PollConfig;

/// Poll interval that shrinks to the minimum on activity, grows
/// geometrically while idle and jumps to the maximum on failure.
#[derive(Debug, Clone)]
pub struct PollSchedule {
    min: Duration,
    max: Duration,
    factor: f64,
    current: Duration,
    consecutive_failures: u32,
}

impl PollSchedule {
    pub fn new(min: Duration, max: Duration, factor: f64) -> Self {
        let max = max.max(min);
        Self {
            min,
            max,
            factor: if factor.is_finite() && factor >= 1.0 { factor } else { 1.0 },
            current: min,
            consecutive_failures: 0,
        }
    }

    pub fn from_config(config: &PollConfig) -> Self {
        Self::new(config.min_interval(), config.max_interval(), config.backoff_factor)
    }

    pub fn interval(&self) -> Duration {
        self.current
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// A poll returned updates.
    pub fn on_activity(&mut self) {
        self.current = self.min;
        self.consecutive_failures = 0;
    }

    /// A poll succeeded but was empty.
    pub fn on_idle(&mut self) {
        let next = self.current.as_secs_f64() * self.factor;
        self.current = Duration::from_secs_f64(next.min(self.max.as_secs_f64()));
        self.consecutive_failures = 0;
    }

    /// A poll failed in transport. Returns the consecutive failure count.
    pub fn on_failure(&mut self) -> u32 {
        self.current = self.max;
        self.consecutive_failures += 1;
        self.consecutive_failures
    }

    pub fn reset(&mut self) {
        self.current = self.min;
        self.consecutive_failures = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schedule() -> PollSchedule {
        PollSchedule::new(Duration::from_millis(1_000), Duration::from_millis(5_000), 2.0)
    }

    #[test]
    fn idle_polls_grow_geometrically_to_the_cap() {
        let mut schedule = schedule();
        let mut seen = Vec::new();
        for _ in 0..4 {
            schedule.on_idle();
            seen.push(schedule.interval().as_millis());
        }
        assert_eq!(seen, vec![2_000, 4_000, 5_000, 5_000]);
    }

    #[test]
    fn activity_resets_to_minimum() {
        let mut schedule = schedule();
        schedule.on_idle();
        schedule.on_idle();
        schedule.on_activity();
        assert_eq!(schedule.interval(), Duration::from_millis(1_000));
    }

    #[test]
    fn failure_jumps_to_maximum_and_counts() {
        let mut schedule = schedule();
        assert_eq!(schedule.on_failure(), 1);
        assert_eq!(schedule.on_failure(), 2);
        assert_eq!(schedule.interval(), Duration::from_millis(5_000));

        schedule.on_idle();
        assert_eq!(schedule.consecutive_failures(), 0);
    }

    #[test]
    fn degenerate_factor_never_shrinks() {
        let mut schedule =
            PollSchedule::new(Duration::from_millis(1_000), Duration::from_millis(5_000), 0.5);
        schedule.on_idle();
        assert_eq!(schedule.interval(), Duration::from_millis(1_000));
    }
}
