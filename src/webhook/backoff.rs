use std::time::Duration;

/// Exponential retry schedule for failed deliveries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts after which a failing delivery is given up, counting the first.
    pub max_retries: u32,

    /// Delay after the first failed attempt; doubles with every further failure.
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub const DEFAULT: Self = Self {
        max_retries: 5,
        base_delay: Duration::from_secs(60),
    };

    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    /// Delay before the next attempt once `attempt_count` attempts have failed:
    /// `base_delay * 2^(attempt_count - 1)`, saturating.
    pub fn delay_after(&self, attempt_count: u32) -> Duration {
        let exponent = attempt_count.saturating_sub(1);
        let factor = 2u32.checked_pow(exponent).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }

    pub fn is_exhausted(&self, attempt_count: u32) -> bool {
        attempt_count >= self.max_retries
    }

    /// Every delay a delivery can wait before it is given up.
    pub fn schedule(&self) -> impl Iterator<Item = Duration> + '_ {
        (1..self.max_retries).map(|attempt| self.delay_after(attempt))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::DEFAULT
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_doubles_from_base() {
        let policy = RetryPolicy::default();
        let delays: Vec<u64> = (1..=5).map(|n| policy.delay_after(n).as_secs()).collect();
        assert_eq!(delays, vec![60, 120, 240, 480, 960]);
    }

    #[test]
    fn test_exhaustion_at_max_retries() {
        let policy = RetryPolicy::default();
        assert!(!policy.is_exhausted(4));
        assert!(policy.is_exhausted(5));
        assert!(policy.is_exhausted(6));
    }

    #[test]
    fn test_schedule_stops_before_terminal_attempt() {
        let policy = RetryPolicy::default();
        let schedule: Vec<u64> = policy.schedule().map(|d| d.as_secs()).collect();
        assert_eq!(schedule, vec![60, 120, 240, 480]);
    }

    #[test]
    fn test_large_attempts_saturate() {
        let policy = RetryPolicy::new(100, Duration::from_secs(60));
        assert_eq!(policy.delay_after(64), Duration::from_secs(60).saturating_mul(u32::MAX));
        assert_eq!(policy.delay_after(0), Duration::from_secs(60));
    }
}
