//! Fixed-interval reconnection

use std::time::Duration;

/// Reconnect policy: wait the same interval before every attempt.
///
/// Attempts are counted so a long outage shows up in the logs.
#[derive(Debug, Clone)]
pub struct FixedInterval {
    /// Delay between attempts
    interval: Duration,
    /// Attempts since the last successful connection
    attempts: u32,
}

impl FixedInterval {
    /// Create a new policy
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            attempts: 0,
        }
    }

    /// Get the next delay and count the attempt
    pub fn next_delay(&mut self) -> Duration {
        self.attempts = self.attempts.saturating_add(1);
        self.interval
    }

    /// Attempts since the last reset
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Reset after a successful connection
    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interval_is_constant() {
        let mut policy = FixedInterval::new(Duration::from_secs(20));

        let d1 = policy.next_delay();
        let d2 = policy.next_delay();
        let d3 = policy.next_delay();

        assert_eq!(d1, Duration::from_secs(20));
        assert_eq!(d2, Duration::from_secs(20));
        assert_eq!(d3, Duration::from_secs(20));
        assert_eq!(policy.attempts(), 3);
    }

    #[test]
    fn test_reset_clears_attempts() {
        let mut policy = FixedInterval::new(Duration::from_secs(1));
        policy.next_delay();
        policy.reset();
        assert_eq!(policy.attempts(), 0);
    }
}
