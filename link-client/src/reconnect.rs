// link-client/src/reconnect.rs
use std::time::Duration;

/// Delay schedule for re-opening a dropped connection. Consulted exactly
/// once per disconnect; the attempt counter is reset by the channel after a
/// successful reconnect.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    base: Duration,
    max: Duration,
    exponential: bool,
}

impl ReconnectPolicy {
    /// Constant delay between attempts
    pub fn fixed(delay: Duration) -> Self {
        Self { base: delay, max: delay, exponential: false }
    }

    /// Doubling backoff (base, 2*base, 4*base, ...) capped at `max`
    pub fn exponential(base: Duration, max: Duration) -> Self {
        Self { base, max, exponential: true }
    }

    pub fn from_config(link: &common::LinkConfig) -> Self {
        Self::fixed(Duration::from_secs(link.reconnect_delay_secs))
    }

    /// Delay before reconnect attempt number `attempt` (zero-based)
    pub fn next_delay(&self, attempt: u32) -> Duration {
        if !self.exponential {
            return self.base;
        }

        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base.checked_mul(factor).unwrap_or(self.max).min(self.max)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::fixed(Duration::from_secs(5))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_policy_is_constant() {
        let policy = ReconnectPolicy::fixed(Duration::from_secs(5));
        for attempt in 0..10 {
            assert_eq!(policy.next_delay(attempt), Duration::from_secs(5));
        }
    }

    #[test]
    fn exponential_policy_doubles_and_caps() {
        let policy = ReconnectPolicy::exponential(Duration::from_secs(1), Duration::from_secs(60));
        assert_eq!(policy.next_delay(0), Duration::from_secs(1));
        assert_eq!(policy.next_delay(1), Duration::from_secs(2));
        assert_eq!(policy.next_delay(3), Duration::from_secs(8));
        assert_eq!(policy.next_delay(6), Duration::from_secs(60));
        assert_eq!(policy.next_delay(40), Duration::from_secs(60));
    }

    #[test]
    fn delays_never_decrease() {
        let policy = ReconnectPolicy::exponential(Duration::from_secs(2), Duration::from_secs(60));
        let mut previous = Duration::ZERO;
        for attempt in 0..64 {
            let delay = policy.next_delay(attempt);
            assert!(delay >= previous, "delay shrank at attempt {}", attempt);
            previous = delay;
        }
    }
}
