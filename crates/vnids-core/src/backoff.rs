//! Capped exponential backoff, shared by the watchdog restart delay and the
//! client reconnection helper.

use std::time::Duration;

use vnids_config::{IpcConfig, WatchdogConfig};

/// Delay schedule `initial * 2^attempt`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
}

impl Backoff {
    pub const fn new(initial: Duration, max: Duration) -> Self {
        Self { initial, max }
    }

    /// Delay before retry number `attempt` (0-indexed).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.initial.saturating_mul(factor).min(self.max)
    }

    /// The full schedule for `attempts` retries.
    pub fn schedule(&self, attempts: u32) -> impl Iterator<Item = Duration> + '_ {
        (0..attempts).map(|n| self.delay(n))
    }
}

impl Default for Backoff {
    /// 100 ms doubling to a 5 s cap.
    fn default() -> Self {
        Self::new(Duration::from_millis(100), Duration::from_secs(5))
    }
}

impl From<&WatchdogConfig> for Backoff {
    fn from(config: &WatchdogConfig) -> Self {
        Self::new(
            Duration::from_millis(config.restart_delay_ms),
            Duration::from_millis(config.max_restart_delay_ms),
        )
    }
}

/// How a client retries a failed connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub backoff: Backoff,
    /// Connection attempts before giving up, including the first.
    pub max_attempts: u32,
}

impl ReconnectPolicy {
    /// Try once, never wait.
    pub fn no_retry() -> Self {
        Self {
            backoff: Backoff::default(),
            max_attempts: 1,
        }
    }

    pub fn is_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            backoff: Backoff::default(),
            max_attempts: 5,
        }
    }
}

impl From<&IpcConfig> for ReconnectPolicy {
    fn from(config: &IpcConfig) -> Self {
        Self {
            backoff: Backoff::new(
                Duration::from_millis(config.reconnect_initial_ms),
                Duration::from_millis(config.reconnect_max_ms),
            ),
            max_attempts: config.reconnect_max_attempts.max(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_reconnect_schedule() {
        let millis: Vec<u128> = Backoff::default()
            .schedule(9)
            .map(|d| d.as_millis())
            .collect();
        assert_eq!(millis, vec![100, 200, 400, 800, 1600, 3200, 5000, 5000, 5000]);
    }

    #[test]
    fn test_restart_schedule_from_config() {
        let backoff = Backoff::from(&WatchdogConfig::default());
        assert_eq!(backoff.delay(0), Duration::from_secs(1));
        assert_eq!(backoff.delay(3), Duration::from_secs(8));
        assert_eq!(backoff.delay(6), Duration::from_secs(60));
        assert_eq!(backoff.delay(40), Duration::from_secs(60));
    }

    #[test]
    fn test_huge_attempt_saturates() {
        let backoff = Backoff::new(Duration::from_secs(1), Duration::MAX);
        assert_eq!(backoff.delay(31), Duration::from_secs(1 << 31));
        assert_eq!(backoff.delay(32), Duration::from_secs(u32::MAX as u64));
    }

    #[test]
    fn test_policy_exhaustion() {
        let policy = ReconnectPolicy::from(&IpcConfig::default());
        assert_eq!(policy.max_attempts, 5);
        assert!(!policy.is_exhausted(4));
        assert!(policy.is_exhausted(5));
        assert!(ReconnectPolicy::no_retry().is_exhausted(1));
    }
}
