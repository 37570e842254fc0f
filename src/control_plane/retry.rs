//! Bounded exponential backoff

use std::time::Duration;

use crate::clock::Clock;
use crate::config::RetryConfig;
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay before retry number `retry` (0-based): base * 2^retry, capped
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Run `f` until it succeeds, fails non-retryably, or attempts run out.
    ///
    /// `f` receives the 1-based attempt number.
    pub fn run<T>(&self, clock: &dyn Clock, operation: &str, mut f: impl FnMut(u32) -> Result<T>) -> Result<T> {
        let mut attempt = 1;
        loop {
            match f(attempt) {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                    let delay = self.delay_for(attempt - 1);
                    tracing::debug!(
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient failure, backing off"
                    );
                    clock.sleep(delay);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::Error;

    #[test]
    fn test_delay_schedule() {
        let policy = RetryPolicy::default();
        let delays: Vec<u64> = (0..6).map(|r| policy.delay_for(r).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 16]);
    }

    #[test]
    fn test_succeeds_on_third_attempt_after_backoff() {
        let clock = ManualClock::starting_now();
        let policy = RetryPolicy::default();

        let result = policy.run(&clock, "create", |attempt| {
            if attempt < 3 {
                Err(Error::Transient("connection reset".into()))
            } else {
                Ok("ws-remote-1")
            }
        });

        assert_eq!(result.unwrap(), "ws-remote-1");
        assert_eq!(clock.sleeps(), vec![Duration::from_secs(1), Duration::from_secs(2)]);
        assert!(clock.total_slept() >= Duration::from_secs(3));
    }

    #[test]
    fn test_gives_up_after_max_attempts() {
        let clock = ManualClock::starting_now();
        let policy = RetryPolicy::default();
        let mut calls = 0;

        let result: Result<()> = policy.run(&clock, "stop", |_| {
            calls += 1;
            Err(Error::Transient("timeout".into()))
        });

        assert!(matches!(result, Err(Error::Transient(_))));
        assert_eq!(calls, 5);
        assert_eq!(clock.total_slept(), Duration::from_secs(1 + 2 + 4 + 8));
    }

    #[test]
    fn test_permanent_failure_not_retried() {
        let clock = ManualClock::starting_now();
        let mut calls = 0;

        let result: Result<()> = RetryPolicy::default().run(&clock, "create", |_| {
            calls += 1;
            Err(Error::Permanent("invalid bundle".into()))
        });

        assert!(matches!(result, Err(Error::Permanent(_))));
        assert_eq!(calls, 1);
        assert!(clock.sleeps().is_empty());
    }

    #[test]
    fn test_circuit_open_stops_retrying() {
        let clock = ManualClock::starting_now();
        let mut calls = 0;

        let result: Result<()> = RetryPolicy::default().run(&clock, "start", |attempt| {
            calls += 1;
            if attempt == 1 {
                Err(Error::Transient("503".into()))
            } else {
                Err(Error::CircuitOpen { endpoint: "control-plane".into() })
            }
        });

        assert!(matches!(result, Err(Error::CircuitOpen { .. })));
        assert_eq!(calls, 2);
    }
}
