//! Reconnect policy with jittered exponential back-off.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Controls how the transport reconnects after the link drops.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ReconnectBackoff {
    /// Delay before the first reconnect attempt, in milliseconds.
    pub initial_delay_ms: u64,
    /// Cap on the delay between attempts, in milliseconds.
    pub max_delay_ms: u64,
    /// Multiplier applied after each failed attempt.
    pub factor: f64,
    /// Random extra delay as a fraction of the computed delay (0.0..=1.0).
    pub jitter: f64,
    /// Consecutive failures before the link is declared unreachable.
    pub max_attempts: u32,
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self {
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
            factor: 2.0,
            jitter: 0.25,
            max_attempts: 8,
        }
    }
}

impl ReconnectBackoff {
    /// Delay before the given attempt (0-indexed), without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let base_ms = self.initial_delay_ms as f64;
        let delay_ms = base_ms * self.factor.max(1.0).powi(attempt.min(64) as i32);
        Duration::from_millis(delay_ms.min(self.max_delay_ms as f64) as u64)
    }

    /// Delay before the given attempt (0-indexed), with jitter applied.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return base;
        }
        let extra = base.as_millis() as f64 * jitter * rand::thread_rng().gen_range(0.0..1.0);
        base + Duration::from_millis(extra as u64)
    }

    /// Whether `attempt` failed attempts exhaust the budget.
    pub fn should_give_up(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy_values() {
        let p = ReconnectBackoff::default();
        assert_eq!(p.base_delay(0), Duration::from_millis(500));
        assert_eq!(p.max_attempts, 8);
    }

    #[test]
    fn test_delay_grows_with_backoff() {
        let p = ReconnectBackoff {
            jitter: 0.0,
            ..Default::default()
        };
        let d0 = p.delay_for_attempt(0);
        let d1 = p.delay_for_attempt(1);
        let d2 = p.delay_for_attempt(2);
        assert!(d1 > d0);
        assert!(d2 > d1);
        assert_eq!(d2, Duration::from_millis(2_000));
    }

    #[test]
    fn test_delay_capped_at_max() {
        let p = ReconnectBackoff {
            initial_delay_ms: 10_000,
            max_delay_ms: 30_000,
            factor: 10.0,
            jitter: 0.25,
            max_attempts: 3,
        };
        for attempt in 0..100 {
            let d = p.delay_for_attempt(attempt);
            // Never exceeds max delay plus 25% jitter.
            assert!(d <= Duration::from_millis(37_500));
        }
    }

    #[test]
    fn test_jitter_stays_within_fraction() {
        let p = ReconnectBackoff {
            initial_delay_ms: 1_000,
            jitter: 0.5,
            ..Default::default()
        };
        for _ in 0..50 {
            let d = p.delay_for_attempt(0);
            assert!(d >= Duration::from_millis(1_000));
            assert!(d < Duration::from_millis(1_500));
        }
    }

    #[test]
    fn test_gives_up_after_max_attempts() {
        let p = ReconnectBackoff {
            max_attempts: 5,
            ..Default::default()
        };
        assert!(!p.should_give_up(4));
        assert!(p.should_give_up(5));
        assert!(p.should_give_up(6));
    }
}
