//! Retry and redelivery backoff.
//!
//! Two distinct concepts share this module because they share math:
//! `RetryPolicy` governs how long the outbox publisher waits between
//! publish attempts (§4.3); `BackoffStrategy` governs the NAK delay the
//! message processor requests before JetStream redelivers a message
//! (§4.4). Both clamp to a floor/ceiling and both jitter.

use rand::rngs::OsRng;
use rand::Rng;
use std::time::Duration;

/// How the outbox publisher spaces out retries of a single event.
pub trait RetryPolicy: Send + Sync {
    /// Delay before the given (1-indexed) attempt. `attempt == 1` is the
    /// first retry after the initial failed publish.
    fn delay(&self, attempt: u32) -> Duration;

    fn max_attempts(&self) -> u32;
}

/// Fixed ladder of delays, repeating (or clamping to) the last entry past
/// the ladder's length. Default `[0.25s, 1s, 2s]`.
#[derive(Debug, Clone)]
pub struct LinearBackoff {
    pub delays: Vec<Duration>,
    pub max_attempts: u32,
}

impl Default for LinearBackoff {
    fn default() -> Self {
        Self {
            delays: vec![
                Duration::from_millis(250),
                Duration::from_secs(1),
                Duration::from_secs(2),
            ],
            max_attempts: 3,
        }
    }
}

impl RetryPolicy for LinearBackoff {
    fn delay(&self, attempt: u32) -> Duration {
        let idx = (attempt.saturating_sub(1) as usize).min(self.delays.len().saturating_sub(1));
        self.delays.get(idx).copied().unwrap_or_default()
    }

    fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

/// `delay_i = min(max_delay, base * multiplier^i)`, jittered by ±10% from
/// a cryptographically seeded source.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    pub base: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(250),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            max_attempts: 8,
        }
    }
}

impl RetryPolicy for ExponentialBackoff {
    fn delay(&self, attempt: u32) -> Duration {
        let raw = self.base.as_secs_f64() * self.multiplier.powi(attempt as i32);
        let capped = raw.min(self.max_delay.as_secs_f64());
        let jitter = OsRng.gen_range(-0.10..=0.10);
        let jittered = (capped * (1.0 + jitter)).max(0.0);
        Duration::from_secs_f64(jittered)
    }

    fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

/// Whether an error should be retried at all, or is fatal and should not
/// consume further attempts.
pub trait Classify {
    fn is_transient(&self) -> bool;
}

/// Redelivery backoff advice attached to a NAK, per §4.4: transient errors
/// get a gentler base delay than unclassified/terminal errors, both
/// following `clamp(base * 2^(attempt-1), 1s, 60s)`.
pub struct BackoffStrategy {
    pub min: Duration,
    pub max: Duration,
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self {
            min: Duration::from_secs(1),
            max: Duration::from_secs(60),
        }
    }
}

impl BackoffStrategy {
    /// `deliveries` is the 1-indexed delivery count JetStream reports for
    /// this message (i.e. the number of times it has been delivered,
    /// including this one).
    pub fn delay(&self, deliveries: u64, transient: bool) -> Duration {
        let base = if transient { 0.5 } else { 2.0 };
        let attempt = deliveries.max(1) as i32 - 1;
        let raw = base * 2f64.powi(attempt);
        let clamped = raw.clamp(self.min.as_secs_f64(), self.max.as_secs_f64());
        Duration::from_secs(clamped.round() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linear_backoff_follows_default_ladder_then_clamps_to_last() {
        let policy = LinearBackoff::default();
        assert_eq!(policy.delay(1), Duration::from_millis(250));
        assert_eq!(policy.delay(2), Duration::from_secs(1));
        assert_eq!(policy.delay(3), Duration::from_secs(2));
        assert_eq!(policy.delay(10), Duration::from_secs(2));
    }

    #[test]
    fn exponential_backoff_is_monotonic_and_capped() {
        let policy = ExponentialBackoff {
            base: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_secs(5),
            max_attempts: 10,
        };
        let mut prev = Duration::ZERO;
        for attempt in 0..10 {
            let raw = 0.1 * 2f64.powi(attempt);
            let expected_capped = raw.min(5.0);
            let got = policy.delay(attempt as u32);
            // allow for ±10% jitter around the capped value
            assert!(got.as_secs_f64() <= expected_capped * 1.11);
            assert!(got >= prev.mul_f64(0.0)); // always non-negative
            prev = got;
        }
    }

    #[test]
    fn backoff_strategy_monotonic_within_bounds_for_transient() {
        let strategy = BackoffStrategy::default();
        let mut prev = Duration::from_secs(0);
        for deliveries in 1..=10u64 {
            let d = strategy.delay(deliveries, true);
            assert!(d >= strategy.min);
            assert!(d <= strategy.max);
            assert!(d >= prev, "delay(n) must be >= delay(n-1)");
            prev = d;
        }
    }

    #[test]
    fn backoff_strategy_monotonic_within_bounds_for_non_transient() {
        let strategy = BackoffStrategy::default();
        let mut prev = Duration::from_secs(0);
        for deliveries in 1..=10u64 {
            let d = strategy.delay(deliveries, false);
            assert!(d >= strategy.min);
            assert!(d <= strategy.max);
            assert!(d >= prev);
            prev = d;
        }
    }

    #[test]
    fn non_transient_base_delay_is_higher_than_transient() {
        let strategy = BackoffStrategy::default();
        assert!(strategy.delay(1, false) >= strategy.delay(1, true));
    }
}
