//! Bounded retry policy for optimistic transactions.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Backoff strategy between attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    Fixed,
    /// base * 2^(attempt-1)
    #[default]
    Exponential,
    /// base * attempt
    Linear,
}

/// How many times a transaction is attempted and how long to wait between
/// attempts after a version conflict.
///
/// `max_attempts` counts every attempt, the first one included: a policy with
/// `max_attempts = 1` never retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    #[serde(with = "millis")]
    pub base_delay: Duration,
    #[serde(with = "millis")]
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
    /// Jitter factor (0.0-1.0).
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(20),
            max_delay: Duration::from_secs(2),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// One attempt, conflicts surface immediately. Used for cursor advances.
    pub fn single_shot() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }

    /// Delay to wait after the `attempt`-th failed attempt (1-indexed), with
    /// the jitter of seed `0`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.jittered_delay(attempt, 0)
    }

    /// Like [`delay_for_attempt`](Self::delay_for_attempt), with the jitter
    /// drawn from `seed`. Callers pass a per-call seed so concurrent writers
    /// that conflicted on the same key spread out.
    pub fn jittered_delay(&self, attempt: u32, seed: u64) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                (base_ms * 2_f64.powi(attempt.saturating_sub(1).min(30) as i32)).min(max_ms)
            }
            BackoffStrategy::Linear => (base_ms * attempt as f64).min(max_ms),
        };

        let jitter_range = delay_ms * self.jitter.clamp(0.0, 1.0);
        let jitter = if jitter_range > 0.0 {
            jitter_range * (unit_noise(attempt, seed) - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + jitter).max(0.0) as u64)
    }

    /// Whether another attempt is allowed after `attempt` attempts failed.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// splitmix64 of `(seed, attempt)` mapped into `[0, 1)`.
fn unit_noise(attempt: u32, seed: u64) -> f64 {
    let mut z = seed ^ u64::from(attempt).wrapping_mul(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^= z >> 31;
    (z >> 11) as f64 / (1u64 << 53) as f64
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn exponential_backoff_doubles_until_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.0,
        };

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(64), Duration::from_millis(500));
    }

    #[test]
    fn linear_and_fixed_backoff() {
        let linear = RetryPolicy {
            strategy: BackoffStrategy::Linear,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            jitter: 0.0,
            ..Default::default()
        };
        assert_eq!(linear.delay_for_attempt(3), Duration::from_millis(300));

        let fixed = RetryPolicy::fixed(3, Duration::from_millis(50));
        assert_eq!(fixed.delay_for_attempt(1), fixed.delay_for_attempt(3));
    }

    #[test]
    fn single_shot_never_retries() {
        let policy = RetryPolicy::single_shot();
        assert!(!policy.should_retry(1));

        let policy = RetryPolicy::default();
        assert!(policy.should_retry(4));
        assert!(!policy.should_retry(5));
    }

    #[test]
    fn delays_deserialize_from_millis() {
        let policy: RetryPolicy =
            serde_json::from_str(r#"{"max_attempts": 3, "base_delay": 10, "strategy": "linear"}"#)
                .unwrap();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.base_delay, Duration::from_millis(10));
        assert_eq!(policy.strategy, BackoffStrategy::Linear);
        assert_eq!(policy.max_delay, RetryPolicy::default().max_delay);
    }

    #[test]
    fn jitter_differs_between_seeds() {
        let policy = RetryPolicy {
            strategy: BackoffStrategy::Fixed,
            base_delay: Duration::from_millis(1_000),
            jitter: 0.5,
            ..Default::default()
        };
        let delays: std::collections::BTreeSet<Duration> =
            (0..16u64).map(|seed| policy.jittered_delay(2, seed)).collect();
        assert!(delays.len() > 1, "every seed slept {delays:?}");
        assert!(delays
            .iter()
            .all(|d| *d >= Duration::from_millis(500) && *d <= Duration::from_millis(1_500)));

        assert_eq!(policy.jittered_delay(2, 7), policy.jittered_delay(2, 7));
        assert_eq!(policy.delay_for_attempt(3), policy.jittered_delay(3, 0));
    }

    fn strategy() -> impl Strategy<Value = BackoffStrategy> {
        prop_oneof![
            Just(BackoffStrategy::Fixed),
            Just(BackoffStrategy::Exponential),
            Just(BackoffStrategy::Linear),
        ]
    }

    proptest! {
        #[test]
        fn jittered_delay_stays_within_bounds(
            base_ms in 1u64..1_000,
            extra_ms in 0u64..10_000,
            jitter in 0.0f64..1.0,
            attempt in 1u32..200,
            seed in any::<u64>(),
            strategy in strategy(),
        ) {
            let policy = RetryPolicy {
                max_attempts: 10,
                base_delay: Duration::from_millis(base_ms),
                max_delay: Duration::from_millis(base_ms + extra_ms),
                strategy,
                jitter,
            };
            let delay = policy.jittered_delay(attempt, seed).as_millis() as f64;
            let cap = (base_ms + extra_ms) as f64 * (1.0 + jitter) + 1.0;
            prop_assert!(delay <= cap, "delay {delay} above {cap}");
        }
    }
}
