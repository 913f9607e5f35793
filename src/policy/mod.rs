//! Redelivery policies.
//!
//! A [`RedeliveryPolicy`] decides how long a failed message waits before the
//! next delivery attempt and when the message has exhausted its redeliveries
//! and must become a dead letter.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff strategy applied to redelivery delays.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    /// Constant delay between attempts.
    Fixed,
    /// Delay grows by a fixed increment per attempt, clamped to the maximum.
    Linear {
        /// Increment added per redelivery attempt.
        increment: Duration,
    },
    /// Delay is multiplied per attempt, clamped to the maximum, with optional
    /// random jitter.
    Exponential {
        /// Multiplier applied per redelivery attempt.
        multiplier: f64,
        /// Upper bound of uniform random jitter added to each delay.
        jitter: Duration,
    },
}

/// Rule producing the next delivery delay from the redelivery attempt count.
///
/// `delay_for_attempt(n)` is evaluated with the zero-based redelivery attempt
/// number: `n = 0` for the first redelivery, `n = 1` for the second and so on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RedeliveryPolicy {
    /// Delay before the first redelivery.
    pub initial_redelivery_delay: Duration,
    /// Base delay for redeliveries after the first.
    pub followup_redelivery_delay: Duration,
    /// Upper bound for any computed delay.
    pub maximum_redelivery_delay: Duration,
    /// Number of redeliveries after which a failing message is dead-lettered.
    pub maximum_number_of_redeliveries: u32,
    /// Backoff strategy.
    pub backoff: Backoff,
}

impl RedeliveryPolicy {
    /// Fixed backoff: every redelivery waits `delay`.
    pub fn fixed_backoff(delay: Duration, maximum_number_of_redeliveries: u32) -> Self {
        Self {
            initial_redelivery_delay: delay,
            followup_redelivery_delay: delay,
            maximum_redelivery_delay: delay,
            maximum_number_of_redeliveries,
            backoff: Backoff::Fixed,
        }
    }

    /// Linear backoff: delay grows by `increment` per redelivery, up to
    /// `maximum_delay`.
    pub fn linear_backoff(
        initial_delay: Duration,
        increment: Duration,
        maximum_delay: Duration,
        maximum_number_of_redeliveries: u32,
    ) -> Self {
        Self {
            initial_redelivery_delay: initial_delay,
            followup_redelivery_delay: initial_delay,
            maximum_redelivery_delay: maximum_delay,
            maximum_number_of_redeliveries,
            backoff: Backoff::Linear { increment },
        }
    }

    /// Exponential backoff: delay is multiplied by `multiplier` per
    /// redelivery, up to `maximum_delay`.
    pub fn exponential_backoff(
        initial_delay: Duration,
        multiplier: f64,
        maximum_delay: Duration,
        maximum_number_of_redeliveries: u32,
    ) -> Self {
        Self {
            initial_redelivery_delay: initial_delay,
            followup_redelivery_delay: initial_delay,
            maximum_redelivery_delay: maximum_delay,
            maximum_number_of_redeliveries,
            backoff: Backoff::Exponential {
                multiplier,
                jitter: Duration::ZERO,
            },
        }
    }

    /// Override the base delay used for redeliveries after the first.
    pub fn with_followup_delay(mut self, delay: Duration) -> Self {
        self.followup_redelivery_delay = delay;
        self
    }

    /// Add uniform random jitter to exponential backoff delays.
    ///
    /// No-op for fixed and linear backoff.
    pub fn with_jitter(mut self, max_jitter: Duration) -> Self {
        if let Backoff::Exponential { jitter, .. } = &mut self.backoff {
            *jitter = max_jitter;
        }
        self
    }

    /// Compute the delay before the next delivery attempt.
    ///
    /// `redelivery_attempt` is zero-based: 0 for the first redelivery.
    pub fn delay_for_attempt(&self, redelivery_attempt: u32) -> Duration {
        if redelivery_attempt == 0 {
            return self.initial_redelivery_delay.min(self.maximum_redelivery_delay);
        }

        let base = self.followup_redelivery_delay;
        let delay = match &self.backoff {
            Backoff::Fixed => self.initial_redelivery_delay,
            Backoff::Linear { increment } => {
                base.saturating_add(increment.saturating_mul(redelivery_attempt))
            }
            Backoff::Exponential { multiplier, jitter } => {
                let scaled = base.as_secs_f64() * multiplier.powi(redelivery_attempt as i32);
                let capped = scaled.min(self.maximum_redelivery_delay.as_secs_f64());
                let delay = Duration::from_secs_f64(capped.max(0.0));
                return delay.saturating_add(random_jitter(*jitter));
            }
        };
        delay.min(self.maximum_redelivery_delay)
    }

    /// Whether a message with the given redelivery count has exhausted this
    /// policy and must be dead-lettered on its next failure.
    pub fn is_exhausted(&self, redelivery_attempts: u32) -> bool {
        redelivery_attempts >= self.maximum_number_of_redeliveries
    }
}

fn random_jitter(max: Duration) -> Duration {
    if max.is_zero() {
        return Duration::ZERO;
    }
    let micros = rand::thread_rng().gen_range(0..=max.as_micros() as u64);
    Duration::from_micros(micros)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_backoff_is_constant() {
        let policy = RedeliveryPolicy::fixed_backoff(Duration::from_millis(200), 5);

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(100), Duration::from_millis(200));
    }

    #[test]
    fn test_linear_backoff_grows_and_clamps() {
        let policy = RedeliveryPolicy::linear_backoff(
            Duration::from_millis(100),
            Duration::from_millis(50),
            Duration::from_millis(250),
            10,
        );

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(150));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        // 100 + 50 * 4 = 300 clamps to 250
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(250));
    }

    #[test]
    fn test_exponential_backoff_doubles_and_clamps() {
        let policy = RedeliveryPolicy::exponential_backoff(
            Duration::from_secs(1),
            2.0,
            Duration::from_secs(5),
            10,
        );

        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(5));
        assert_eq!(policy.delay_for_attempt(8), Duration::from_secs(5));
    }

    #[test]
    fn test_exponential_jitter_stays_within_bounds() {
        let policy = RedeliveryPolicy::exponential_backoff(
            Duration::from_millis(100),
            2.0,
            Duration::from_secs(1),
            5,
        )
        .with_jitter(Duration::from_millis(50));

        for _ in 0..20 {
            let delay = policy.delay_for_attempt(1);
            assert!(delay >= Duration::from_millis(200));
            assert!(delay <= Duration::from_millis(250));
        }
    }

    #[test]
    fn test_followup_delay_override() {
        let policy = RedeliveryPolicy::exponential_backoff(
            Duration::from_millis(100),
            2.0,
            Duration::from_secs(10),
            5,
        )
        .with_followup_delay(Duration::from_millis(500));

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(1000));
    }

    #[test]
    fn test_exhaustion_threshold() {
        let policy = RedeliveryPolicy::fixed_backoff(Duration::from_millis(200), 5);

        assert!(!policy.is_exhausted(0));
        assert!(!policy.is_exhausted(4));
        assert!(policy.is_exhausted(5));
        assert!(policy.is_exhausted(6));
    }

    #[test]
    fn test_zero_redeliveries_dead_letters_immediately() {
        let policy = RedeliveryPolicy::fixed_backoff(Duration::from_millis(200), 0);
        assert!(policy.is_exhausted(0));
    }
}
