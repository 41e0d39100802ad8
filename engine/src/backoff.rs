//! Exponential backoff with jitter for queued remote writes.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff policy for failed sync operations.
///
/// `delay = min(base * 2^min(attempts, max_exponent), max) * jitter`, with the
/// jitter factor drawn uniformly from `[jitter_min, jitter_max]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackoffPolicy {
    /// Delay for an operation with zero recorded attempts
    pub base_delay: Duration,
    /// Upper bound on the nominal delay
    pub max_delay: Duration,
    /// Attempts beyond this no longer double the delay
    pub max_exponent: u32,
    /// Lower bound of the jitter factor
    pub jitter_min: f64,
    /// Upper bound of the jitter factor
    pub jitter_max: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(3600),
            max_exponent: 6,
            jitter_min: 0.8,
            jitter_max: 1.2,
        }
    }
}

impl BackoffPolicy {
    /// Policy without jitter, for deterministic callers.
    pub fn without_jitter(self) -> Self {
        Self {
            jitter_min: 1.0,
            jitter_max: 1.0,
            ..self
        }
    }

    /// Sets the base delay.
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Delay before jitter for the given attempt count.
    pub fn nominal_delay(&self, attempts: u32) -> Duration {
        let exponent = attempts.min(self.max_exponent);
        let factor = 2u32.saturating_pow(exponent);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Inclusive range the jittered delay falls in.
    pub fn bounds(&self, attempts: u32) -> (Duration, Duration) {
        let nominal = self.nominal_delay(attempts);
        (
            nominal.mul_f64(self.jitter_min),
            nominal.mul_f64(self.jitter_max),
        )
    }

    /// Jittered delay for the given attempt count.
    pub fn delay<R: Rng + ?Sized>(&self, attempts: u32, rng: &mut R) -> Duration {
        let nominal = self.nominal_delay(attempts);
        if self.jitter_max <= self.jitter_min {
            return nominal.mul_f64(self.jitter_min);
        }
        let factor = rng.gen_range(self.jitter_min..=self.jitter_max);
        nominal.mul_f64(factor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn nominal_delay_doubles_then_caps() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.nominal_delay(0), Duration::from_secs(60));
        assert_eq!(policy.nominal_delay(1), Duration::from_secs(120));
        assert_eq!(policy.nominal_delay(3), Duration::from_secs(480));
        assert_eq!(policy.nominal_delay(5), Duration::from_secs(1920));
        // 60 * 2^6 = 3840, capped at 3600
        assert_eq!(policy.nominal_delay(6), Duration::from_secs(3600));
        assert_eq!(policy.nominal_delay(40), Duration::from_secs(3600));
    }

    #[test]
    fn three_attempts_lands_in_expected_window() {
        let policy = BackoffPolicy::default();
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let delay = policy.delay(3, &mut rng);
            assert!(delay >= Duration::from_secs(384), "{delay:?}");
            assert!(delay <= Duration::from_secs(576), "{delay:?}");
        }
    }

    #[test]
    fn bounds_match_jitter_range() {
        let policy = BackoffPolicy::default();
        let (lo, hi) = policy.bounds(3);
        assert_eq!(lo, Duration::from_secs(384));
        assert_eq!(hi, Duration::from_secs(576));
    }

    #[test]
    fn without_jitter_is_exact() {
        let policy = BackoffPolicy::default().without_jitter();
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(policy.delay(2, &mut rng), Duration::from_secs(240));
    }

    #[test]
    fn custom_base_and_cap() {
        let policy = BackoffPolicy::default()
            .with_base_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_secs(1));
        assert_eq!(policy.nominal_delay(2), Duration::from_millis(400));
        assert_eq!(policy.nominal_delay(6), Duration::from_secs(1));
    }
}
