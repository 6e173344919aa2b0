//! Retry delay policy for nacked descriptors

#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::cast_sign_loss
)]

use std::time::Duration;

/// Exponential backoff with a cap and additive jitter.
///
/// Successive delays for one descriptor never shrink: the previous delay is
/// a floor, so jitter cannot make a later retry come sooner.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    base_ms: i64,
    max_ms: i64,
    jitter: f64,
}

impl BackoffPolicy {
    pub fn new(base: Duration, max: Duration, jitter: f64) -> Self {
        let base_ms = i64::try_from(base.as_millis()).unwrap_or(i64::MAX).max(1);
        let max_ms = i64::try_from(max.as_millis())
            .unwrap_or(i64::MAX)
            .max(base_ms);
        Self {
            base_ms,
            max_ms,
            jitter: jitter.clamp(0.0, 1.0),
        }
    }

    pub const fn max_ms(&self) -> i64 {
        self.max_ms
    }

    /// Delay before attempt `attempt + 1`, given the delay used last time.
    pub fn next_delay(&self, attempt: u32, previous_ms: i64) -> i64 {
        self.next_delay_with_sample(attempt, previous_ms, rand::random::<f64>())
    }

    /// Same as [`next_delay`](Self::next_delay) with an explicit jitter
    /// sample in `[0, 1)`.
    pub fn next_delay_with_sample(&self, attempt: u32, previous_ms: i64, sample: f64) -> i64 {
        let exponent = attempt.saturating_sub(1).min(32);
        let raw = self
            .base_ms
            .saturating_mul(1_i64 << exponent)
            .min(self.max_ms);
        let jitter = (raw as f64 * self.jitter * sample.clamp(0.0, 1.0)) as i64;
        raw.saturating_add(jitter)
            .max(previous_ms)
            .min(self.max_ms)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(2), Duration::from_secs(300), 0.2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_double_until_capped() {
        let policy = BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(10), 0.0);
        let mut previous = 0;
        let mut delays = Vec::new();
        for attempt in 1..=6 {
            previous = policy.next_delay_with_sample(attempt, previous, 0.5);
            delays.push(previous);
        }
        assert_eq!(delays, vec![1_000, 2_000, 4_000, 8_000, 10_000, 10_000]);
    }

    #[test]
    fn jitter_never_shrinks_successive_delays() {
        let policy = BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(60), 1.0);
        let mut previous = 0;
        let samples = [0.99, 0.0, 0.99, 0.0, 0.5, 0.0, 0.99, 0.0];
        for (index, sample) in samples.iter().enumerate() {
            let attempt = u32::try_from(index + 1).unwrap();
            let delay = policy.next_delay_with_sample(attempt, previous, *sample);
            assert!(delay >= previous, "attempt {attempt}: {delay} < {previous}");
            assert!(delay <= policy.max_ms());
            previous = delay;
        }
    }

    #[test]
    fn huge_attempt_counts_saturate_at_cap() {
        let policy = BackoffPolicy::new(Duration::from_millis(500), Duration::from_secs(30), 0.2);
        assert_eq!(policy.next_delay(u32::MAX, 0), 30_000);
    }
}
