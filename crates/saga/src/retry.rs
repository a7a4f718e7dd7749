//! Retry eligibility and exponential backoff with jitter.

use std::time::Duration;

use rand::Rng;

use crate::types::RetryPolicy;

/// Fraction of the nominal delay used as the jitter bound (±25%).
pub const JITTER_FACTOR: f64 = 0.25;

/// Pure retry calculations shared by saga-level and step-level bookkeeping.
pub struct RetryScheduler;

impl RetryScheduler {
    /// Returns true if another attempt may be scheduled.
    ///
    /// `attempt` is the number of retries already made.
    pub fn can_retry(attempt: u32, policy: &RetryPolicy, expired: bool) -> bool {
        attempt < policy.max_retries && !expired
    }

    /// Delay before retry number `attempt`, before jitter.
    ///
    /// `interval * backoff_factor^attempt`, capped at `max_interval`.
    pub fn nominal_delay(attempt: u32, policy: &RetryPolicy) -> Duration {
        if attempt == 0 {
            return policy.interval;
        }
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = policy.interval.as_secs_f64() * policy.backoff_factor.powi(exponent);
        let cap = policy.max_interval.as_secs_f64();
        if !secs.is_finite() || secs >= cap {
            return policy.max_interval;
        }
        Duration::try_from_secs_f64(secs).unwrap_or(policy.max_interval)
    }

    /// Delay before retry number `attempt`, with ±25% uniform jitter after
    /// the first retry.
    pub fn next_retry_delay(attempt: u32, policy: &RetryPolicy) -> Duration {
        Self::next_retry_delay_with(attempt, policy, &mut rand::thread_rng())
    }

    /// Same as [`RetryScheduler::next_retry_delay`] with a caller-supplied RNG.
    pub fn next_retry_delay_with<R: Rng>(
        attempt: u32,
        policy: &RetryPolicy,
        rng: &mut R,
    ) -> Duration {
        let nominal = Self::nominal_delay(attempt, policy);
        if attempt == 0 || nominal.is_zero() {
            return nominal;
        }
        let jitter = rng.gen_range(-JITTER_FACTOR..=JITTER_FACTOR);
        // Saturates instead of overflowing when max_interval is near Duration::MAX.
        Duration::try_from_secs_f64(nominal.as_secs_f64() * (1.0 + jitter))
            .unwrap_or(Duration::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            interval: Duration::from_secs(30),
            backoff_factor: 2.0,
            max_interval: Duration::from_secs(300),
            retry_on: vec!["SERVICE_UNAVAILABLE".into()],
        }
    }

    #[test]
    fn test_nominal_delays_double() {
        let policy = policy();
        let delays: Vec<u64> = (0..4)
            .map(|attempt| RetryScheduler::nominal_delay(attempt, &policy).as_secs())
            .collect();
        assert_eq!(delays, vec![30, 60, 120, 240]);
    }

    #[test]
    fn test_nominal_delay_is_capped() {
        let policy = policy();
        assert_eq!(
            RetryScheduler::nominal_delay(4, &policy),
            Duration::from_secs(300)
        );
        assert_eq!(
            RetryScheduler::nominal_delay(u32::MAX, &policy),
            Duration::from_secs(300)
        );
    }

    #[test]
    fn test_can_retry_respects_max_and_expiry() {
        let policy = policy();
        assert!(RetryScheduler::can_retry(0, &policy, false));
        assert!(RetryScheduler::can_retry(2, &policy, false));
        assert!(!RetryScheduler::can_retry(3, &policy, false));
        assert!(!RetryScheduler::can_retry(4, &policy, false));
        assert!(!RetryScheduler::can_retry(0, &policy, true));
        assert!(!RetryScheduler::can_retry(0, &RetryPolicy::no_retry(), false));
    }

    #[test]
    fn test_unbounded_max_interval_saturates() {
        let policy = RetryPolicy {
            interval: Duration::from_secs_f64(1e19),
            max_interval: Duration::MAX,
            ..policy()
        };
        assert!(policy.validate("huge").is_ok());

        let mut rng = StdRng::seed_from_u64(3);
        for attempt in 1..5 {
            for _ in 0..100 {
                let delay = RetryScheduler::next_retry_delay_with(attempt, &policy, &mut rng);
                assert!(delay >= Duration::from_secs_f64(1e19 * 0.75));
            }
        }
    }

    #[test]
    fn test_first_retry_has_no_jitter() {
        let policy = policy();
        for _ in 0..20 {
            assert_eq!(
                RetryScheduler::next_retry_delay(0, &policy),
                Duration::from_secs(30)
            );
        }
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = policy();
        let mut rng = StdRng::seed_from_u64(7);
        for attempt in 1..10 {
            let nominal = RetryScheduler::nominal_delay(attempt, &policy).as_secs_f64();
            for _ in 0..200 {
                let delay = RetryScheduler::next_retry_delay_with(attempt, &policy, &mut rng)
                    .as_secs_f64();
                assert!(delay >= nominal * 0.75 - 1e-6, "{delay} < {nominal}*0.75");
                assert!(delay <= nominal * 1.25 + 1e-6, "{delay} > {nominal}*1.25");
                assert!(delay <= policy.max_interval.as_secs_f64() * 1.25 + 1e-6);
            }
        }
    }

    #[test]
    fn test_mean_delay_grows_with_attempts() {
        let policy = policy();
        let mut rng = StdRng::seed_from_u64(42);
        let mean = |attempt: u32, rng: &mut StdRng| {
            let total: f64 = (0..500)
                .map(|_| {
                    RetryScheduler::next_retry_delay_with(attempt, &policy, rng).as_secs_f64()
                })
                .sum();
            total / 500.0
        };
        let means: Vec<f64> = (0..6).map(|attempt| mean(attempt, &mut rng)).collect();
        for pair in means.windows(2) {
            assert!(pair[1] >= pair[0] * 0.9, "{means:?}");
        }
    }
}
