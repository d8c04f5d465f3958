use std::fmt::Display;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::clock::Clock;
use crate::config::EngineConfig;

/// Errors that say whether another attempt could succeed.
pub trait RetryClassify {
    fn is_transient(&self) -> bool;
}

/// Exponential backoff between attempts, clamped to `[backoff_floor, backoff_ceiling]`.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Re-invocations after the first attempt.
    pub max_retries: u32,
    pub backoff_floor: Duration,
    pub backoff_ceiling: Duration,
    pub multiplier: f64,
    /// Fraction of the computed delay added or removed at random.
    pub jitter_ratio: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_floor: Duration::from_secs(2),
            backoff_ceiling: Duration::from_secs(10),
            multiplier: 2.0,
            jitter_ratio: 0.1,
        }
    }
}

impl From<&EngineConfig> for RetryPolicy {
    fn from(config: &EngineConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            backoff_floor: config.backoff_floor(),
            backoff_ceiling: config.backoff_ceiling(),
            jitter_ratio: config.jitter_ratio,
            ..Self::default()
        }
    }
}

impl RetryPolicy {
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Delay before retry number `retry` (1-based). `jitter_sample` is expected in
    /// `-1.0..=1.0`; the result never leaves the floor/ceiling band.
    pub fn delay_for(&self, retry: u32, jitter_sample: f64) -> Duration {
        let floor = self.backoff_floor.as_secs_f64();
        let ceiling = self.backoff_ceiling.as_secs_f64().max(floor);
        let exponent = retry.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base = (floor * self.multiplier.max(1.0).powi(exponent)).min(ceiling);
        let jitter = self.jitter_ratio.clamp(0.0, 1.0) * jitter_sample.clamp(-1.0, 1.0);
        let delay = (base * (1.0 + jitter)).clamp(floor, ceiling);
        if delay.is_finite() {
            Duration::from_secs_f64(delay)
        } else {
            self.backoff_ceiling
        }
    }

    fn sample_delay(&self, retry: u32) -> Duration {
        let sample = if self.jitter_ratio > 0.0 {
            rand::thread_rng().gen_range(-1.0..=1.0)
        } else {
            0.0
        };
        self.delay_for(retry, sample)
    }
}

/// Runs `attempt` until it succeeds, fails with a non-transient error, or the
/// policy's retries are used up. `retries` tracks re-invocations as they happen
/// so the count survives the future being dropped by an outer timeout.
pub async fn with_retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    clock: &dyn Clock,
    retries: &AtomicU32,
    mut attempt: F,
) -> Result<T, E>
where
    E: RetryClassify + Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut retry = 0;
    loop {
        match attempt(retry).await {
            Ok(value) => return Ok(value),
            Err(error) if error.is_transient() && retry < policy.max_retries => {
                retry += 1;
                retries.store(retry, Ordering::SeqCst);
                let delay = policy.sample_delay(retry);
                warn!(
                    event_name = "engine.execution.retrying",
                    retry,
                    max_retries = policy.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "transient failure; backing off before retry"
                );
                clock.sleep(delay).await;
            }
            Err(error) => return Err(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fmt;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use super::{with_retry, RetryClassify, RetryPolicy};
    use crate::clock::ManualClock;

    #[derive(Debug, PartialEq)]
    enum Failure {
        Flaky,
        Fatal,
    }

    impl fmt::Display for Failure {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{self:?}")
        }
    }

    impl RetryClassify for Failure {
        fn is_transient(&self) -> bool {
            matches!(self, Self::Flaky)
        }
    }

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy { max_retries, jitter_ratio: 0.0, ..RetryPolicy::default() }
    }

    #[test]
    fn delays_grow_exponentially_between_floor_and_ceiling() {
        let policy = policy(5);

        assert_eq!(policy.delay_for(1, 0.0), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2, 0.0), Duration::from_secs(4));
        assert_eq!(policy.delay_for(3, 0.0), Duration::from_secs(8));
        assert_eq!(policy.delay_for(4, 0.0), Duration::from_secs(10));
        assert_eq!(policy.delay_for(60, 0.0), Duration::from_secs(10));
    }

    #[test]
    fn jitter_stays_inside_the_band() {
        let policy = RetryPolicy { jitter_ratio: 0.5, ..RetryPolicy::default() };

        assert_eq!(policy.delay_for(1, -1.0), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2, 1.0), Duration::from_secs(6));
        assert_eq!(policy.delay_for(3, 1.0), Duration::from_secs(10));
        assert_eq!(policy.delay_for(2, 7.0), Duration::from_secs(6));
    }

    #[tokio::test]
    async fn succeeds_after_k_transient_failures_with_k_retries() {
        let clock = ManualClock::default();
        let retries = AtomicU32::new(0);
        let calls = AtomicU32::new(0);

        let result = with_retry(&policy(3), &clock, &retries, |_| async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(Failure::Flaky)
            } else {
                Ok("done")
            }
        })
        .await;

        assert_eq!(result, Ok("done"));
        assert_eq!(retries.load(Ordering::SeqCst), 2);
        assert_eq!(clock.sleeps(), vec![Duration::from_secs(2), Duration::from_secs(4)]);
    }

    #[tokio::test]
    async fn always_failing_operation_stops_at_max_retries() {
        let clock = ManualClock::default();
        let retries = AtomicU32::new(0);
        let calls = AtomicU32::new(0);

        let result: Result<(), Failure> = with_retry(&policy(3), &clock, &retries, |_| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Failure::Flaky)
        })
        .await;

        assert_eq!(result, Err(Failure::Flaky));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(retries.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_transient_failure_is_not_retried() {
        let clock = ManualClock::default();
        let retries = AtomicU32::new(0);

        let result: Result<(), Failure> =
            with_retry(&policy(3), &clock, &retries, |_| async { Err(Failure::Fatal) }).await;

        assert_eq!(result, Err(Failure::Fatal));
        assert_eq!(retries.load(Ordering::SeqCst), 0);
        assert!(clock.sleeps().is_empty());
    }

    #[tokio::test]
    async fn attempt_receives_retry_number() {
        let clock = ManualClock::default();
        let retries = AtomicU32::new(0);
        let seen = std::sync::Mutex::new(Vec::new());

        let _ = with_retry(&policy(2), &clock, &retries, |retry| {
            seen.lock().expect("lock").push(retry);
            async { Err::<(), _>(Failure::Flaky) }
        })
        .await;

        assert_eq!(*seen.lock().expect("lock"), vec![0, 1, 2]);
    }
}
