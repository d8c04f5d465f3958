use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Time source for the engine, retry loop and TTL cache.
#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
    async fn sleep(&self, duration: Duration);
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Test clock: `sleep` returns immediately after moving time forward and
/// remembering the requested delay.
#[derive(Clone, Debug)]
pub struct ManualClock {
    state: Arc<Mutex<ManualClockState>>,
}

#[derive(Debug)]
struct ManualClockState {
    now: DateTime<Utc>,
    sleeps: Vec<Duration>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self { state: Arc::new(Mutex::new(ManualClockState { now: start, sleeps: Vec::new() })) }
    }

    pub fn advance(&self, duration: Duration) {
        let Ok(delta) = chrono::Duration::from_std(duration) else {
            return;
        };
        self.with_state(|state| {
            if let Some(next) = state.now.checked_add_signed(delta) {
                state.now = next;
            }
        });
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        self.with_state(|state| state.sleeps.clone())
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut ManualClockState) -> T) -> T {
        match self.state.lock() {
            Ok(mut state) => f(&mut state),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.with_state(|state| state.now)
    }

    async fn sleep(&self, duration: Duration) {
        self.with_state(|state| state.sleeps.push(duration));
        self.advance(duration);
        tokio::task::yield_now().await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::{TimeZone, Utc};

    use super::{Clock, ManualClock};

    #[tokio::test]
    async fn manual_clock_advances_on_sleep_and_records_delays() {
        let start = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).single().expect("valid instant");
        let clock = ManualClock::new(start);

        clock.sleep(Duration::from_secs(2)).await;
        clock.sleep(Duration::from_millis(500)).await;

        assert_eq!(clock.sleeps(), vec![Duration::from_secs(2), Duration::from_millis(500)]);
        assert_eq!(clock.now() - start, chrono::Duration::milliseconds(2_500));
    }

    #[test]
    fn manual_clock_advance_does_not_record_sleep() {
        let clock = ManualClock::default();
        let before = clock.now();

        clock.advance(Duration::from_secs(301));

        assert!(clock.sleeps().is_empty());
        assert_eq!(clock.now() - before, chrono::Duration::seconds(301));
    }
}
