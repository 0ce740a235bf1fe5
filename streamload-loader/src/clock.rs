use crate::config::PollConfig;
use crate::LoaderResult;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Source of monotonic time for time-sliced loading. Injected so tests can drive time by hand.
pub trait Clock: Send + Sync {
    /// Time since an arbitrary, fixed epoch
    fn now(&self) -> Duration;
}

pub struct SystemClock {
    epoch: Instant,
}

impl Default for SystemClock {
    fn default() -> Self {
        SystemClock {
            epoch: Instant::now(),
        }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.epoch.elapsed()
    }
}

/// A clock that only moves when told to
#[derive(Default)]
pub struct ManualClock {
    nanos: AtomicU64,
}

impl ManualClock {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn advance(
        &self,
        duration: Duration,
    ) {
        self.nanos
            .fetch_add(duration.as_nanos() as u64, Ordering::AcqRel);
    }

    pub fn set(
        &self,
        now: Duration,
    ) {
        self.nanos.store(now.as_nanos() as u64, Ordering::Release);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        Duration::from_nanos(self.nanos.load(Ordering::Acquire))
    }
}

pub trait Sleeper: Send + Sync {
    fn sleep(
        &self,
        duration: Duration,
    );
}

#[derive(Default)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(
        &self,
        duration: Duration,
    ) {
        std::thread::sleep(duration);
    }
}

/// Records requested sleeps instead of sleeping. If given a clock, the clock is advanced by each
/// sleep so time-based logic still observes the delay.
#[derive(Default)]
pub struct RecordingSleeper {
    sleeps: Mutex<Vec<Duration>>,
    clock: Option<Arc<ManualClock>>,
}

impl RecordingSleeper {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn with_clock(clock: Arc<ManualClock>) -> Self {
        RecordingSleeper {
            sleeps: Default::default(),
            clock: Some(clock),
        }
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().unwrap().clone()
    }

    pub fn total_slept(&self) -> Duration {
        self.sleeps.lock().unwrap().iter().sum()
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(
        &self,
        duration: Duration,
    ) {
        self.sleeps.lock().unwrap().push(duration);
        if let Some(clock) = &self.clock {
            clock.advance(duration);
        }
        // Still let other threads run, a poll loop is usually waiting on one of them
        std::thread::yield_now();
    }
}

/// Bounded back-off poll loop. Spins a few times, then sleeps with a doubling delay up to a cap.
#[derive(Clone)]
pub struct Poller {
    config: PollConfig,
    sleeper: Arc<dyn Sleeper>,
}

impl Poller {
    pub fn new(
        config: PollConfig,
        sleeper: Arc<dyn Sleeper>,
    ) -> Self {
        Poller { config, sleeper }
    }

    pub fn sleeper(&self) -> &Arc<dyn Sleeper> {
        &self.sleeper
    }

    /// Waits after the given failed attempt. Returns how long was slept.
    pub fn back_off(
        &self,
        attempt: u32,
    ) -> Duration {
        if attempt < self.config.spin_iterations {
            std::hint::spin_loop();
            return Duration::ZERO;
        }

        let doublings = (attempt - self.config.spin_iterations).min(16);
        let sleep_us = self
            .config
            .initial_sleep_us
            .saturating_mul(1 << doublings)
            .min(self.config.max_sleep_us)
            .max(1);
        let duration = Duration::from_micros(sleep_us);
        self.sleeper.sleep(duration);
        duration
    }

    pub fn poll_until<F: FnMut() -> bool>(
        &self,
        mut condition: F,
    ) -> Duration {
        let mut attempt = 0;
        let mut slept = Duration::ZERO;
        while !condition() {
            slept += self.back_off(attempt);
            attempt = attempt.saturating_add(1);
        }
        slept
    }

    pub fn try_poll_until<F: FnMut() -> LoaderResult<bool>>(
        &self,
        mut condition: F,
    ) -> LoaderResult<Duration> {
        let mut attempt = 0;
        let mut slept = Duration::ZERO;
        while !condition()? {
            slept += self.back_off(attempt);
            attempt = attempt.saturating_add(1);
        }
        Ok(slept)
    }
}
