//! Injectable time source.
//!
//! Everything that reads the time or waits (rate limiting, archive cutoff,
//! retry backoff) goes through a [`Clock`], so tests can move time forward
//! without sleeping.

use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::warn;

#[async_trait]
pub trait Clock: Send + Sync {
    /// Monotonic time, for measuring windows and delays.
    fn now(&self) -> Instant;

    /// Wall-clock time, for deciding what the archive has published.
    fn utc_now(&self) -> DateTime<Utc>;

    async fn sleep(&self, duration: Duration);
}

/// The real clock.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn utc_now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// A clock that only moves when told to. `sleep` advances it instantly and
/// records the requested delay.
pub struct ManualClock {
    origin: Instant,
    origin_utc: DateTime<Utc>,
    state: Mutex<ManualState>,
}

#[derive(Default)]
struct ManualState {
    elapsed: Duration,
    sleeps: Vec<Duration>,
}

impl ManualClock {
    pub fn new(origin_utc: DateTime<Utc>) -> Self {
        Self {
            origin: Instant::now(),
            origin_utc,
            state: Mutex::new(ManualState::default()),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, ManualState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            warn!("Manual clock mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    pub fn advance(&self, by: Duration) {
        self.lock_state().elapsed += by;
    }

    /// Delays passed to `sleep`, in call order.
    pub fn sleeps(&self) -> Vec<Duration> {
        self.lock_state().sleeps.clone()
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + self.lock_state().elapsed
    }

    fn utc_now(&self) -> DateTime<Utc> {
        let elapsed = self.lock_state().elapsed;
        self.origin_utc
            + chrono::Duration::from_std(elapsed).unwrap_or_else(|_| chrono::Duration::zero())
    }

    async fn sleep(&self, duration: Duration) {
        let mut state = self.lock_state();
        state.elapsed += duration;
        state.sleeps.push(duration);
    }
}
