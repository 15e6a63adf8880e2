//! Time source and timers used by the lease protocol

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Wall clock plus the ability to wait.
///
/// Lease timestamps are compared across contexts, so `now` must be wall
/// time shared by every context of the same store.
#[async_trait]
pub trait Clock: Send + Sync {
    /// Current wall-clock time
    fn now(&self) -> DateTime<Utc>;

    /// Suspend the calling task for `duration`
    async fn sleep(&self, duration: Duration);

    /// Suspend until `deadline`; returns immediately if it already passed
    async fn sleep_until(&self, deadline: DateTime<Utc>) {
        let remaining = deadline
            .signed_duration_since(self.now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        self.sleep(remaining).await;
    }
}

/// Production clock: `Utc::now` and tokio timers
#[derive(Debug, Clone, Copy, Default)]
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

/// Clock derived from tokio's time source.
///
/// Wall time is `epoch + elapsed tokio time`, so under a paused runtime
/// (`#[tokio::test(start_paused = true)]`) every context sharing the clock
/// sees the same deterministic timeline, and `tokio::time::advance` moves
/// both timestamps and timers.
#[derive(Debug, Clone, Copy)]
pub struct VirtualClock {
    epoch: DateTime<Utc>,
    origin: tokio::time::Instant,
}

impl VirtualClock {
    /// Start the timeline at `epoch`. Must be called inside a tokio runtime.
    pub fn starting_at(epoch: DateTime<Utc>) -> Self {
        Self {
            epoch,
            origin: tokio::time::Instant::now(),
        }
    }

    /// Timeline that starts at the unix epoch, so `now()` reads as elapsed millis
    pub fn from_zero() -> Self {
        Self::starting_at(DateTime::<Utc>::default())
    }

    /// Milliseconds since the start of the timeline
    pub fn elapsed_millis(&self) -> i64 {
        self.now().signed_duration_since(self.epoch).num_milliseconds()
    }
}

#[async_trait]
impl Clock for VirtualClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = tokio::time::Instant::now().duration_since(self.origin);
        self.epoch + crate::lease::to_chrono(elapsed)
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}
