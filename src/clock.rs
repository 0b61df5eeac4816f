//! Time sources and periodic tick scheduling.
//!
//! The engine never reads wall-clock time directly: it asks an injected
//! [`EngineClock`]. Tests and replays use [`ManualClock`] and advance it by
//! hand; services use [`SystemClock`] and drive ticks with a [`TickSchedule`].

use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use crate::buffer::Timestamp;
use crate::error::{EngineError, Result};

pub trait EngineClock: Send + Sync + Debug {
    /// Milliseconds since the Unix epoch (or since the start of a replay).
    fn now_ms(&self) -> Timestamp;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl EngineClock for SystemClock {
    fn now_ms(&self) -> Timestamp {
        chrono::Utc::now().timestamp_millis().max(0) as u64
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        Self {
            now: AtomicU64::new(start),
        }
    }

    pub fn set(&self, ts: Timestamp) {
        self.now.store(ts, Ordering::SeqCst);
    }

    /// Move forward and return the new time.
    pub fn advance(&self, ms: u64) -> Timestamp {
        self.now.fetch_add(ms, Ordering::SeqCst) + ms
    }
}

impl EngineClock for ManualClock {
    fn now_ms(&self) -> Timestamp {
        self.now.load(Ordering::SeqCst)
    }
}

/// A periodic task on the ambient tokio runtime.
///
/// One schedule drives one subject, so its ticks run strictly one after
/// another. Late ticks are skipped rather than bunched up. Dropping the
/// schedule cancels it.
#[derive(Debug)]
pub struct TickSchedule {
    period: Duration,
    handle: JoinHandle<()>,
}

impl TickSchedule {
    /// Spawn `on_tick` every `period`. The loop ends when `on_tick` returns
    /// false or the schedule is cancelled.
    pub fn spawn<F>(period: Duration, mut on_tick: F) -> Result<Self>
    where
        F: FnMut() -> bool + Send + 'static,
    {
        let runtime = Handle::try_current().map_err(|e| EngineError::NoRuntime(e.to_string()))?;
        let period = period.max(Duration::from_millis(1));
        let handle = runtime.spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // First tick completes immediately; wait one full period instead.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if !on_tick() {
                    break;
                }
            }
        });
        Ok(Self { period, handle })
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn cancel(&self) {
        self.handle.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for TickSchedule {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(1_000);
        assert_eq!(clock.now_ms(), 1_000);
        assert_eq!(clock.advance(500), 1_500);
        clock.set(10);
        assert_eq!(clock.now_ms(), 10);
    }

    #[test]
    fn test_system_clock_is_epoch_ms() {
        // 2020-01-01
        assert!(SystemClock.now_ms() > 1_577_836_800_000);
    }

    #[test]
    fn test_spawn_without_runtime_fails() {
        let err = TickSchedule::spawn(Duration::from_millis(10), || true).unwrap_err();
        assert_eq!(err.code(), "no_runtime");
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_ticks_and_stops() {
        let count = Arc::new(AtomicU64::new(0));
        let c = count.clone();
        let schedule = TickSchedule::spawn(Duration::from_millis(100), move || {
            c.fetch_add(1, Ordering::SeqCst) + 1 < 3
        })
        .unwrap();

        tokio::time::sleep(Duration::from_millis(1_000)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert!(schedule.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_ticks() {
        let count = Arc::new(AtomicU64::new(0));
        let c = count.clone();
        let schedule = TickSchedule::spawn(Duration::from_millis(100), move || {
            c.fetch_add(1, Ordering::SeqCst);
            true
        })
        .unwrap();

        tokio::time::sleep(Duration::from_millis(250)).await;
        schedule.cancel();
        let seen = count.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(1_000)).await;
        assert_eq!(count.load(Ordering::SeqCst), seen);
        assert!(seen >= 2);
    }
}
