//! Hold-time policy and expiry tasks.
//!
//! A position is held for at most `hold`. The countdown for a position starts
//! at its entry time, and accrued time carried in the timer store survives
//! restarts.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tracing::debug;

use autoclose_core::Symbol;
use autoclose_persistence::{RestoreOutcome, TimerEntry};

/// Default hold time: 3 minutes.
pub const DEFAULT_HOLD: Duration = Duration::from_secs(180);

// ============================================================================
// HoldTimer
// ============================================================================

/// Hold-time policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HoldTimer {
    hold: Duration,
}

impl HoldTimer {
    #[must_use]
    pub fn new(hold: Duration) -> Self {
        Self { hold }
    }

    #[must_use]
    pub fn hold(&self) -> Duration {
        self.hold
    }

    /// Start instant for a timer armed on a position opened at `entry_time`.
    ///
    /// Clamped to `now` so clock skew never produces a negative elapsed.
    #[must_use]
    pub fn start_for(&self, entry_time: DateTime<Utc>, now: DateTime<Utc>) -> DateTime<Utc> {
        entry_time.min(now)
    }

    /// Time left on `entry` at `now`. Zero once the hold has elapsed.
    #[must_use]
    pub fn delay_for(&self, entry: &TimerEntry, now: DateTime<Utc>) -> Duration {
        match entry.outcome(now, self.hold) {
            RestoreOutcome::Rearm(remaining) => remaining,
            RestoreOutcome::Expired => Duration::ZERO,
        }
    }
}

impl Default for HoldTimer {
    fn default() -> Self {
        Self::new(DEFAULT_HOLD)
    }
}

// ============================================================================
// Expiry task
// ============================================================================

/// Sleep for `delay`, then run `on_expire` as its own task.
///
/// The returned handle only covers the sleep: aborting it after expiry never
/// cancels the spawned `on_expire` task, so the expiry work may safely abort
/// its own timer.
pub fn spawn_expiry<F, Fut>(symbol: Symbol, delay: Duration, on_expire: F) -> JoinHandle<()>
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        debug!(symbol = %symbol, delay_ms = delay.as_millis() as u64, "Hold timer expired");
        tokio::spawn(on_expire());
    })
}
