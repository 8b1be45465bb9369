//! Background garbage collection timer.
//!
//! The timer itself knows nothing about the manager: it runs a sweep closure
//! every interval until stopped or until the closure reports that its target
//! is gone. Start and stop are idempotent. Sweeps may write to a blocking
//! storage backend, so each one runs on tokio's blocking pool.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

use crate::error::{Result, StateError};

/// Outcome of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcReport {
    /// Entries removed because their TTL elapsed.
    pub expired: usize,
    /// Entries removed to get back under the size limit.
    pub evicted: usize,
}

impl GcReport {
    pub fn total(&self) -> usize {
        self.expired + self.evicted
    }
}

enum GcState {
    Stopped,
    Running {
        handle: JoinHandle<()>,
        interval: Duration,
    },
}

/// Lifecycle of the periodic sweep task.
pub(crate) struct GcTimer {
    state: Mutex<GcState>,
}

impl GcTimer {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(GcState::Stopped),
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        matches!(&*self.state.lock(), GcState::Running { handle, .. } if !handle.is_finished())
    }

    /// Interval of the running timer, if any.
    pub(crate) fn interval(&self) -> Option<Duration> {
        match &*self.state.lock() {
            GcState::Running { interval, .. } => Some(*interval),
            GcState::Stopped => None,
        }
    }

    /// Spawn the sweep loop on the current tokio runtime.
    ///
    /// `sweep` returns `false` once there is nothing left to sweep, which ends
    /// the loop. Calling `start` while running is a no-op.
    pub(crate) fn start<F>(&self, interval: Duration, sweep: F) -> Result<()>
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        let mut state = self.state.lock();
        if let GcState::Running { handle, .. } = &*state {
            if !handle.is_finished() {
                return Ok(());
            }
        }

        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| StateError::NoRuntime(e.to_string()))?;
        let period = interval.max(Duration::from_millis(1));
        let sweep = Arc::new(sweep);

        let handle = runtime.spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                trace!("GC tick");
                let sweep = Arc::clone(&sweep);
                match tokio::task::spawn_blocking(move || sweep()).await {
                    Ok(true) => {}
                    Ok(false) => {
                        debug!("GC target dropped, stopping timer");
                        break;
                    }
                    Err(e) => warn!(error = %e, "GC sweep failed"),
                }
            }
        });

        debug!(interval_ms = period.as_millis() as u64, "GC timer started");
        *state = GcState::Running {
            handle,
            interval: period,
        };
        Ok(())
    }

    /// Cancel the timer. Returns whether one was running.
    pub(crate) fn stop(&self) -> bool {
        let previous = std::mem::replace(&mut *self.state.lock(), GcState::Stopped);
        match previous {
            GcState::Running { handle, .. } => {
                handle.abort();
                debug!("GC timer stopped");
                true
            }
            GcState::Stopped => false,
        }
    }
}

impl Drop for GcTimer {
    fn drop(&mut self) {
        if let GcState::Running { handle, .. } = &*self.state.get_mut() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_report_total() {
        let report = GcReport {
            expired: 2,
            evicted: 3,
        };
        assert_eq!(report.total(), 5);
    }

    #[test]
    fn test_start_without_runtime_fails() {
        let timer = GcTimer::new();
        let err = timer.start(Duration::from_secs(1), || true).unwrap_err();
        assert!(matches!(err, StateError::NoRuntime(_)));
        assert!(!timer.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_every_interval() {
        let timer = GcTimer::new();
        let ticks = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&ticks);
        timer
            .start(Duration::from_secs(10), move || {
                counter.fetch_add(1, Ordering::SeqCst);
                true
            })
            .unwrap();
        assert_eq!(timer.interval(), Some(Duration::from_secs(10)));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(21)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_and_stop_are_idempotent() {
        let timer = GcTimer::new();
        let ticks = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let counter = Arc::clone(&ticks);
            timer
                .start(Duration::from_secs(1), move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    true
                })
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 1);

        assert!(timer.stop());
        assert!(!timer.stop());
        assert!(!timer.is_running());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_sweep_keeps_timer_alive() {
        let timer = GcTimer::new();
        let ticks = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&ticks);
        timer
            .start(Duration::from_secs(1), move || {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    panic!("first sweep fails");
                }
                true
            })
            .unwrap();

        tokio::time::sleep(Duration::from_millis(2_500)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 2);
        assert!(timer.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_ends_when_sweep_returns_false() {
        let timer = GcTimer::new();
        timer.start(Duration::from_secs(1), || false).unwrap();

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!timer.is_running());
    }
}
