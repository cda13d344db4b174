//! Failure-rate driven requeue delay, one controller per job.
//!
//! Every requeue records a failure in a sliding one-minute window. A monitor
//! task recomputes the job's delay from that rate on a fixed tick; the
//! pipeline only reads the current value.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::warn;

/// Map a failures-per-minute rate to a requeue delay in milliseconds.
pub fn delay_for_rate(rate: f64) -> u64 {
    if rate > 100.0 {
        10_000
    } else if rate > 10.0 {
        1_000
    } else if rate > 5.0 {
        500
    } else {
        50
    }
}

/// Sliding-window event counter.
#[derive(Debug)]
pub struct RateMeter {
    window: Duration,
    events: VecDeque<Instant>,
}

impl RateMeter {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            events: VecDeque::new(),
        }
    }

    pub fn mark(&mut self, at: Instant) {
        self.events.push_back(at);
    }

    /// Events in the window ending at `now`, scaled to a per-minute rate.
    pub fn rate_per_minute(&mut self, now: Instant) -> f64 {
        while let Some(&oldest) = self.events.front() {
            if now.duration_since(oldest) >= self.window {
                self.events.pop_front();
            } else {
                break;
            }
        }
        let window_secs = self.window.as_secs_f64();
        if window_secs == 0.0 {
            return 0.0;
        }
        self.events.len() as f64 * 60.0 / window_secs
    }
}

/// Per-job failure meter plus the delay derived from it.
#[derive(Debug)]
pub struct DelayController {
    job: String,
    meter: Mutex<RateMeter>,
    delay_ms: AtomicU64,
}

impl DelayController {
    pub fn new(job: impl Into<String>, window: Duration, initial_delay: Duration) -> Self {
        Self {
            job: job.into(),
            meter: Mutex::new(RateMeter::new(window)),
            delay_ms: AtomicU64::new(initial_delay.as_millis() as u64),
        }
    }

    /// Record one failure (a task that must be requeued).
    pub fn record_failure(&self) {
        lock(&self.meter).mark(Instant::now());
    }

    pub fn current_delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms.load(Ordering::Relaxed))
    }

    pub fn failure_rate(&self) -> f64 {
        lock(&self.meter).rate_per_minute(Instant::now())
    }

    /// Recompute the delay from the current rate. Returns the new delay.
    pub fn recompute(&self) -> Duration {
        let rate = self.failure_rate();
        let next = delay_for_rate(rate);
        let previous = self.delay_ms.swap(next, Ordering::Relaxed);
        if previous != next {
            warn!(
                job = %self.job,
                old_delay_ms = previous,
                new_delay_ms = next,
                rate,
                "Requeue delay changed"
            );
        }
        Duration::from_millis(next)
    }
}

/// Recompute `controller` every `tick` until it is dropped.
pub fn spawn_monitor(controller: &Arc<DelayController>, tick: Duration) -> JoinHandle<()> {
    let controller = Arc::downgrade(controller);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(tick);
        // The first tick completes immediately.
        interval.tick().await;
        loop {
            interval.tick().await;
            let Some(controller) = controller.upgrade() else {
                break;
            };
            controller.recompute();
        }
    })
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> DelayController {
        DelayController::new("forecast", Duration::from_secs(60), Duration::from_millis(50))
    }

    fn fail(controller: &DelayController, n: usize) {
        for _ in 0..n {
            controller.record_failure();
        }
    }

    #[test]
    fn thresholds_highest_first() {
        assert_eq!(delay_for_rate(101.0), 10_000);
        assert_eq!(delay_for_rate(100.0), 1_000);
        assert_eq!(delay_for_rate(11.0), 1_000);
        assert_eq!(delay_for_rate(10.0), 500);
        assert_eq!(delay_for_rate(6.0), 500);
        assert_eq!(delay_for_rate(5.0), 50);
        assert_eq!(delay_for_rate(0.0), 50);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_counts_drive_delay() {
        let c = controller();
        fail(&c, 101);
        assert_eq!(c.recompute(), Duration::from_millis(10_000));

        let c = controller();
        fail(&c, 6);
        assert_eq!(c.recompute(), Duration::from_millis(500));

        let c = controller();
        fail(&c, 2);
        assert_eq!(c.recompute(), Duration::from_millis(50));
        assert_eq!(c.current_delay(), Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn failures_age_out_of_the_window() {
        let c = controller();
        fail(&c, 20);
        assert_eq!(c.recompute(), Duration::from_millis(1_000));

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(c.failure_rate(), 0.0);
        assert_eq!(c.recompute(), Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn monitor_recomputes_on_tick() {
        let c = Arc::new(controller());
        let handle = spawn_monitor(&c, Duration::from_secs(1));

        fail(&c, 6);
        assert_eq!(c.current_delay(), Duration::from_millis(50));

        tokio::time::sleep(Duration::from_millis(1_100)).await;
        assert_eq!(c.current_delay(), Duration::from_millis(500));

        drop(c);
        tokio::time::sleep(Duration::from_millis(1_100)).await;
        assert!(handle.is_finished());
    }
}
