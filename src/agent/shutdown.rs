//! Drain-then-exit shutdown.
//!
//! The first trigger wins; later ones are no-ops. Once triggered, the
//! in-flight counter is polled until it reaches zero or the hard-kill
//! deadline passes, whichever comes first. The library never exits the
//! process itself: the result is published as a [`ShutdownOutcome`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::ShutdownConfig;

/// Clean shutdown (external signal or caller request).
pub const EXIT_GRACEFUL: i32 = 0;
/// An engine reported a fatal error.
pub const EXIT_ENGINE_ERROR: i32 = 1;
/// The cluster could not be reached.
pub const EXIT_CLUSTER_UNREACHABLE: i32 = 2;

/// Number of tasks currently inside a pipeline.
#[derive(Debug, Clone, Default)]
pub struct InFlight(Arc<AtomicUsize>);

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one task in until the guard drops.
    pub fn enter(&self) -> InFlightGuard {
        self.0.fetch_add(1, Ordering::SeqCst);
        InFlightGuard(Arc::clone(&self.0))
    }

    pub fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

/// Decrements the in-flight count on drop.
#[derive(Debug)]
pub struct InFlightGuard(Arc<AtomicUsize>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// How shutdown ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ShutdownOutcome {
    /// Exit code requested by the first trigger.
    pub code: i32,
    /// `true` if every in-flight task finished before the deadline.
    pub drained: bool,
}

/// One-shot shutdown guard.
pub struct Shutdown {
    config: ShutdownConfig,
    started: AtomicBool,
    outcome: Arc<watch::Sender<Option<ShutdownOutcome>>>,
}

impl Shutdown {
    pub fn new(config: ShutdownConfig) -> Self {
        let (outcome, _) = watch::channel(None);
        Self {
            config,
            started: AtomicBool::new(false),
            outcome: Arc::new(outcome),
        }
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Outcome, once shutdown has finished.
    pub fn outcome(&self) -> Option<ShutdownOutcome> {
        *self.outcome.borrow()
    }

    /// Start shutdown with `code`. Returns `false` if already started.
    pub fn trigger(&self, code: i32, in_flight: InFlight) -> bool {
        if self.started.swap(true, Ordering::SeqCst) {
            debug!(code, "Shutdown already in progress");
            return false;
        }

        info!(code, in_flight = in_flight.count(), "Shutting down");

        let timeout = self.config.timeout;
        let poll_interval = self.config.poll_interval;
        let outcome = Arc::clone(&self.outcome);

        tokio::spawn(async move {
            let deadline = tokio::time::sleep(timeout);
            tokio::pin!(deadline);
            let mut poll = tokio::time::interval(poll_interval);

            let drained = loop {
                tokio::select! {
                    _ = &mut deadline => break false,
                    _ = poll.tick() => {
                        if in_flight.count() == 0 {
                            break true;
                        }
                    }
                }
            };

            if drained {
                info!(code, "All tasks drained");
            } else {
                warn!(
                    code,
                    in_flight = in_flight.count(),
                    timeout_ms = timeout.as_millis() as u64,
                    "Shutdown deadline reached with tasks in flight"
                );
            }
            outcome.send_replace(Some(ShutdownOutcome { code, drained }));
        });

        true
    }

    /// Wait for shutdown to finish.
    pub async fn wait(&self) -> ShutdownOutcome {
        let mut rx = self.outcome.subscribe();
        loop {
            if let Some(outcome) = *rx.borrow_and_update() {
                return outcome;
            }
            if rx.changed().await.is_err() {
                return ShutdownOutcome {
                    code: EXIT_GRACEFUL,
                    drained: false,
                };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tokio::time::Instant;

    fn shutdown() -> Shutdown {
        Shutdown::new(ShutdownConfig {
            timeout: Duration::from_secs(5),
            poll_interval: Duration::from_secs(1),
        })
    }

    #[test]
    fn guard_counts_in_and_out() {
        let in_flight = InFlight::new();
        let a = in_flight.enter();
        let b = in_flight.enter();
        assert_eq!(in_flight.count(), 2);
        drop(a);
        assert_eq!(in_flight.count(), 1);
        drop(b);
        assert_eq!(in_flight.count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn second_trigger_is_a_no_op() {
        let s = shutdown();
        let in_flight = InFlight::new();

        assert!(s.trigger(EXIT_GRACEFUL, in_flight.clone()));
        assert!(!s.trigger(EXIT_ENGINE_ERROR, in_flight));

        let outcome = s.wait().await;
        assert_eq!(outcome.code, EXIT_GRACEFUL);
        assert!(s.is_started());
    }

    #[tokio::test(start_paused = true)]
    async fn idle_agent_exits_immediately() {
        let s = shutdown();
        let start = Instant::now();
        s.trigger(EXIT_ENGINE_ERROR, InFlight::new());

        let outcome = s.wait().await;
        assert_eq!(
            outcome,
            ShutdownOutcome {
                code: EXIT_ENGINE_ERROR,
                drained: true
            }
        );
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_in_flight_tasks() {
        let s = shutdown();
        let in_flight = InFlight::new();
        let guard = in_flight.enter();
        let start = Instant::now();
        s.trigger(EXIT_GRACEFUL, in_flight);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1_500)).await;
            drop(guard);
        });

        let outcome = s.wait().await;
        assert!(outcome.drained);
        // Observed on the first poll after the task finished.
        assert_eq!(start.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn hard_deadline_forces_exit() {
        let s = shutdown();
        let in_flight = InFlight::new();
        let _stuck = in_flight.enter();
        let start = Instant::now();
        s.trigger(EXIT_CLUSTER_UNREACHABLE, in_flight);

        let outcome = s.wait().await;
        assert_eq!(outcome.code, EXIT_CLUSTER_UNREACHABLE);
        assert!(!outcome.drained);
        assert_eq!(start.elapsed(), Duration::from_secs(5));
        assert_eq!(s.outcome(), Some(outcome));
    }
}
