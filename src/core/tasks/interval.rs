// src/core/tasks/interval.rs

//! The interval worker skeleton shared by source and destination workers
//! (`spec.md` §4.3): `prepare` → loop{ `get_data` → `send_data` → oneshot
//! check → interruptible `wait` } → `cleanup`, with two independent
//! terminate signals and the shared 429 back-off formula.
//!
//! Grounded on the teacher's `run(shutdown_rx: broadcast::Receiver<()>)`
//! convention for every background task
//! (`examples/spineldb-spineldb/src/core/tasks/eviction.rs`,
//! `.../persistence.rs`), generalized to two independent terminate
//! sources (worker-local `stop()` plus a supervisor-wide signal) instead
//! of one.

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::debug;

use crate::config::MIN_SEND_INTERVAL_SECS;

/// Tracks both terminate signals for one worker: an internal flag the
/// worker (or its owner) sets via `stop()`, and an external signal shared
/// by every worker spawned by one Executor run.
#[derive(Clone)]
pub struct Terminator {
    internal: Arc<AtomicBool>,
    external: watch::Receiver<bool>,
}

impl Terminator {
    pub fn new(external: watch::Receiver<bool>) -> Self {
        Self {
            internal: Arc::new(AtomicBool::new(false)),
            external,
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.internal.load(Ordering::SeqCst) || *self.external.borrow()
    }

    pub fn stop(&self) {
        self.internal.store(true, Ordering::SeqCst);
    }

    pub(crate) fn internal_flag(&self) -> Arc<AtomicBool> {
        self.internal.clone()
    }

    /// Sleeps `secs` seconds, checked in 1-second ticks so a terminate
    /// request interrupts the wait promptly (`spec.md` §4.3).
    pub async fn wait(&self, secs: u64) {
        for _ in 0..secs {
            if self.is_terminated() {
                return;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }
}

/// A handle an owner (the Executor) uses to stop and join a spawned
/// worker, independent of the worker's own logic.
pub struct WorkerHandle {
    internal: Arc<AtomicBool>,
    external: watch::Receiver<bool>,
    join: tokio::task::JoinHandle<()>,
}

impl WorkerHandle {
    pub fn new(internal: Arc<AtomicBool>, external: watch::Receiver<bool>, join: tokio::task::JoinHandle<()>) -> Self {
        Self { internal, external, join }
    }

    /// Sets this worker's internal terminate flag.
    pub fn stop(&self) {
        self.internal.store(true, Ordering::SeqCst);
    }

    /// True once either terminate signal has been observed. Does not by
    /// itself guarantee the task has exited; pair with `join`.
    pub fn is_terminated(&self) -> bool {
        self.internal.load(Ordering::SeqCst) || *self.external.borrow()
    }

    /// Awaits the underlying task's completion.
    pub async fn join(self) {
        if let Err(e) = self.join.await {
            debug!("worker task panicked while joining: {e:?}");
        }
    }
}

/// Contract an interval-driven worker implements. `prepare`/`cleanup`
/// default to no-ops; `get_data`/`send_data` are the only required
/// methods.
#[async_trait]
pub trait IntervalTask: Send {
    type Data: Send;

    async fn prepare(&mut self) {}

    async fn get_data(&mut self, term: &Terminator) -> Self::Data;

    async fn send_data(&mut self, data: Self::Data, term: &Terminator);

    async fn cleanup(&mut self) {}
}

/// Runs the interval skeleton described in `spec.md` §4.3 against `task`
/// until `term` is terminated, with `oneshot` controlling whether the
/// loop exits after its first cycle.
pub async fn run_interval_loop<T: IntervalTask>(mut task: T, term: Terminator, interval_secs: u64, oneshot: bool) {
    task.prepare().await;
    loop {
        if term.is_terminated() {
            break;
        }
        let start = Instant::now();
        let data = task.get_data(&term).await;
        task.send_data(data, &term).await;

        if oneshot {
            break;
        }
        if term.is_terminated() {
            break;
        }

        let elapsed = start.elapsed();
        let remaining = Duration::from_secs(interval_secs).saturating_sub(elapsed);
        term.wait(remaining.as_secs()).await;
    }
    task.cleanup().await;
}

/// The shared 429 back-off formula (`spec.md` §4.3):
/// `wait = retry_after if retry_after >= MinimumSendInterval else
/// (MinimumSendInterval * number_of_failures) or MinimumSendInterval`.
pub fn handle_429(retry_after: Option<u64>, number_of_failures: u64) -> u64 {
    if let Some(wait) = retry_after
        && wait >= MIN_SEND_INTERVAL_SECS
    {
        return wait;
    }
    if number_of_failures > 0 {
        MIN_SEND_INTERVAL_SECS * number_of_failures
    } else {
        MIN_SEND_INTERVAL_SECS
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_after_at_or_above_minimum_wins() {
        assert_eq!(handle_429(Some(120), 1), 120);
        assert_eq!(handle_429(Some(MIN_SEND_INTERVAL_SECS), 0), MIN_SEND_INTERVAL_SECS);
    }

    #[test]
    fn retry_after_below_minimum_falls_back_to_failure_count() {
        assert_eq!(handle_429(Some(5), 3), MIN_SEND_INTERVAL_SECS * 3);
    }

    #[test]
    fn no_retry_after_and_no_failures_falls_back_to_minimum() {
        assert_eq!(handle_429(None, 0), MIN_SEND_INTERVAL_SECS);
    }

    #[test]
    fn no_retry_after_scales_with_failure_count() {
        assert_eq!(handle_429(None, 4), MIN_SEND_INTERVAL_SECS * 4);
    }

    #[tokio::test]
    async fn terminator_wait_is_interrupted_by_stop() {
        let (_tx, rx) = watch::channel(false);
        let term = Terminator::new(rx);
        let term2 = term.clone();
        let handle = tokio::spawn(async move {
            term2.wait(60).await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        term.stop();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("wait should return promptly after stop()")
            .unwrap();
    }

    #[tokio::test]
    async fn external_signal_terminates_every_clone() {
        let (tx, rx) = watch::channel(false);
        let term = Terminator::new(rx);
        assert!(!term.is_terminated());
        tx.send(true).unwrap();
        assert!(term.is_terminated());
    }
}
