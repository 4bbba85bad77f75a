//! Single-worker, delay-capable job runner.
//!
//! One Tokio task drains a queue of boxed futures and runs them strictly one
//! after another, so two connection attempts can never overlap. Jobs may ask
//! for a delay, which the worker sleeps through before running them.
//! Cancelling the shutdown token interrupts a pending delay or a running
//! job and stops the worker.

use std::{panic::AssertUnwindSafe, time::Duration};

use futures_util::{FutureExt, future::BoxFuture};
use tokio::{
    sync::{mpsc, watch},
    time::{sleep, timeout},
};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info_span, warn};

use crate::error::{SseError, SseResult, panic_message};

struct Job {
    delay: Duration,
    task: BoxFuture<'static, ()>,
}

/// Handle to the worker task.
#[derive(Clone, Debug)]
pub(crate) struct Scheduler {
    tx: mpsc::UnboundedSender<Job>,
    shutdown: CancellationToken,
    terminated: watch::Receiver<bool>,
}

impl Scheduler {
    /// Spawn the worker on the current Tokio runtime.
    ///
    /// # Errors
    ///
    /// [`SseError::Config`] when called outside a Tokio runtime.
    pub(crate) fn spawn(name: &str) -> SseResult<Self> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| SseError::config(format!("No Tokio runtime available: {e}")))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let (terminated_tx, terminated) = watch::channel(false);
        let shutdown = CancellationToken::new();

        runtime.spawn(
            run_worker(rx, shutdown.clone(), terminated_tx)
                .instrument(info_span!("sse_worker", name = %name)),
        );

        Ok(Self {
            tx,
            shutdown,
            terminated,
        })
    }

    /// Run `task` as soon as the worker is free.
    pub(crate) fn submit(&self, task: BoxFuture<'static, ()>) -> bool {
        self.schedule(Duration::ZERO, task)
    }

    /// Run `task` after `delay`. Returns `false` if the worker is gone, in
    /// which case the task is dropped unrun.
    pub(crate) fn schedule(&self, delay: Duration, task: BoxFuture<'static, ()>) -> bool {
        self.tx.send(Job { delay, task }).is_ok()
    }

    /// Token cancelled when the worker is told to stop. Running jobs race
    /// their blocking reads against it.
    pub(crate) fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Interrupt the running job, drop queued jobs, stop the worker.
    pub(crate) fn shutdown_now(&self) {
        self.shutdown.cancel();
    }

    pub(crate) fn is_terminated(&self) -> bool {
        *self.terminated.borrow()
    }

    /// Wait up to `limit` for the worker to exit.
    ///
    /// Returns `true` iff it exited in time.
    pub(crate) async fn await_termination(&self, limit: Duration) -> bool {
        let mut terminated = self.terminated.clone();
        match timeout(limit, terminated.wait_for(|done| *done)).await {
            Ok(Ok(_)) => true,
            Ok(Err(_)) => {
                // The worker went away without reporting; it panicked or its
                // runtime was shut down underneath it.
                warn!("Event source worker lost before signalling termination");
                false
            }
            Err(_) => false,
        }
    }
}

/// Publishes termination however the worker exits.
struct TerminationGuard(watch::Sender<bool>);

impl Drop for TerminationGuard {
    fn drop(&mut self) {
        self.0.send_replace(true);
    }
}

async fn run_worker(
    mut rx: mpsc::UnboundedReceiver<Job>,
    shutdown: CancellationToken,
    terminated: watch::Sender<bool>,
) {
    let _terminated = TerminationGuard(terminated);
    debug!("Worker started");
    loop {
        let job = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            job = rx.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };

        if !job.delay.is_zero() {
            debug!(
                delay_ms = u64::try_from(job.delay.as_millis()).unwrap_or(u64::MAX),
                "Delaying job"
            );
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = sleep(job.delay) => {}
            }
        }

        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            outcome = AssertUnwindSafe(job.task).catch_unwind() => {
                if let Err(payload) = outcome {
                    error!(panic = %panic_message(payload.as_ref()), "Job panicked");
                }
            }
        }
    }

    rx.close();
    let dropped = std::iter::from_fn(|| rx.try_recv().ok()).count();
    debug!(dropped, "Worker stopped");
}
