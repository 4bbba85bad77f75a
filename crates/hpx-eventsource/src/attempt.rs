//! Connection attempts and failure classification.
//!
//! A [`ConnectionAttempt`] issues one stream request, reads events until the
//! stream ends or fails, and then either schedules a successor carrying the
//! resumption state or shuts the engine down. Attempts only ever run on the
//! scheduler's single worker, so at most one executes at a time and the
//! resumption state needs no locking.

use std::{
    panic::AssertUnwindSafe,
    sync::Arc,
    time::{Duration, SystemTime},
};

use futures_util::{FutureExt, future::BoxFuture};
use tokio::sync::oneshot;
use tracing::{debug, error};

use crate::{
    config::EventSourceConfig,
    error::{SseError, SseResult},
    hub::DistributionHub,
    scheduler::Scheduler,
    state::{ConnectionState, StateFlag},
    transport::{EventInput, EventTransport, StreamRequest},
    types::{InboundEvent, ResumptionState},
};

/// State shared between the facade and the running attempt.
pub(crate) struct Engine {
    pub(crate) config: EventSourceConfig,
    pub(crate) name: String,
    pub(crate) state: StateFlag,
    pub(crate) hub: DistributionHub,
    pub(crate) transport: Arc<dyn EventTransport>,
    pub(crate) scheduler: Scheduler,
}

impl Engine {
    /// Move to `Closed` and stop the worker. Only the first call tears the
    /// worker down; returns whether this call did.
    pub(crate) fn shutdown(&self) -> bool {
        if self.state.shutdown() == ConnectionState::Closed {
            return false;
        }
        self.scheduler.shutdown_now();
        true
    }

    /// Unrecoverable failure: shut down and fail every subscriber.
    fn fail(&self, err: SseError) {
        error!(
            endpoint = %self.config.endpoint,
            error = %err,
            "Unrecoverable failure - closing the event source"
        );
        self.shutdown();
        self.hub.close_with_error(err);
    }
}

/// One connect-and-read cycle.
pub(crate) struct ConnectionAttempt {
    engine: Arc<Engine>,
    resumption: ResumptionState,
    first_contact: Option<oneshot::Sender<()>>,
}

impl ConnectionAttempt {
    /// The attempt started by `open()`. `first_contact` fires once the
    /// request has been issued, whatever its outcome.
    pub(crate) fn first(engine: Arc<Engine>, first_contact: oneshot::Sender<()>) -> Self {
        let resumption = ResumptionState::new(engine.config.reconnect_delay);
        Self {
            engine,
            resumption,
            first_contact: Some(first_contact),
        }
    }

    /// Box the attempt for the scheduler. A panic inside the attempt fails
    /// the engine instead of leaving it open with nothing running.
    pub(crate) fn into_job(self) -> BoxFuture<'static, ()> {
        let engine = Arc::clone(&self.engine);
        AssertUnwindSafe(self.run())
            .catch_unwind()
            .map(move |outcome| {
                if let Err(payload) = outcome {
                    engine.fail(SseError::worker_panicked(payload.as_ref()));
                }
            })
            .boxed()
    }

    async fn run(mut self) {
        debug!(
            last_event_id = ?self.resumption.last_event_id,
            "Listener task started"
        );

        let request = StreamRequest::new(&self.engine.config, self.resumption.resume_from());
        let connected = if self.engine.state.is_open() {
            Some(self.engine.transport.connect(&request).await)
        } else {
            None
        };

        if let Some(signal) = self.first_contact.take() {
            let _ = signal.send(());
        }

        let outcome = match connected {
            None => Ok(()),
            Some(Err(err)) => Err(err),
            Some(Ok(mut input)) => {
                debug!(endpoint = %self.engine.config.endpoint, "Event stream connected");
                let outcome = self.consume(input.as_mut()).await;
                if !input.is_closed() {
                    input.close();
                }
                outcome
            }
        };

        if let Err(err) = outcome {
            self.handle_failure(err);
        }
        debug!("Listener task finished");
    }

    async fn consume(&mut self, input: &mut dyn EventInput) -> SseResult<()> {
        let shutdown = self.engine.scheduler.shutdown_token().clone();

        while self.engine.state.is_open() && !shutdown.is_cancelled() {
            if input.is_closed() {
                self.connection_lost();
                break;
            }

            let next = tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    debug!("Stream read interrupted by shutdown");
                    break;
                }
                next = input.read_event() => next?,
            };

            match next {
                Some(event) => self.dispatch(event),
                None => {
                    self.connection_lost();
                    break;
                }
            }
        }
        Ok(())
    }

    fn dispatch(&mut self, event: InboundEvent) {
        debug!(event = %event, "New event received");
        self.resumption.record(&event);
        let delivered = self.engine.hub.submit(&event);
        debug!(delivered, "Event distributed");
    }

    fn connection_lost(&self) {
        let delay = self.resumption.reconnect_delay;
        debug!(
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "Connection lost - scheduling reconnect"
        );
        self.schedule_reconnect(delay);
    }

    fn handle_failure(&self, err: SseError) {
        match err.retry_delay(self.resumption.reconnect_delay, SystemTime::now()) {
            Some(delay) => {
                debug!(
                    error = %err,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "Recovering from unavailable service - scheduling reconnect"
                );
                self.schedule_reconnect(delay);
            }
            None => self.engine.fail(err),
        }
    }

    /// Queue a successor carrying the current resumption state. Silently
    /// aborts unless the source is still open.
    fn schedule_reconnect(&self, delay: Duration) {
        let state = self.engine.state.get();
        if state != ConnectionState::Open {
            debug!(%state, "Aborting reconnect of event source");
            return;
        }

        let successor = Self {
            engine: Arc::clone(&self.engine),
            resumption: self.resumption.clone(),
            first_contact: None,
        };
        if !self.engine.scheduler.schedule(delay, successor.into_job()) {
            debug!("Worker already stopped, reconnect dropped");
        }
    }
}
