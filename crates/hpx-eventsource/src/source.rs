//! The [`EventSource`] facade.

use std::{fmt, sync::Arc, time::Duration};

use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::{
    attempt::{ConnectionAttempt, Engine},
    config::EventSourceConfig,
    error::{SseError, SseResult},
    hub::{DistributionHub, Subscriber, UNBOUNDED},
    scheduler::Scheduler,
    state::{ConnectionState, StateFlag},
    transport::EventTransport,
    types::InboundEvent,
};

/// Self-healing client for one Server-Sent Events endpoint.
///
/// Once [`open`](Self::open)ed, the source keeps reconnecting after the
/// server ends the stream or answers `503 Service Unavailable`, resuming
/// from the last seen event ID. Any other failure closes it for good and
/// fails every subscriber. A source opens at most once; after
/// [`close`](Self::close) it cannot be reopened.
///
/// Must be created inside a Tokio runtime. Dropping the source shuts it
/// down without waiting.
pub struct EventSource {
    engine: Arc<Engine>,
}

impl EventSource {
    /// Create a source using the default HTTP transport.
    ///
    /// # Errors
    ///
    /// Returns [`SseError::Config`] if the config is invalid, the HTTP
    /// client cannot be built, or no Tokio runtime is running.
    #[cfg(feature = "http")]
    pub fn new(config: EventSourceConfig) -> SseResult<Self> {
        let transport = crate::transport::HttpTransport::new(&config)?;
        Self::with_transport(config, transport)
    }

    /// Create a source that connects through `transport`.
    ///
    /// # Errors
    ///
    /// Returns [`SseError::Config`] if the config is invalid or no Tokio
    /// runtime is running.
    pub fn with_transport(
        config: EventSourceConfig,
        transport: impl EventTransport,
    ) -> SseResult<Self> {
        config.validate().map_err(SseError::config)?;
        let name = config.display_name();
        let scheduler = Scheduler::spawn(&name)?;

        Ok(Self {
            engine: Arc::new(Engine {
                config,
                name,
                state: StateFlag::new(),
                hub: DistributionHub::new(),
                transport: Arc::new(transport),
                scheduler,
            }),
        })
    }

    /// Start receiving events.
    ///
    /// Resolves once the first request has been issued, whether or not it
    /// succeeded. A failed first attempt is reported to subscribers, not
    /// here. Dropping the returned future stops the wait but not the source.
    ///
    /// # Errors
    ///
    /// [`SseError::AlreadyConnected`] if the source is already open,
    /// [`SseError::AlreadyClosed`] if it has been closed.
    pub async fn open(&self) -> SseResult<()> {
        self.engine.state.open()?;
        info!(name = %self.engine.name, endpoint = %self.engine.config.endpoint, "Opening event source");

        let (signal, first_contact) = oneshot::channel();
        let attempt = ConnectionAttempt::first(Arc::clone(&self.engine), signal);
        if !self.engine.scheduler.submit(attempt.into_job()) {
            debug!("Worker already stopped, first attempt dropped");
        }

        debug!("Awaiting first contact signal");
        // A dropped sender means the attempt was discarded by shutdown.
        let _ = first_contact.await;
        debug!("First contact signal released");
        Ok(())
    }

    /// Whether the source is open.
    pub fn is_open(&self) -> bool {
        self.engine.state.is_open()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.engine.state.get()
    }

    /// Complete every subscriber, stop reconnecting and wait up to `timeout`
    /// for the worker to exit.
    ///
    /// Returns `true` if the worker stopped in time. Safe to call repeatedly.
    pub async fn close(&self, timeout: Duration) -> bool {
        self.engine.hub.close();
        if self.engine.shutdown() {
            info!(name = %self.engine.name, "Closing event source");
        }

        if self.engine.scheduler.await_termination(timeout).await {
            true
        } else {
            debug!(
                endpoint = %self.engine.config.endpoint,
                timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                "Event source shutdown timed out"
            );
            false
        }
    }

    /// Subscribe with unbounded demand. Errors are logged; completion is
    /// ignored.
    ///
    /// # Errors
    ///
    /// Never fails for this callback set; kept fallible for symmetry with
    /// [`subscribe_with`](Self::subscribe_with).
    pub fn subscribe(
        &self,
        on_event: impl Fn(&InboundEvent) + Send + Sync + 'static,
    ) -> SseResult<()> {
        self.subscribe_with_complete(on_event, log_unhandled_error, || {})
    }

    /// Subscribe with unbounded demand and an error callback.
    ///
    /// # Errors
    ///
    /// Never fails for this callback set.
    pub fn subscribe_with_error(
        &self,
        on_event: impl Fn(&InboundEvent) + Send + Sync + 'static,
        on_error: impl FnOnce(Arc<SseError>) + Send + 'static,
    ) -> SseResult<()> {
        self.subscribe_with_complete(on_event, on_error, || {})
    }

    /// Subscribe with unbounded demand, an error and a completion callback.
    ///
    /// # Errors
    ///
    /// Never fails for this callback set.
    pub fn subscribe_with_complete(
        &self,
        on_event: impl Fn(&InboundEvent) + Send + Sync + 'static,
        on_error: impl FnOnce(Arc<SseError>) + Send + 'static,
        on_complete: impl FnOnce() + Send + 'static,
    ) -> SseResult<()> {
        self.subscribe_with(
            Subscriber::new()
                .on_subscribe(|subscription| subscription.request(UNBOUNDED))
                .on_event(on_event)
                .on_error(on_error)
                .on_complete(on_complete),
        )
    }

    /// Register a fully specified subscriber. Its `on_subscribe` decides the
    /// initial demand.
    ///
    /// # Errors
    ///
    /// [`SseError::InvalidArgument`] if any callback is missing.
    pub fn subscribe_with(&self, subscriber: Subscriber) -> SseResult<()> {
        self.engine.hub.subscribe(subscriber)
    }

    /// Display name, used in logs and the worker's tracing span.
    pub fn name(&self) -> &str {
        &self.engine.name
    }

    /// Endpoint being streamed.
    pub fn endpoint(&self) -> &str {
        &self.engine.config.endpoint
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.engine.hub.subscriber_count()
    }
}

impl Drop for EventSource {
    fn drop(&mut self) {
        self.engine.hub.close();
        if self.engine.shutdown() {
            debug!(name = %self.engine.name, "Event source dropped while open, shutting down");
        }
    }
}

impl fmt::Debug for EventSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSource")
            .field("name", &self.engine.name)
            .field("endpoint", &self.engine.config.endpoint)
            .field("state", &self.engine.state.get())
            .field("worker_stopped", &self.engine.scheduler.is_terminated())
            .finish()
    }
}

fn log_unhandled_error(err: Arc<SseError>) {
    warn!(error = %err, "Unhandled event source error");
}
