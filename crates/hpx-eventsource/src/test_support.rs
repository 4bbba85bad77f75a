//! Scripted in-memory transport for engine tests.

use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::{sync::watch, time::Instant};

use crate::{
    error::{SseError, SseResult},
    transport::{EventInput, EventTransport, StreamRequest},
    types::InboundEvent,
};

pub(crate) enum Ending {
    Eof,
    Error(SseError),
    Hang,
}

/// What one `connect` call produces.
pub(crate) enum Script {
    Stream {
        events: Vec<InboundEvent>,
        ending: Ending,
    },
    Fail(Box<dyn FnOnce() -> SseError + Send>),
}

impl Script {
    /// Deliver `events`, then end the stream.
    pub(crate) fn events(events: Vec<InboundEvent>) -> Self {
        Self::Stream {
            events,
            ending: Ending::Eof,
        }
    }

    /// Deliver `events`, then fail the read with `err`.
    pub(crate) fn events_then_error(events: Vec<InboundEvent>, err: SseError) -> Self {
        Self::Stream {
            events,
            ending: Ending::Error(err),
        }
    }

    /// Deliver `events`, then block until shutdown.
    pub(crate) fn hang(events: Vec<InboundEvent>) -> Self {
        Self::Stream {
            events,
            ending: Ending::Hang,
        }
    }

    /// Fail the connect itself. The error is built at connect time.
    pub(crate) fn fail_with(make: impl FnOnce() -> SseError + Send + 'static) -> Self {
        Self::Fail(Box::new(make))
    }
}

#[derive(Default)]
struct Activity {
    current: AtomicUsize,
    max: AtomicUsize,
}

impl Activity {
    fn enter(self: &Arc<Self>) -> ActiveGuard {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max.fetch_max(now, Ordering::SeqCst);
        ActiveGuard(Arc::clone(self))
    }
}

struct ActiveGuard(Arc<Activity>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.current.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Plays back one [`Script`] per connect. Once the scripts run out every
/// further connect yields a stream that hangs until shutdown.
pub(crate) struct ScriptedTransport {
    scripts: Mutex<VecDeque<Script>>,
    requests: Mutex<Vec<(Instant, StreamRequest)>>,
    connects: watch::Sender<usize>,
    activity: Arc<Activity>,
}

impl ScriptedTransport {
    pub(crate) fn new(scripts: Vec<Script>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            requests: Mutex::new(Vec::new()),
            connects: watch::Sender::new(0),
            activity: Arc::default(),
        }
    }

    pub(crate) fn requests(&self) -> Vec<StreamRequest> {
        self.requests.lock().iter().map(|(_, r)| r.clone()).collect()
    }

    pub(crate) fn connect_times(&self) -> Vec<Instant> {
        self.requests.lock().iter().map(|(at, _)| *at).collect()
    }

    pub(crate) fn connect_count(&self) -> usize {
        *self.connects.borrow()
    }

    /// Highest number of connections alive at the same time.
    pub(crate) fn max_concurrent(&self) -> usize {
        self.activity.max.load(Ordering::SeqCst)
    }

    pub(crate) fn open_inputs(&self) -> usize {
        self.activity.current.load(Ordering::SeqCst)
    }

    pub(crate) async fn wait_for_connects(&self, n: usize) {
        let mut rx = self.connects.subscribe();
        let _ = rx.wait_for(|count| *count >= n).await;
    }
}

#[async_trait]
impl EventTransport for ScriptedTransport {
    async fn connect(&self, request: &StreamRequest) -> SseResult<Box<dyn EventInput>> {
        let guard = self.activity.enter();
        self.requests
            .lock()
            .push((Instant::now(), request.clone()));
        let script = self.scripts.lock().pop_front();
        self.connects.send_modify(|count| *count += 1);

        match script.unwrap_or_else(|| Script::hang(Vec::new())) {
            Script::Fail(make) => Err(make()),
            Script::Stream { events, ending } => Ok(Box::new(ScriptedInput {
                events: events.into(),
                ending: Some(ending),
                closed: false,
                _guard: guard,
            })),
        }
    }
}

struct ScriptedInput {
    events: VecDeque<InboundEvent>,
    ending: Option<Ending>,
    closed: bool,
    _guard: ActiveGuard,
}

#[async_trait]
impl EventInput for ScriptedInput {
    async fn read_event(&mut self) -> SseResult<Option<InboundEvent>> {
        if self.closed {
            return Ok(None);
        }
        if let Some(event) = self.events.pop_front() {
            return Ok(Some(event));
        }
        match self.ending.take() {
            Some(Ending::Hang) => {
                self.ending = Some(Ending::Hang);
                std::future::pending().await
            }
            Some(Ending::Error(err)) => {
                self.closed = true;
                Err(err)
            }
            Some(Ending::Eof) | None => {
                self.closed = true;
                Ok(None)
            }
        }
    }

    fn is_closed(&self) -> bool {
        self.closed
    }

    fn close(&mut self) {
        self.closed = true;
    }
}
