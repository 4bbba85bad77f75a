//! Transport seam between the reconnect engine and the network.
//!
//! The engine never talks HTTP directly. Each connection attempt hands a
//! [`StreamRequest`] to an [`EventTransport`], which performs exactly one
//! request and returns an [`EventInput`] to read parsed events from.
//! [`HttpTransport`] is the default implementation.

use std::{
    sync::Arc,
    time::{Duration, SystemTime},
};

use async_trait::async_trait;
use http::{
    HeaderMap, HeaderName, HeaderValue,
    header::{ACCEPT, CONNECTION},
};
use tracing::warn;

use crate::{config::EventSourceConfig, error::SseResult, types::InboundEvent};

#[cfg(feature = "http")]
mod client;

#[cfg(feature = "http")]
pub use client::HttpTransport;

/// Media type of an event stream.
pub const TEXT_EVENT_STREAM: &str = "text/event-stream";

/// `Last-Event-ID` request header.
pub const LAST_EVENT_ID: HeaderName = HeaderName::from_static("last-event-id");

/// One outbound stream request.
#[derive(Clone, Debug)]
pub struct StreamRequest {
    /// Target endpoint.
    pub endpoint: String,
    /// Headers to send.
    pub headers: HeaderMap,
}

impl StreamRequest {
    /// Build the request for one attempt.
    ///
    /// Configured headers are sent first; `Accept`, `Last-Event-ID` and
    /// `Connection` always take the protocol values.
    pub(crate) fn new(config: &EventSourceConfig, last_event_id: Option<&str>) -> Self {
        let mut headers = config.headers.clone();
        headers.insert(ACCEPT, HeaderValue::from_static(TEXT_EVENT_STREAM));
        headers.remove(LAST_EVENT_ID);
        if let Some(id) = last_event_id {
            match HeaderValue::from_str(id) {
                Ok(value) => {
                    headers.insert(LAST_EVENT_ID, value);
                }
                Err(_) => warn!(id, "Last event ID is not a valid header value, not resuming"),
            }
        }
        headers.insert(CONNECTION, HeaderValue::from_static("close"));

        Self {
            endpoint: config.endpoint.clone(),
            headers,
        }
    }

    /// The `Last-Event-ID` being sent, if any.
    pub fn last_event_id(&self) -> Option<&str> {
        self.headers
            .get(LAST_EVENT_ID)
            .and_then(|v| v.to_str().ok())
    }
}

/// Performs one streaming request per call.
#[async_trait]
pub trait EventTransport: Send + Sync + 'static {
    /// Issue `request` and return a handle on the response's event stream.
    ///
    /// # Errors
    ///
    /// [`SseError::ServiceUnavailable`](crate::SseError::ServiceUnavailable)
    /// makes the engine retry; any other error closes the source.
    async fn connect(&self, request: &StreamRequest) -> SseResult<Box<dyn EventInput>>;
}

#[async_trait]
impl<T: EventTransport + ?Sized> EventTransport for Arc<T> {
    async fn connect(&self, request: &StreamRequest) -> SseResult<Box<dyn EventInput>> {
        (**self).connect(request).await
    }
}

/// Readable handle on an open event stream.
#[async_trait]
pub trait EventInput: Send {
    /// Read the next event. `Ok(None)` means the server ended the stream.
    ///
    /// Must be cancel-safe: the engine drops this future on shutdown.
    async fn read_event(&mut self) -> SseResult<Option<InboundEvent>>;

    /// Returns `true` once the stream has ended or been closed.
    fn is_closed(&self) -> bool;

    /// Release the underlying connection.
    fn close(&mut self);
}

/// Resolve a `Retry-After` header value against the time the request was
/// made. Accepts delta-seconds and HTTP-dates.
pub fn resolve_retry_after(value: &str, requested_at: SystemTime) -> Option<SystemTime> {
    let value = value.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return requested_at.checked_add(Duration::from_secs(seconds));
    }
    httpdate::parse_http_date(value).ok()
}
