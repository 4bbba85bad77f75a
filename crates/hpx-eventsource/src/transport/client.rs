//! Default [`EventTransport`] backed by `reqwest` and `eventsource-stream`.

use std::{
    pin::Pin,
    time::{Duration, SystemTime},
};

use async_trait::async_trait;
use eventsource_stream::{Event, EventStreamError, Eventsource};
use futures_util::{Stream, StreamExt};
use http::{
    StatusCode,
    header::{CONTENT_TYPE, RETRY_AFTER},
};
use tracing::debug;

use super::{EventInput, EventTransport, StreamRequest, TEXT_EVENT_STREAM, resolve_retry_after};
use crate::{
    config::EventSourceConfig,
    error::{SseError, SseResult},
    types::{DEFAULT_EVENT_NAME, InboundEvent},
};

type EventBody = Pin<Box<dyn Stream<Item = Result<Event, EventStreamError<reqwest::Error>>> + Send>>;

/// HTTP transport issuing one `GET` per connection attempt.
#[derive(Clone, Debug)]
pub struct HttpTransport {
    client: reqwest::Client,
    connect_timeout: Option<Duration>,
}

impl HttpTransport {
    /// Build a transport honouring the config's connect timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: &EventSourceConfig) -> SseResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| SseError::config(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            connect_timeout: Some(config.connect_timeout),
        })
    }

    /// Use an existing client.
    pub fn with_client(client: reqwest::Client) -> Self {
        Self {
            client,
            connect_timeout: None,
        }
    }
}

#[async_trait]
impl EventTransport for HttpTransport {
    async fn connect(&self, request: &StreamRequest) -> SseResult<Box<dyn EventInput>> {
        let requested_at = SystemTime::now();
        let resp = self
            .client
            .get(&request.endpoint)
            .headers(request.headers.clone())
            .send()
            .await
            .map_err(|e| match self.connect_timeout {
                Some(limit) if e.is_timeout() => SseError::timeout(limit),
                _ => SseError::from(e),
            })?;

        let status = resp.status();
        if status == StatusCode::SERVICE_UNAVAILABLE {
            let retry_at = resp
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| resolve_retry_after(v, requested_at));
            debug!(retry_at = ?retry_at, "Endpoint answered 503");
            return Err(SseError::service_unavailable(retry_at));
        }
        if !status.is_success() {
            return Err(SseError::invalid_status(status));
        }

        if let Some(ct) = resp.headers().get(CONTENT_TYPE) {
            let ct_str = ct.to_str().unwrap_or("");
            if !ct_str.contains(TEXT_EVENT_STREAM) {
                return Err(SseError::invalid_content_type(ct_str));
            }
        }

        let events: EventBody = Box::pin(resp.bytes_stream().eventsource());
        Ok(Box::new(HttpEventInput {
            events: Some(events),
        }))
    }
}

struct HttpEventInput {
    events: Option<EventBody>,
}

#[async_trait]
impl EventInput for HttpEventInput {
    async fn read_event(&mut self) -> SseResult<Option<InboundEvent>> {
        let Some(events) = self.events.as_mut() else {
            return Ok(None);
        };
        match events.next().await {
            Some(Ok(event)) => Ok(Some(to_inbound(event))),
            Some(Err(err)) => {
                self.events = None;
                Err(SseError::stream(err.to_string()))
            }
            None => {
                self.events = None;
                Ok(None)
            }
        }
    }

    fn is_closed(&self) -> bool {
        self.events.is_none()
    }

    fn close(&mut self) {
        self.events = None;
    }
}

fn to_inbound(event: Event) -> InboundEvent {
    InboundEvent {
        id: Some(event.id).filter(|id| !id.is_empty()),
        name: if event.event.is_empty() {
            DEFAULT_EVENT_NAME.to_string()
        } else {
            event.event
        },
        data: event.data,
        reconnect_delay: event.retry,
    }
}
