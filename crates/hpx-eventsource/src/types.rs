//! Core type definitions for inbound events and resumption state.

use std::{fmt, time::Duration};

use serde::de::DeserializeOwned;

use crate::error::SseResult;

/// Default event type when the server does not send an `event:` field.
pub const DEFAULT_EVENT_NAME: &str = "message";

/// A parsed event read from the stream. Immutable once produced.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboundEvent {
    /// The event ID, if the server sent one.
    pub id: Option<String>,
    /// The event type field.
    pub name: String,
    /// The data payload.
    pub data: String,
    /// Reconnect delay advertised by the server through `retry:`.
    pub reconnect_delay: Option<Duration>,
}

impl InboundEvent {
    /// Create an unnamed data event.
    pub fn new(data: impl Into<String>) -> Self {
        Self {
            id: None,
            name: DEFAULT_EVENT_NAME.to_string(),
            data: data.into(),
            reconnect_delay: None,
        }
    }

    /// Set the event ID.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Set the event type.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the reconnect delay override.
    #[must_use]
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = Some(delay);
        self
    }

    /// Decode the data payload as JSON.
    ///
    /// # Errors
    ///
    /// Returns [`SseError::Serialization`](crate::SseError::Serialization) if
    /// the payload is not valid JSON for `T`.
    pub fn json<T: DeserializeOwned>(&self) -> SseResult<T> {
        Ok(serde_json::from_str(&self.data)?)
    }
}

impl fmt::Display for InboundEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "InboundEvent{{id={}, name={}, data={}}}",
            self.id.as_deref().unwrap_or("-"),
            self.name,
            self.data
        )
    }
}

/// State carried from one connection attempt to the next.
///
/// Owned by whichever attempt is running and handed to its successor by
/// value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResumptionState {
    /// ID of the most recent event carrying one.
    pub last_event_id: Option<String>,
    /// Delay applied before the next reconnect.
    pub reconnect_delay: Duration,
}

impl ResumptionState {
    pub(crate) fn new(reconnect_delay: Duration) -> Self {
        Self {
            last_event_id: None,
            reconnect_delay,
        }
    }

    /// Fold an event's id and reconnect override into the state.
    pub(crate) fn record(&mut self, event: &InboundEvent) {
        if let Some(id) = &event.id {
            self.last_event_id = Some(id.clone());
        }
        if let Some(delay) = event.reconnect_delay {
            self.reconnect_delay = delay;
        }
    }

    /// Value for the `Last-Event-ID` header, if any.
    pub(crate) fn resume_from(&self) -> Option<&str> {
        self.last_event_id.as_deref().filter(|id| !id.is_empty())
    }
}
