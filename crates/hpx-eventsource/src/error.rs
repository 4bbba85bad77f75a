//! Error handling for the event source.
//!
//! Errors fall into three groups: misuse reported straight to the caller,
//! transient failures the engine recovers from by reconnecting, and
//! unrecoverable failures that close the source and reach subscribers via
//! `on_error`.

use std::{
    any::Any,
    time::{Duration, SystemTime},
};

use thiserror::Error;

/// The main result type used throughout the crate.
pub type SseResult<T> = Result<T, SseError>;

/// Error type for every event source operation.
#[derive(Error, Debug)]
pub enum SseError {
    /// `open()` was called on a source that is already open.
    #[error("Event source is already connected")]
    AlreadyConnected,

    /// `open()` was called on a source that has been closed.
    #[error("Event source is already closed")]
    AlreadyClosed,

    /// A caller-supplied argument was missing or invalid.
    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// The server answered `503 Service Unavailable`.
    ///
    /// `retry_at` is the `Retry-After` hint resolved against the request time.
    #[error("Service unavailable (retry at {retry_at:?})")]
    ServiceUnavailable { retry_at: Option<SystemTime> },

    /// HTTP request errors
    #[cfg(feature = "http")]
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The endpoint answered with a non-success status other than 503.
    #[error("Unexpected HTTP status: {status}")]
    InvalidStatus { status: http::StatusCode },

    /// The endpoint did not answer with `text/event-stream`.
    #[error("Unexpected content type: {content_type}")]
    InvalidContentType { content_type: String },

    /// The event stream broke while being read or parsed.
    #[error("Event stream error: {message}")]
    Stream { message: String },

    /// Timeout errors
    #[error("Operation timed out after {duration:?}")]
    Timeout { duration: Duration },

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A subscriber callback panicked. Only that subscriber is failed.
    #[error("Subscriber callback panicked: {message}")]
    SubscriberPanicked { message: String },

    /// A connection attempt panicked, usually inside a custom transport.
    #[error("Connection attempt panicked: {message}")]
    WorkerPanicked { message: String },
}

impl SseError {
    /// Create an invalid-argument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a service-unavailable error with an optional retry hint.
    pub fn service_unavailable(retry_at: Option<SystemTime>) -> Self {
        Self::ServiceUnavailable { retry_at }
    }

    /// Create a stream error.
    pub fn stream(message: impl Into<String>) -> Self {
        Self::Stream {
            message: message.into(),
        }
    }

    /// Create a subscriber-panic error from a caught panic payload.
    pub fn subscriber_panicked(payload: &(dyn Any + Send)) -> Self {
        Self::SubscriberPanicked {
            message: panic_message(payload),
        }
    }

    /// Create a worker-panic error from a caught panic payload.
    pub fn worker_panicked(payload: &(dyn Any + Send)) -> Self {
        Self::WorkerPanicked {
            message: panic_message(payload),
        }
    }

    /// Create a timeout error.
    pub fn timeout(duration: Duration) -> Self {
        Self::Timeout { duration }
    }

    /// Create an invalid status error.
    pub fn invalid_status(status: http::StatusCode) -> Self {
        Self::InvalidStatus { status }
    }

    /// Create an invalid content type error.
    pub fn invalid_content_type(content_type: impl Into<String>) -> Self {
        Self::InvalidContentType {
            content_type: content_type.into(),
        }
    }

    /// Returns `true` for misuse errors raised synchronously to the caller.
    pub fn is_misuse(&self) -> bool {
        matches!(
            self,
            Self::AlreadyConnected
                | Self::AlreadyClosed
                | Self::InvalidArgument { .. }
                | Self::Config { .. }
        )
    }

    /// Returns `true` if the engine recovers from this failure by
    /// reconnecting. Everything else closes the source.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::ServiceUnavailable { .. })
    }

    /// Delay before the next reconnect after this failure, measured from
    /// `now`.
    ///
    /// Returns `None` for failures that must not be retried. A retry hint in
    /// the past yields [`Duration::ZERO`]; without a hint `fallback` is used.
    pub fn retry_delay(&self, fallback: Duration, now: SystemTime) -> Option<Duration> {
        match self {
            Self::ServiceUnavailable {
                retry_at: Some(retry_at),
            } => {
                let delay = retry_at.duration_since(now).unwrap_or(Duration::ZERO);
                // Retry-After is applied at millisecond granularity.
                Some(Duration::from_millis(
                    u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                ))
            }
            Self::ServiceUnavailable { retry_at: None } => Some(fallback),
            _ => None,
        }
    }
}

/// Text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
