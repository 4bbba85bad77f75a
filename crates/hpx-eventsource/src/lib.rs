//! # HPX EventSource
//!
//! Self-healing Server-Sent Events client built on Tokio.
//!
//! An [`EventSource`] streams events from one endpoint and fans them out to
//! any number of subscribers, each with its own demand. When the server ends
//! the stream or answers `503 Service Unavailable`, the source reconnects on
//! its own and resumes from the last event ID it saw.
//!
//! ## Features
//!
//! - **Automatic Reconnection**: honours the server's `retry:` field and `Retry-After` hints
//! - **Resumption**: sends `Last-Event-ID` on every reconnect
//! - **Backpressure-Aware Fan-out**: per-subscriber credit, nothing buffered for slow subscribers
//! - **Serialized Attempts**: a single worker task, never two connections at once
//! - **Pluggable Transport**: reqwest-backed by default, any [`EventTransport`] otherwise
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::time::Duration;
//!
//! use hpx_eventsource::{EventSource, EventSourceConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = EventSourceConfig::new("https://example.com/events")
//!         .reconnecting_every(Duration::from_secs(1));
//!     let source = EventSource::new(config)?;
//!
//!     source.subscribe(|event| println!("{}: {}", event.name, event.data))?;
//!     source.open().await?;
//!
//!     tokio::time::sleep(Duration::from_secs(30)).await;
//!     source.close(Duration::from_secs(5)).await;
//!     Ok(())
//! }
//! ```

mod attempt;
pub mod config;
pub mod error;
pub mod hub;
mod scheduler;
mod source;
pub mod state;
pub mod transport;
pub mod types;

#[cfg(test)]
mod test_support;

// Re-export commonly used types
pub use config::{DEFAULT_RECONNECT_DELAY, EventSourceConfig};
pub use error::{SseError, SseResult};
pub use hub::{DistributionHub, Subscriber, Subscription, UNBOUNDED};
pub use source::EventSource;
pub use state::ConnectionState;
#[cfg(feature = "http")]
pub use transport::HttpTransport;
pub use transport::{
    EventInput, EventTransport, LAST_EVENT_ID, StreamRequest, TEXT_EVENT_STREAM,
    resolve_retry_after,
};
pub use types::{DEFAULT_EVENT_NAME, InboundEvent, ResumptionState};
