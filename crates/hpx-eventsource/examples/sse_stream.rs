//! SSE Stream Example
//!
//! Streams events from an endpoint, printing each one, until Ctrl-C.
//!
//! Run with: `cargo run -p hpx-eventsource --example sse_stream -- <url>`
//!
//! Set `RUST_LOG=hpx_eventsource=debug` to watch reconnects.

use std::time::Duration;

use hpx_eventsource::{EventSource, EventSourceConfig};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let url = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "http://localhost:8080/events".to_string());

    let config = EventSourceConfig::new(url).reconnecting_every(Duration::from_secs(1));
    let source = EventSource::new(config)?;

    source.subscribe_with_complete(
        |event| {
            println!(
                "[{}] {} {}",
                event.name,
                event.id.as_deref().unwrap_or("-"),
                event.data
            );
        },
        |err| eprintln!("Stream failed: {err}"),
        || println!("Stream closed"),
    )?;

    source.open().await?;
    println!("Streaming from {} (Ctrl-C to stop)", source.endpoint());

    tokio::signal::ctrl_c().await?;
    if !source.close(Duration::from_secs(5)).await {
        eprintln!("Worker did not stop in time");
    }
    Ok(())
}
