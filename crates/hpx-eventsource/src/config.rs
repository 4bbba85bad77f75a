//! Event source configuration.

use std::time::Duration;

/// Reconnect delay used until the server overrides it with a `retry:` field.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(500);

/// Configuration for an [`EventSource`](crate::EventSource).
///
/// Built by value with chainable setters and checked by
/// [`validate()`](EventSourceConfig::validate) when the source is created.
/// Immutable once the source owns it.
#[derive(Clone, Debug)]
pub struct EventSourceConfig {
    /// SSE endpoint URL.
    pub endpoint: String,
    /// Display name used to label the worker's tracing span.
    pub name: Option<String>,
    /// Delay before reconnecting after the stream ends.
    pub reconnect_delay: Duration,
    /// Additional HTTP headers sent with every stream request.
    pub headers: http::HeaderMap,
    /// Connection timeout applied by the HTTP transport.
    pub connect_timeout: Duration,
}

impl Default for EventSourceConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            name: None,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            headers: http::HeaderMap::new(),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl EventSourceConfig {
    /// Create a new configuration for the given endpoint.
    #[must_use]
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Default::default()
        }
    }

    /// Set the display name.
    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the default reconnect delay.
    #[must_use]
    pub fn reconnecting_every(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Set additional HTTP headers.
    #[must_use]
    pub fn headers(mut self, headers: http::HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    /// Set the connection timeout.
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// The configured name, or one derived from the endpoint.
    pub fn display_name(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => format!("hpx-eventsource-[{}]", self.endpoint),
        }
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error message string if any field has an invalid value.
    pub fn validate(&self) -> Result<(), String> {
        if self.endpoint.trim().is_empty() {
            return Err("Endpoint cannot be empty".to_string());
        }
        if self.name.as_deref().is_some_and(str::is_empty) {
            return Err("Name cannot be empty".to_string());
        }
        if self.connect_timeout.is_zero() {
            return Err("Connect timeout must be > 0".to_string());
        }
        Ok(())
    }
}
