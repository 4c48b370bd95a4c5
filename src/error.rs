use crate::events::WorkerEvent;
use std::time::Duration;
use thiserror::Error;

/// Boxed error returned by message handlers and validators.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Error type for the task worker library.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// Malformed worker configuration, handler list or options. Raised before any I/O.
    #[error("Invalid worker configuration: {0}")]
    Configuration(String),

    /// The broker could not be reached when the worker started listening.
    #[error("Failed to connect to broker at {url}: {source}")]
    Connection {
        url: String,
        #[source]
        source: Box<WorkerError>,
    },

    /// Error originating from the underlying `lapin` library.
    #[error("RabbitMQ communication error: {0}")]
    Lapin(#[from] lapin::Error),

    /// The delivered payload is not valid JSON.
    #[error("Failed to parse message: {0}")]
    Parse(#[from] serde_json::Error),

    /// The configured validator rejected the parsed content.
    #[error("Message failed validation: {0}")]
    Validation(BoxError),

    /// Error from the message handler logic.
    #[error("Message handler failed: {0}")]
    Handler(BoxError),

    /// The message handler did not settle in time.
    #[error("Message handler did not settle within {0:?}")]
    HandlerTimeout(Duration),

    /// Closing the channel or the connection failed.
    #[error("Worker shutdown failed: {0}")]
    Shutdown(String),

    /// `wait()` gave up before the awaited event fired.
    #[error("event {event} didn't occur after {timeout_ms}ms")]
    WaitTimeout { event: WorkerEvent, timeout_ms: u64 },

    /// The operation is not allowed in the worker's current state.
    #[error("Invalid worker state: {0}")]
    State(String),
}

impl WorkerError {
    /// Shorthand for building a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        WorkerError::Configuration(message.into())
    }
}
