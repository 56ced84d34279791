//! Error types for the stream aggregator
//!
//! Errors are split by concern (windowing, state, sink) and classified as
//! transient or fatal. Transient errors are retried by the aggregator with a
//! capped backoff; fatal errors halt the affected partition worker.

use thiserror::Error;

/// Main processor error type
#[derive(Error, Debug)]
pub enum ProcessorError {
    /// Window-related errors
    #[error("window error: {0}")]
    Window(#[from] WindowError),

    /// State store errors
    #[error("state error: {0}")]
    State(#[from] StateError),

    /// Sink errors
    #[error("sink error: {0}")]
    Sink(#[from] SinkError),

    /// Log client errors
    #[error("log error: {0}")]
    Log(#[from] eventlog::LogError),

    /// Configuration errors
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Shutdown was requested while an operation was still being retried
    #[error("interrupted by shutdown during {operation}")]
    Interrupted { operation: String },

    /// A partition worker panicked or was aborted
    #[error("worker for partition {partition} failed: {reason}")]
    WorkerFailed { partition: u32, reason: String },
}

/// Window assignment errors
#[derive(Error, Debug)]
pub enum WindowError {
    /// Window size is invalid
    #[error("invalid window size: {size}ms, must be greater than 0")]
    InvalidWindowSize { size: u64 },
}

/// State store errors
#[derive(Error, Debug)]
pub enum StateError {
    /// Backend I/O or availability failure
    #[error("storage error in {backend_type}: {details}")]
    StorageError {
        backend_type: String,
        details: String,
    },

    /// State serialization failed
    #[error("state serialization failed for key '{key}': {reason}")]
    SerializationFailed { key: String, reason: String },

    /// State deserialization failed
    #[error("state deserialization failed for key '{key}': {reason}")]
    DeserializationFailed { key: String, reason: String },

    /// Persisted state violates an invariant
    #[error("state corruption: {details}")]
    Corruption { details: String },
}

/// Sink errors
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("sink I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("sink unavailable: {0}")]
    Unavailable(String),

    #[error("row serialization failed: {0}")]
    Serialization(String),
}

/// Classification used by retry loops
pub trait Transient {
    fn is_transient(&self) -> bool;
}

impl Transient for StateError {
    fn is_transient(&self) -> bool {
        matches!(self, StateError::StorageError { .. })
    }
}

impl Transient for SinkError {
    fn is_transient(&self) -> bool {
        matches!(self, SinkError::Io(_) | SinkError::Unavailable(_))
    }
}

impl Transient for eventlog::LogError {
    fn is_transient(&self) -> bool {
        eventlog::LogError::is_transient(self)
    }
}

impl StateError {
    pub fn storage(backend_type: &str, details: impl ToString) -> Self {
        StateError::StorageError {
            backend_type: backend_type.to_string(),
            details: details.to_string(),
        }
    }

    pub fn corruption(details: impl Into<String>) -> Self {
        StateError::Corruption {
            details: details.into(),
        }
    }

    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            StateError::Corruption { .. } | StateError::DeserializationFailed { .. }
        )
    }
}

impl ProcessorError {
    /// Whether this error means persisted state can no longer be trusted
    pub fn is_corruption(&self) -> bool {
        matches!(self, ProcessorError::State(e) if e.is_corruption())
    }
}

/// Result type for processor operations
pub type Result<T> = std::result::Result<T, ProcessorError>;

/// Result type for state operations
pub type StateResult<T> = std::result::Result<T, StateError>;

/// Result type for sink operations
pub type SinkResult<T> = std::result::Result<T, SinkError>;
