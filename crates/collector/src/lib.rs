//! Telemetry Collector
//!
//! Ingestion side of the pipeline: validates inbound events, dead-letters
//! rejects, buffers accepted events in a bounded queue and publishes them to
//! the partitioned log with bounded retries. An optional axum HTTP surface
//! exposes submit, health and stats endpoints.

pub mod backpressure;
pub mod collector;
pub mod dead_letter_queue;
pub mod error;
pub mod http;
pub mod retry;
pub mod validator;

pub use backpressure::{BackpressureConfig, BackpressureStats, BufferLevel, QueueMonitor};

pub use collector::{Collector, CollectorConfig, CollectorStats, SubmitOutcome};

pub use dead_letter_queue::{
    DLQConfig, DLQError, DLQStats, DeadLetterSink, FileDeadLetterQueue, MemoryDeadLetterQueue,
};

pub use error::{CollectorError, Result};

pub use retry::RetryPolicy;

pub use validator::{EventValidator, Validation, ValidatorLimits};
