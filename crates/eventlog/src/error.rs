//! Log client error types

use std::time::Duration;
use thiserror::Error;

/// Errors returned by log backends
#[derive(Error, Debug)]
pub enum LogError {
    #[error("Log unavailable: {0}")]
    Unavailable(String),

    #[error("Log operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Unknown partition {partition} (log has {count} partitions)")]
    UnknownPartition { partition: u32, count: u32 },

    #[error("Log configuration error: {0}")]
    Config(String),

    #[cfg(feature = "kafka")]
    #[error(transparent)]
    Kafka(#[from] rdkafka::error::KafkaError),
}

impl LogError {
    /// Whether retrying the same operation may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            LogError::Unavailable(_) | LogError::Timeout(_) => true,
            LogError::UnknownPartition { .. } | LogError::Config(_) => false,
            #[cfg(feature = "kafka")]
            LogError::Kafka(e) => !matches!(
                e,
                rdkafka::error::KafkaError::ClientCreation(_)
                    | rdkafka::error::KafkaError::ClientConfig(..)
            ),
        }
    }
}

pub type Result<T> = std::result::Result<T, LogError>;
