//! Collector error types

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CollectorError {
    #[error("Invalid collector configuration: {0}")]
    ConfigError(String),

    #[error("Collector already started")]
    AlreadyStarted,

    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),

    #[error("HTTP server error: {0}")]
    Server(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CollectorError>;
