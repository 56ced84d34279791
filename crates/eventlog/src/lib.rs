//! Partitioned event log client
//!
//! The collector publishes validated events here and the aggregator consumes
//! them back, one partition at a time and strictly in offset order.
//!
//! Two backends are provided:
//! - [`InMemoryLog`]: replayable in-process log with tailing consumers
//! - `KafkaLog` (feature `kafka`): rdkafka-backed topic with explicit partitioning

pub mod error;
pub mod memory;
pub mod partitioner;

#[cfg(feature = "kafka")]
pub mod kafka;

use async_trait::async_trait;
use futures::stream::BoxStream;

pub use error::{LogError, Result};
pub use memory::InMemoryLog;
pub use partitioner::partition_for;

#[cfg(feature = "kafka")]
pub use kafka::{KafkaLog, KafkaLogConfig};

/// Position of a record in the log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordPosition {
    pub partition: u32,
    pub offset: u64,
}

/// A record read back from the log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub partition: u32,
    pub offset: u64,
    pub payload: Vec<u8>,
}

impl LogRecord {
    pub fn position(&self) -> RecordPosition {
        RecordPosition {
            partition: self.partition,
            offset: self.offset,
        }
    }
}

/// Stream of records from one partition, in offset order
pub type RecordStream = BoxStream<'static, Result<LogRecord>>;

/// Durable, ordered, partitioned log
#[async_trait]
pub trait LogClient: Send + Sync {
    /// Append a payload to the partition selected by `partition_key`
    async fn publish(&self, partition_key: &[u8], payload: &[u8]) -> Result<RecordPosition>;

    /// Read `partition` starting at `from_offset`, then tail new records
    async fn consume(&self, partition: u32, from_offset: u64) -> Result<RecordStream>;

    /// Number of partitions
    fn partition_count(&self) -> u32;
}
