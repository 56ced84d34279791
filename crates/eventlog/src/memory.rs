//! In-process partitioned log
//!
//! Records are kept for the lifetime of the log so any offset can be replayed.
//! Consumers that reach the head of a partition wait for the next append.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, trace};

use crate::error::{LogError, Result};
use crate::partitioner::partition_for;
use crate::{LogClient, LogRecord, RecordPosition, RecordStream};

#[derive(Default)]
struct PartitionLog {
    records: RwLock<Vec<Arc<[u8]>>>,
    appended: Notify,
}

impl PartitionLog {
    fn append(&self, payload: &[u8]) -> u64 {
        let offset = {
            let mut records = self.records.write();
            records.push(Arc::from(payload));
            (records.len() - 1) as u64
        };
        self.appended.notify_waiters();
        offset
    }

    fn get(&self, offset: u64) -> Option<Arc<[u8]>> {
        let index = usize::try_from(offset).ok()?;
        self.records.read().get(index).cloned()
    }
}

/// Replayable in-memory log
#[derive(Clone)]
pub struct InMemoryLog {
    partitions: Arc<Vec<Arc<PartitionLog>>>,
}

impl InMemoryLog {
    pub fn new(partitions: u32) -> Self {
        let count = partitions.max(1);
        Self {
            partitions: Arc::new((0..count).map(|_| Arc::new(PartitionLog::default())).collect()),
        }
    }

    /// Append directly to a partition, bypassing the partitioner
    pub fn append_to(&self, partition: u32, payload: &[u8]) -> Result<RecordPosition> {
        let log = self.partition(partition)?;
        let offset = log.append(payload);
        Ok(RecordPosition { partition, offset })
    }

    /// Number of records in a partition
    pub fn len(&self, partition: u32) -> usize {
        self.partitions
            .get(partition as usize)
            .map(|p| p.records.read().len())
            .unwrap_or(0)
    }

    /// Total records across all partitions
    pub fn total_len(&self) -> usize {
        self.partitions.iter().map(|p| p.records.read().len()).sum()
    }

    /// Snapshot of a partition's payloads
    pub fn records(&self, partition: u32) -> Vec<Vec<u8>> {
        self.partitions
            .get(partition as usize)
            .map(|p| p.records.read().iter().map(|r| r.to_vec()).collect())
            .unwrap_or_default()
    }

    fn partition(&self, partition: u32) -> Result<Arc<PartitionLog>> {
        self.partitions
            .get(partition as usize)
            .cloned()
            .ok_or(LogError::UnknownPartition {
                partition,
                count: self.partition_count(),
            })
    }
}

#[async_trait]
impl LogClient for InMemoryLog {
    async fn publish(&self, partition_key: &[u8], payload: &[u8]) -> Result<RecordPosition> {
        let partition = partition_for(partition_key, self.partition_count());
        let position = self.append_to(partition, payload)?;
        trace!(
            partition = position.partition,
            offset = position.offset,
            "Appended record"
        );
        Ok(position)
    }

    async fn consume(&self, partition: u32, from_offset: u64) -> Result<RecordStream> {
        let log = self.partition(partition)?;
        debug!(partition, from_offset, "Opening in-memory consumer");

        let records = stream::unfold((log, from_offset), move |(log, next)| async move {
            loop {
                let appended = log.appended.notified();
                if let Some(payload) = log.get(next) {
                    drop(appended);
                    let record = LogRecord {
                        partition,
                        offset: next,
                        payload: payload.to_vec(),
                    };
                    return Some((Ok(record), (log, next + 1)));
                }
                appended.await;
            }
        });

        Ok(records.boxed())
    }

    fn partition_count(&self) -> u32 {
        self.partitions.len() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_publish_assigns_sequential_offsets() {
        let log = InMemoryLog::new(1);
        let a = log.publish(b"k", b"one").await.unwrap();
        let b = log.publish(b"k", b"two").await.unwrap();
        assert_eq!((a.partition, a.offset), (0, 0));
        assert_eq!((b.partition, b.offset), (0, 1));
        assert_eq!(log.len(0), 2);
    }

    #[tokio::test]
    async fn test_same_key_same_partition() {
        let log = InMemoryLog::new(8);
        let first = log.publish(b"model-key", b"a").await.unwrap();
        for _ in 0..10 {
            let next = log.publish(b"model-key", b"b").await.unwrap();
            assert_eq!(next.partition, first.partition);
        }
    }

    #[tokio::test]
    async fn test_consume_replays_from_offset() {
        let log = InMemoryLog::new(1);
        for i in 0..5u8 {
            log.append_to(0, &[i]).unwrap();
        }

        let mut stream = log.consume(0, 2).await.unwrap();
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.offset, 2);
        assert_eq!(first.payload, vec![2]);
    }

    #[tokio::test]
    async fn test_consume_tails_new_records() {
        let log = InMemoryLog::new(2);
        let mut stream = log.consume(1, 0).await.unwrap();

        let writer = log.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.append_to(1, b"late").unwrap();
        });

        let record = tokio::time::timeout(Duration::from_secs(2), stream.next())
            .await
            .expect("tailing consumer should wake up")
            .unwrap()
            .unwrap();
        assert_eq!(record.payload, b"late".to_vec());
        assert_eq!(record.position(), RecordPosition { partition: 1, offset: 0 });
    }

    #[tokio::test]
    async fn test_unknown_partition() {
        let log = InMemoryLog::new(2);
        let err = log.consume(5, 0).await.err().unwrap();
        assert!(matches!(err, LogError::UnknownPartition { partition: 5, count: 2 }));
        assert!(!err.is_transient());
    }
}
