//! Kafka-backed log
//!
//! Publishing uses an idempotent producer with `acks=all` and selects the
//! partition explicitly with [`partition_for`], so the in-memory and Kafka
//! backends place keys identically. Consumers are assigned one partition at
//! an explicit offset and never commit to the group; the aggregator's state
//! store owns the offsets.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use rdkafka::{Message, Offset, TopicPartitionList};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{LogError, Result};
use crate::partitioner::partition_for;
use crate::{LogClient, LogRecord, RecordPosition, RecordStream};

/// Kafka log configuration
#[derive(Debug, Clone)]
pub struct KafkaLogConfig {
    /// Kafka brokers (comma-separated)
    pub brokers: String,
    /// Topic holding telemetry events
    pub topic: String,
    /// Client ID
    pub client_id: String,
    /// Partition count of the topic
    pub partitions: u32,
    /// Message timeout in milliseconds
    pub message_timeout_ms: u64,
}

impl Default for KafkaLogConfig {
    fn default() -> Self {
        Self {
            brokers: "localhost:9092".to_string(),
            topic: "llm-telemetry-events".to_string(),
            client_id: "llm-telemetry".to_string(),
            partitions: 4,
            message_timeout_ms: 30_000,
        }
    }
}

pub struct KafkaLog {
    producer: FutureProducer,
    config: KafkaLogConfig,
}

impl KafkaLog {
    pub fn new(config: KafkaLogConfig) -> Result<Self> {
        if config.partitions == 0 {
            return Err(LogError::Config("partitions must be at least 1".to_string()));
        }

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("client.id", &config.client_id)
            .set("message.timeout.ms", config.message_timeout_ms.to_string())
            .set("acks", "all")
            .set("enable.idempotence", "true")
            .create()
            .map_err(|e| LogError::Config(e.to_string()))?;

        info!(
            brokers = %config.brokers,
            topic = %config.topic,
            partitions = config.partitions,
            "Kafka log producer created"
        );

        Ok(Self { producer, config })
    }

    fn consumer_for(&self, partition: u32) -> Result<StreamConsumer> {
        ClientConfig::new()
            .set("bootstrap.servers", &self.config.brokers)
            .set("client.id", format!("{}-p{}", self.config.client_id, partition))
            .set("group.id", format!("{}-aggregator", self.config.client_id))
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set("isolation.level", "read_committed")
            .create()
            .map_err(|e| LogError::Config(e.to_string()))
    }
}

#[async_trait]
impl LogClient for KafkaLog {
    async fn publish(&self, partition_key: &[u8], payload: &[u8]) -> Result<RecordPosition> {
        let partition = partition_for(partition_key, self.config.partitions);
        let record = FutureRecord::to(&self.config.topic)
            .key(partition_key)
            .payload(payload)
            .partition(partition as i32);

        let timeout = Timeout::After(Duration::from_millis(self.config.message_timeout_ms));
        match self.producer.send(record, timeout).await {
            Ok((partition, offset)) => Ok(RecordPosition {
                partition: partition as u32,
                offset: offset as u64,
            }),
            Err((err, _)) => {
                warn!(partition, error = %err, "Kafka publish failed");
                Err(LogError::Kafka(err))
            }
        }
    }

    async fn consume(&self, partition: u32, from_offset: u64) -> Result<RecordStream> {
        if partition >= self.config.partitions {
            return Err(LogError::UnknownPartition {
                partition,
                count: self.config.partitions,
            });
        }

        let consumer = self.consumer_for(partition)?;
        let mut assignment = TopicPartitionList::new();
        assignment.add_partition_offset(
            &self.config.topic,
            partition as i32,
            Offset::Offset(from_offset as i64),
        )?;
        consumer.assign(&assignment)?;
        debug!(partition, from_offset, topic = %self.config.topic, "Assigned Kafka consumer");

        let records = stream::unfold(consumer, |consumer| async move {
            let item = match consumer.recv().await {
                Ok(message) => Ok(LogRecord {
                    partition: message.partition() as u32,
                    offset: message.offset() as u64,
                    payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
                }),
                Err(err) => Err(LogError::Kafka(err)),
            };
            Some((item, consumer))
        });

        Ok(records.boxed())
    }

    fn partition_count(&self) -> u32 {
        self.config.partitions
    }
}
