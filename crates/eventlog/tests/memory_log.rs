//! Integration tests for the in-memory log through the `LogClient` trait

use eventlog::{InMemoryLog, LogClient};
use futures::StreamExt;
use std::sync::Arc;

#[tokio::test]
async fn concurrent_publishers_keep_per_partition_order() {
    let log: Arc<dyn LogClient> = Arc::new(InMemoryLog::new(4));

    let mut handles = Vec::new();
    for producer in 0..4u64 {
        let log = Arc::clone(&log);
        handles.push(tokio::spawn(async move {
            let mut positions = Vec::new();
            for seq in 0..50u64 {
                let payload = format!("{producer}:{seq}");
                let pos = log
                    .publish(&producer.to_be_bytes(), payload.as_bytes())
                    .await
                    .unwrap();
                positions.push(pos);
            }
            positions
        }));
    }

    for handle in handles {
        let positions = handle.await.unwrap();
        let partition = positions[0].partition;
        assert!(positions.iter().all(|p| p.partition == partition));
        assert!(positions.windows(2).all(|w| w[0].offset < w[1].offset));
    }
}

#[tokio::test]
async fn consumer_sees_every_record_in_order() {
    let log = InMemoryLog::new(1);
    for i in 0..100u32 {
        log.publish(b"key", &i.to_be_bytes()).await.unwrap();
    }

    let records: Vec<_> = log.consume(0, 0).await.unwrap().take(100).collect().await;
    for (expected, record) in records.into_iter().enumerate() {
        let record = record.unwrap();
        assert_eq!(record.offset, expected as u64);
        assert_eq!(record.payload, (expected as u32).to_be_bytes().to_vec());
    }
}
