//! Telemetry collector
//!
//! Accepts raw JSON events, validates them and publishes accepted events to
//! the partitioned log through a bounded queue drained by a fixed pool of
//! publisher workers.
//!
//! Submitters never block on a full queue: they get [`SubmitOutcome::Throttled`]
//! immediately. Accepted events are either published (the submitter learns the
//! log position) or reported back as [`SubmitOutcome::Unavailable`] once the
//! retry budget is spent.

use dashmap::DashMap;
use eventlog::{LogClient, RecordPosition};
use futures::future::join_all;
use llm_telemetry_types::{DeadLetterRecord, Event, RejectionReason};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::backpressure::{BackpressureConfig, BackpressureStats, QueueMonitor};
use crate::dead_letter_queue::DeadLetterSink;
use crate::error::{CollectorError, Result};
use crate::retry::RetryPolicy;
use crate::validator::{EventValidator, Validation, ValidatorLimits};

/// Result of a single submit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SubmitOutcome {
    /// Durably appended to the log
    Accepted { partition: u32, offset: u64 },
    /// Failed validation; the payload was dead-lettered
    Rejected { reason: RejectionReason },
    /// Publish queue full; retry later
    Throttled,
    /// Log unreachable after `attempts` publish attempts, or collector shutting down
    Unavailable { attempts: u32 },
}

/// Collector configuration
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    /// Bounded publish queue capacity
    pub queue_capacity: usize,
    /// Number of publisher workers
    pub publisher_workers: usize,
    /// Validation limits
    pub limits: ValidatorLimits,
    /// Publish retry policy
    pub retry: RetryPolicy,
    /// Time allowed for workers to drain on shutdown
    pub shutdown_timeout: Duration,
    /// Queue warning threshold (percentage, 0-100)
    pub warning_threshold_percent: u8,
    /// Queue critical threshold (percentage, 0-100)
    pub critical_threshold_percent: u8,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 10_000,
            publisher_workers: 4,
            limits: ValidatorLimits::default(),
            retry: RetryPolicy::default(),
            shutdown_timeout: Duration::from_secs(30),
            warning_threshold_percent: 80,
            critical_threshold_percent: 95,
        }
    }
}

impl CollectorConfig {
    /// Validate the configuration
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.queue_capacity == 0 {
            return Err("queue_capacity must be greater than 0".to_string());
        }
        if self.publisher_workers == 0 {
            return Err("publisher_workers must be greater than 0".to_string());
        }
        if self.retry.max_attempts == 0 {
            return Err("retry.max_attempts must be greater than 0".to_string());
        }
        if self.warning_threshold_percent > self.critical_threshold_percent {
            return Err("warning threshold cannot exceed critical threshold".to_string());
        }
        Ok(())
    }
}

impl From<&llm_telemetry_config::CollectorConfig> for CollectorConfig {
    fn from(config: &llm_telemetry_config::CollectorConfig) -> Self {
        Self {
            queue_capacity: config.queue_capacity,
            publisher_workers: config.publisher_workers,
            limits: ValidatorLimits {
                max_latency_ms: config.max_latency_ms,
                max_tokens: config.max_tokens,
            },
            retry: RetryPolicy::from(&config.retry),
            shutdown_timeout: Duration::from_secs(config.shutdown_timeout_secs),
            warning_threshold_percent: config.warning_threshold_percent,
            critical_threshold_percent: config.critical_threshold_percent,
        }
    }
}

/// Collector statistics snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CollectorStats {
    /// Total submits
    pub received: u64,
    /// Submits that passed validation
    pub accepted: u64,
    /// Events appended to the log
    pub published: u64,
    /// Rejections by reason label
    pub rejected: BTreeMap<String, u64>,
    /// Submits refused because the queue was full
    pub throttled: u64,
    /// Submits answered with `Unavailable`
    pub unavailable: u64,
    /// Publish attempts that were retried
    pub publish_retries: u64,
    /// Events whose retry budget ran out
    pub publish_failures: u64,
    /// Rejected payloads that could not be dead-lettered
    pub dead_letter_failures: u64,
    /// Current queue length
    pub queue_len: usize,
    /// Queue capacity
    pub queue_capacity: usize,
}

impl CollectorStats {
    pub fn rejected_total(&self) -> u64 {
        self.rejected.values().sum()
    }
}

#[derive(Default)]
struct Counters {
    received: AtomicU64,
    accepted: AtomicU64,
    published: AtomicU64,
    rejected: DashMap<&'static str, u64>,
    throttled: AtomicU64,
    unavailable: AtomicU64,
    publish_retries: AtomicU64,
    publish_failures: AtomicU64,
    dead_letter_failures: AtomicU64,
}

impl Counters {
    fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn reject(&self, reason: &RejectionReason) {
        *self.rejected.entry(reason.label()).or_insert(0) += 1;
    }
}

struct PublishJob {
    event: Event,
    ack: oneshot::Sender<PublishResult>,
}

enum PublishResult {
    Published(RecordPosition),
    Failed { attempts: u32 },
}

/// Telemetry collector
pub struct Collector {
    config: CollectorConfig,
    validator: EventValidator,
    log: Arc<dyn LogClient>,
    dead_letters: Arc<dyn DeadLetterSink>,
    sender: RwLock<Option<mpsc::Sender<PublishJob>>>,
    receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<PublishJob>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    counters: Arc<Counters>,
    monitor: Arc<QueueMonitor>,
    started_at: Instant,
}

impl Collector {
    /// Create a collector. Publisher workers are not running until [`Collector::start`].
    pub fn new(
        config: CollectorConfig,
        log: Arc<dyn LogClient>,
        dead_letters: Arc<dyn DeadLetterSink>,
    ) -> Result<Self> {
        config.validate().map_err(CollectorError::ConfigError)?;

        let (sender, receiver) = mpsc::channel(config.queue_capacity);
        let monitor = Arc::new(QueueMonitor::new(BackpressureConfig {
            capacity: config.queue_capacity,
            warning_threshold_percent: config.warning_threshold_percent,
            critical_threshold_percent: config.critical_threshold_percent,
        }));

        Ok(Self {
            validator: EventValidator::new(config.limits),
            config,
            log,
            dead_letters,
            sender: RwLock::new(Some(sender)),
            receiver: Arc::new(tokio::sync::Mutex::new(receiver)),
            workers: Mutex::new(Vec::new()),
            counters: Arc::new(Counters::default()),
            monitor,
            started_at: Instant::now(),
        })
    }

    /// Spawn the publisher workers
    pub fn start(&self) -> Result<()> {
        let mut workers = self.workers.lock();
        if !workers.is_empty() {
            return Err(CollectorError::AlreadyStarted);
        }

        info!(
            workers = self.config.publisher_workers,
            capacity = self.config.queue_capacity,
            "Starting collector"
        );

        for worker_id in 0..self.config.publisher_workers {
            let receiver = Arc::clone(&self.receiver);
            let log = Arc::clone(&self.log);
            let counters = Arc::clone(&self.counters);
            let monitor = Arc::clone(&self.monitor);
            let policy = self.config.retry.clone();

            workers.push(tokio::spawn(async move {
                loop {
                    let job = {
                        let mut rx = receiver.lock().await;
                        rx.recv().await
                    };
                    let Some(job) = job else {
                        break;
                    };
                    monitor.dequeued();

                    let result = publish_with_retry(log.as_ref(), &policy, &counters, &job.event).await;
                    if job.ack.send(result).is_err() {
                        debug!(worker_id, "Submitter went away before publish completed");
                    }
                }
                debug!(worker_id, "Publisher worker stopped");
            }));
        }

        Ok(())
    }

    /// Submit one raw event
    pub async fn submit(&self, raw: serde_json::Value) -> SubmitOutcome {
        Counters::inc(&self.counters.received);

        let event = match self.validator.validate_value(&raw) {
            Validation::Accept(event) => event,
            Validation::Reject(reason) => {
                self.dead_letter(raw, reason).await;
                return SubmitOutcome::Rejected { reason };
            }
        };
        Counters::inc(&self.counters.accepted);

        let event_id = event.event_id().to_string();
        let (ack, done) = oneshot::channel();
        let sent = {
            let sender = self.sender.read();
            match sender.as_ref() {
                Some(sender) => {
                    // counted before the send so a worker can never dequeue it first
                    self.monitor.enqueued();
                    let result = sender.try_send(PublishJob { event, ack });
                    if result.is_err() {
                        self.monitor.dequeued();
                    }
                    Some(result)
                }
                None => None,
            }
        };

        match sent {
            Some(Ok(())) => {}
            Some(Err(mpsc::error::TrySendError::Full(_))) => {
                Counters::inc(&self.counters.throttled);
                debug!(event_id = %event_id, "Queue full, throttling submit");
                return SubmitOutcome::Throttled;
            }
            Some(Err(mpsc::error::TrySendError::Closed(_))) | None => {
                Counters::inc(&self.counters.unavailable);
                return SubmitOutcome::Unavailable { attempts: 0 };
            }
        }

        match done.await {
            Ok(PublishResult::Published(position)) => SubmitOutcome::Accepted {
                partition: position.partition,
                offset: position.offset,
            },
            Ok(PublishResult::Failed { attempts }) => {
                Counters::inc(&self.counters.unavailable);
                SubmitOutcome::Unavailable { attempts }
            }
            Err(_) => {
                error!(event_id = %event_id, "Publish job dropped without an outcome");
                Counters::inc(&self.counters.unavailable);
                SubmitOutcome::Unavailable { attempts: 0 }
            }
        }
    }

    /// Submit many raw events concurrently, preserving input order in the result
    pub async fn submit_batch(&self, raws: Vec<serde_json::Value>) -> Vec<SubmitOutcome> {
        join_all(raws.into_iter().map(|raw| self.submit(raw))).await
    }

    async fn dead_letter(&self, raw: serde_json::Value, reason: RejectionReason) {
        self.counters.reject(&reason);
        debug!(reason = %reason, "Rejected event");

        if let Err(e) = self
            .dead_letters
            .append(DeadLetterRecord::new(raw, reason))
            .await
        {
            Counters::inc(&self.counters.dead_letter_failures);
            error!(error = %e, reason = reason.label(), "Failed to dead-letter rejected event");
        }
    }

    /// Number of jobs waiting in the publish queue
    pub fn queue_len(&self) -> usize {
        self.sender
            .read()
            .as_ref()
            .map(|s| s.max_capacity() - s.capacity())
            .unwrap_or(0)
    }

    pub fn queue_capacity(&self) -> usize {
        self.config.queue_capacity
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Whether the collector still accepts submits
    pub fn is_running(&self) -> bool {
        self.sender.read().is_some()
    }

    pub fn backpressure_stats(&self) -> BackpressureStats {
        self.monitor.stats()
    }

    /// Get current statistics
    pub fn stats(&self) -> CollectorStats {
        let c = &self.counters;
        CollectorStats {
            received: c.received.load(Ordering::Relaxed),
            accepted: c.accepted.load(Ordering::Relaxed),
            published: c.published.load(Ordering::Relaxed),
            rejected: c
                .rejected
                .iter()
                .map(|entry| (entry.key().to_string(), *entry.value()))
                .collect(),
            throttled: c.throttled.load(Ordering::Relaxed),
            unavailable: c.unavailable.load(Ordering::Relaxed),
            publish_retries: c.publish_retries.load(Ordering::Relaxed),
            publish_failures: c.publish_failures.load(Ordering::Relaxed),
            dead_letter_failures: c.dead_letter_failures.load(Ordering::Relaxed),
            queue_len: self.queue_len(),
            queue_capacity: self.config.queue_capacity,
        }
    }

    /// Close the queue and wait for workers to drain in-flight jobs
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down collector");

        // Dropping the only sender closes the channel once queued jobs drain
        drop(self.sender.write().take());

        let handles: Vec<_> = std::mem::take(&mut *self.workers.lock());
        let drain = async {
            for (idx, handle) in handles.into_iter().enumerate() {
                if let Err(e) = handle.await {
                    error!(worker = idx, error = %e, "Publisher worker failed during shutdown");
                }
            }
        };

        match tokio::time::timeout(self.config.shutdown_timeout, drain).await {
            Ok(()) => {
                info!("Collector shutdown complete");
                Ok(())
            }
            Err(_) => {
                error!(
                    timeout = ?self.config.shutdown_timeout,
                    "Collector shutdown timed out"
                );
                Err(CollectorError::ShutdownTimeout(self.config.shutdown_timeout))
            }
        }
    }
}

async fn publish_with_retry(
    log: &dyn LogClient,
    policy: &RetryPolicy,
    counters: &Counters,
    event: &Event,
) -> PublishResult {
    let payload = match serde_json::to_vec(event) {
        Ok(payload) => payload,
        Err(e) => {
            error!(event_id = event.event_id(), error = %e, "Failed to encode event");
            Counters::inc(&counters.publish_failures);
            return PublishResult::Failed { attempts: 0 };
        }
    };
    let key = event.partition_key().to_bytes();

    let mut attempt = 0;
    loop {
        attempt += 1;
        match log.publish(&key, &payload).await {
            Ok(position) => {
                Counters::inc(&counters.published);
                debug!(
                    event_id = event.event_id(),
                    partition = position.partition,
                    offset = position.offset,
                    "Published event"
                );
                return PublishResult::Published(position);
            }
            Err(e) if e.is_transient() && attempt < policy.max_attempts => {
                Counters::inc(&counters.publish_retries);
                let delay = policy.delay_after(attempt);
                warn!(
                    event_id = event.event_id(),
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Publish failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                Counters::inc(&counters.publish_failures);
                error!(
                    event_id = event.event_id(),
                    attempts = attempt,
                    error = %e,
                    "Publish failed, giving up"
                );
                return PublishResult::Failed { attempts: attempt };
            }
        }
    }
}
