//! Windowed aggregation over the partitioned event log
//!
//! One worker runs per log partition and processes that partition strictly in
//! offset order. For each batch of records a worker:
//!
//! 1. decodes events, skipping undecodable (poison) records;
//! 2. drops events whose window its watermark has already passed;
//! 3. commits the folds together with the new offset in one state transaction;
//! 4. closes every open window once all partitions of the log have watermarks
//!    at or past the window end, then upserts the row to the sink and
//!    acknowledges the emission.
//!
//! A crash between closing a window and acknowledging its row leaves a pending
//! tombstone; [`WindowAggregator::recover`] redelivers those rows on startup.

use chrono::Utc;
use eventlog::{LogClient, LogRecord, RecordStream};
use futures::StreamExt;
use llm_telemetry_types::{AggregateRow, Event};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, trace, warn};

use crate::aggregation::MetricDelta;
use crate::error::{ProcessorError, Result, Transient};
use crate::sink::AggregateSink;
use crate::state::{AggregationStateStore, CommitOutcome, FoldBatch, OffsetCursor};
use crate::watermark::{WatermarkConfig, WatermarkTracker};
use crate::window::{TumblingWindows, WindowBounds, WindowKey};

const PRUNE_INTERVAL: Duration = Duration::from_secs(60);

/// Runtime configuration for [`WindowAggregator`]
#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    pub window_size: Duration,
    pub allowed_lateness: Duration,
    /// `None` disables idle watermark advancement
    pub idle_timeout: Option<Duration>,
    /// Maximum records folded per commit
    pub batch_size: usize,
    /// How often idle partitions are checked for closable windows
    pub idle_tick: Duration,
    /// How long acknowledged tombstones are kept
    pub closed_retention: Duration,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            window_size: Duration::from_secs(60),
            allowed_lateness: Duration::from_secs(10),
            idle_timeout: Some(Duration::from_secs(30)),
            batch_size: 500,
            idle_tick: Duration::from_secs(1),
            closed_retention: Duration::from_secs(86_400),
            retry_base_delay: Duration::from_millis(100),
            retry_max_delay: Duration::from_secs(5),
        }
    }
}

impl AggregatorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(ProcessorError::Configuration(
                "batch_size must be greater than 0".to_string(),
            ));
        }
        if self.idle_tick.is_zero() {
            return Err(ProcessorError::Configuration(
                "idle_tick must be greater than 0".to_string(),
            ));
        }
        if self.retry_base_delay > self.retry_max_delay {
            return Err(ProcessorError::Configuration(
                "retry_base_delay must not exceed retry_max_delay".to_string(),
            ));
        }
        Ok(())
    }
}

impl From<&llm_telemetry_config::AggregatorConfig> for AggregatorConfig {
    fn from(config: &llm_telemetry_config::AggregatorConfig) -> Self {
        Self {
            window_size: Duration::from_secs(config.window_size_secs),
            allowed_lateness: Duration::from_secs(config.allowed_lateness_secs),
            idle_timeout: (config.idle_timeout_secs > 0)
                .then(|| Duration::from_secs(config.idle_timeout_secs)),
            batch_size: config.batch_size,
            idle_tick: Duration::from_millis(config.idle_tick_ms),
            closed_retention: Duration::from_secs(config.closed_retention_secs),
            ..Self::default()
        }
    }
}

#[derive(Debug, Default)]
struct AggregatorCounters {
    events_folded: AtomicU64,
    duplicates_skipped: AtomicU64,
    late_dropped: AtomicU64,
    poison_records: AtomicU64,
    windows_emitted: AtomicU64,
    emissions_redelivered: AtomicU64,
    batches_committed: AtomicU64,
    batches_replayed: AtomicU64,
    commit_retries: AtomicU64,
    emission_retries: AtomicU64,
}

/// Snapshot of aggregator counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregatorStats {
    pub events_folded: u64,
    pub duplicates_skipped: u64,
    pub late_dropped: u64,
    pub poison_records: u64,
    pub windows_emitted: u64,
    pub emissions_redelivered: u64,
    pub batches_committed: u64,
    pub batches_replayed: u64,
    pub commit_retries: u64,
    pub emission_retries: u64,
}

/// Tumbling-window aggregator over every partition of a log
pub struct WindowAggregator {
    config: AggregatorConfig,
    windows: TumblingWindows,
    log: Arc<dyn LogClient>,
    store: Arc<dyn AggregationStateStore>,
    sink: Arc<dyn AggregateSink>,
    watermarks: WatermarkTracker,
    counters: AggregatorCounters,
    shutdown: watch::Sender<bool>,
}

impl WindowAggregator {
    pub fn new(
        config: AggregatorConfig,
        log: Arc<dyn LogClient>,
        store: Arc<dyn AggregationStateStore>,
        sink: Arc<dyn AggregateSink>,
    ) -> Result<Self> {
        config.validate()?;
        let windows = TumblingWindows::new(config.window_size)?;
        let watermarks = WatermarkTracker::new(WatermarkConfig {
            allowed_lateness: config.allowed_lateness,
            idle_timeout: config.idle_timeout,
        });
        watermarks.register(0..log.partition_count(), Instant::now());
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            config,
            windows,
            log,
            store,
            sink,
            watermarks,
            counters: AggregatorCounters::default(),
            shutdown,
        })
    }

    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }

    pub fn windows(&self) -> TumblingWindows {
        self.windows
    }

    pub fn watermarks(&self) -> &WatermarkTracker {
        &self.watermarks
    }

    /// Asks every worker to stop after its current batch
    pub fn shutdown(&self) {
        info!("Window aggregator shutdown requested");
        self.shutdown.send_replace(true);
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    pub fn stats(&self) -> AggregatorStats {
        let c = &self.counters;
        AggregatorStats {
            events_folded: c.events_folded.load(Ordering::Relaxed),
            duplicates_skipped: c.duplicates_skipped.load(Ordering::Relaxed),
            late_dropped: c.late_dropped.load(Ordering::Relaxed),
            poison_records: c.poison_records.load(Ordering::Relaxed),
            windows_emitted: c.windows_emitted.load(Ordering::Relaxed),
            emissions_redelivered: c.emissions_redelivered.load(Ordering::Relaxed),
            batches_committed: c.batches_committed.load(Ordering::Relaxed),
            batches_replayed: c.batches_replayed.load(Ordering::Relaxed),
            commit_retries: c.commit_retries.load(Ordering::Relaxed),
            emission_retries: c.emission_retries.load(Ordering::Relaxed),
        }
    }

    /// Verifies the store, redelivers pending rows and seeds watermarks
    ///
    /// Returns the committed cursor of every partition.
    pub async fn recover(&self) -> Result<HashMap<u32, OffsetCursor>> {
        let report = self
            .retry_forever("verify", &self.counters.commit_retries, || self.store.verify())
            .await?;
        info!(
            partitions = report.partitions,
            open_windows = report.open_windows,
            closed_windows = report.closed_windows,
            pending_emissions = report.pending_emissions,
            "State store verified"
        );

        let pending = self
            .retry_forever("pending_emissions", &self.counters.commit_retries, || {
                self.store.pending_emissions()
            })
            .await?;
        for row in pending {
            let key = WindowKey::new(row.window_start.timestamp_millis(), row.dimension_key.clone());
            self.emit(&key, &row).await?;
            self.counters.emissions_redelivered.fetch_add(1, Ordering::Relaxed);
            info!(window = %key, count = row.count, "Redelivered pending emission");
        }

        let cursors = self
            .retry_forever("load_offsets", &self.counters.commit_retries, || {
                self.store.load_offsets()
            })
            .await?;
        for (partition, cursor) in &cursors {
            if let Some(max_event_time) = cursor.max_event_time {
                self.watermarks.restore(*partition, max_event_time);
            }
        }
        Ok(cursors)
    }

    /// Recovers state, then runs one worker per partition until shutdown
    ///
    /// Returns the first worker failure, after every worker has stopped.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let cursors = self.recover().await?;
        let partitions = self.log.partition_count();
        info!(partitions, "Starting window aggregator");

        let maintenance = tokio::spawn(Arc::clone(&self).maintenance_loop());

        let mut workers = Vec::with_capacity(partitions as usize);
        for partition in 0..partitions {
            let from_offset = cursors
                .get(&partition)
                .map(OffsetCursor::next_offset)
                .unwrap_or(0);
            let worker = Arc::clone(&self);
            workers.push((
                partition,
                tokio::spawn(async move { worker.run_partition(partition, from_offset).await }),
            ));
        }

        let mut first_error = None;
        for (partition, handle) in workers {
            let failure = match handle.await {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e),
                Err(e) => Some(ProcessorError::WorkerFailed {
                    partition,
                    reason: e.to_string(),
                }),
            };
            if let Some(e) = failure {
                error!(partition, error = %e, "Partition worker failed");
                first_error.get_or_insert(e);
            }
        }

        // workers are done; stop maintenance even if they exited on their own
        self.shutdown.send_replace(true);
        let _ = maintenance.await;

        match first_error {
            Some(e) => Err(e),
            None => {
                info!(stats = ?self.stats(), "Window aggregator stopped");
                Ok(())
            }
        }
    }

    async fn run_partition(self: Arc<Self>, partition: u32, from_offset: u64) -> Result<()> {
        match self.consume_partition(partition, from_offset).await {
            Err(ProcessorError::Interrupted { operation }) => {
                info!(partition, operation, "Partition worker interrupted by shutdown");
                Ok(())
            }
            other => other,
        }
    }

    async fn consume_partition(&self, partition: u32, from_offset: u64) -> Result<()> {
        let mut shutdown = self.shutdown.subscribe();
        let stream: RecordStream = self
            .retry_forever("consume", &self.counters.commit_retries, || {
                self.log.consume(partition, from_offset)
            })
            .await?;
        let mut batches = stream.ready_chunks(self.config.batch_size);

        let mut ticker = tokio::time::interval(self.config.idle_tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(partition, from_offset, "Partition worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                biased;
                _ = shutdown.changed() => {}
                chunk = batches.next() => {
                    let Some(chunk) = chunk else {
                        info!(partition, "Log stream ended");
                        break;
                    };
                    let mut records = Vec::with_capacity(chunk.len());
                    for item in chunk {
                        match item {
                            Ok(record) => records.push(record),
                            Err(e) => warn!(partition, error = %e, "Failed to read from log"),
                        }
                    }
                    if !records.is_empty() {
                        self.process_batch(partition, records).await?;
                    }
                    self.close_ready_windows(partition).await?;
                }
                _ = ticker.tick() => {
                    self.close_ready_windows(partition).await?;
                }
            }
        }
        info!(partition, "Partition worker stopped");
        Ok(())
    }

    /// Folds a run of consecutive records from one partition in a single commit
    pub async fn process_batch(
        &self,
        partition: u32,
        records: Vec<LogRecord>,
    ) -> Result<CommitOutcome> {
        let (Some(first), Some(last)) = (records.first(), records.last()) else {
            return Ok(CommitOutcome::default());
        };
        let mut batch = FoldBatch::new(partition, first.offset, last.offset);
        let mut late_before_commit = 0u64;

        for record in &records {
            let event: Event = match serde_json::from_slice(&record.payload) {
                Ok(event) => event,
                Err(e) => {
                    self.counters.poison_records.fetch_add(1, Ordering::Relaxed);
                    warn!(partition, offset = record.offset, error = %e, "Skipping undecodable record");
                    continue;
                }
            };

            let key = self.windows.key_for(&event);
            let window_end = self.windows.window_end(key.window_start);
            if self.watermarks.watermark(partition).has_passed(window_end) {
                late_before_commit += 1;
                debug!(
                    partition,
                    offset = record.offset,
                    event_id = event.event_id(),
                    window = %key,
                    "Dropping late event"
                );
                continue;
            }

            batch.push(key, MetricDelta::from_event(&event));
            self.watermarks.observe(partition, event.event_time_millis());
        }

        let outcome = self
            .retry_forever("commit_batch", &self.counters.commit_retries, || {
                self.store.commit_batch(batch.clone())
            })
            .await?;

        let c = &self.counters;
        if outcome.replayed {
            c.batches_replayed.fetch_add(1, Ordering::Relaxed);
        } else {
            c.batches_committed.fetch_add(1, Ordering::Relaxed);
            c.events_folded.fetch_add(outcome.applied as u64, Ordering::Relaxed);
            c.duplicates_skipped.fetch_add(outcome.duplicates as u64, Ordering::Relaxed);
            c.late_dropped
                .fetch_add(late_before_commit + outcome.late as u64, Ordering::Relaxed);
        }
        trace!(
            partition,
            first_offset = batch.first_offset,
            last_offset = batch.last_offset,
            applied = outcome.applied,
            duplicates = outcome.duplicates,
            replayed = outcome.replayed,
            "Batch committed"
        );
        Ok(outcome)
    }

    /// Closes and emits every open window that all partitions have passed
    ///
    /// Any partition may still carry events for a window, whether or not it
    /// has contributed yet, so the slowest partition of the log decides.
    /// `partition` identifies the calling worker in logs.
    pub async fn close_ready_windows(&self, partition: u32) -> Result<usize> {
        self.watermarks.advance_idle(Instant::now());
        let slowest = self
            .watermarks
            .min_watermark(0..self.log.partition_count());
        if slowest.is_min() {
            trace!(partition, "A partition has no watermark yet");
            return Ok(0);
        }

        let open = self
            .retry_forever("open_windows", &self.counters.commit_retries, || {
                self.store.open_windows()
            })
            .await?;

        let mut emitted = 0;
        for window in open {
            let start = window.key.window_start;
            let bounds = WindowBounds::new(start, self.windows.window_end(start));
            if !slowest.has_passed(bounds.end) {
                continue;
            }

            let closure = self
                .retry_forever("commit_close", &self.counters.commit_retries, || {
                    self.store.commit_close(&window.key, bounds)
                })
                .await?;
            if let Some(closure) = closure {
                self.emit(&window.key, &closure.row).await?;
                self.counters.windows_emitted.fetch_add(1, Ordering::Relaxed);
                emitted += 1;
            }
        }
        Ok(emitted)
    }

    /// Drops acknowledged tombstones older than the retention period
    pub async fn prune_tombstones(&self) -> Result<usize> {
        let retention = i64::try_from(self.config.closed_retention.as_millis()).unwrap_or(i64::MAX);
        let before = Utc::now().timestamp_millis().saturating_sub(retention);
        let pruned = self
            .retry_forever("prune_closed", &self.counters.commit_retries, || {
                self.store.prune_closed(before)
            })
            .await?;
        Ok(pruned)
    }

    async fn emit(&self, key: &WindowKey, row: &AggregateRow) -> Result<()> {
        let outcome = self
            .retry_forever("sink_upsert", &self.counters.emission_retries, || {
                self.sink.upsert(row)
            })
            .await?;
        self.retry_forever("ack_emitted", &self.counters.commit_retries, || {
            self.store.ack_emitted(key)
        })
        .await?;
        debug!(window = %key, count = row.count, ?outcome, "Window emitted");
        Ok(())
    }

    async fn maintenance_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        let mut ticker = tokio::time::interval(PRUNE_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            if *shutdown.borrow() {
                return;
            }
            tokio::select! {
                _ = shutdown.changed() => {}
                _ = ticker.tick() => {
                    match self.prune_tombstones().await {
                        Ok(0) => {}
                        Ok(pruned) => debug!(pruned, "Pruned closed windows"),
                        Err(ProcessorError::Interrupted { .. }) => return,
                        Err(e) => warn!(error = %e, "Failed to prune closed windows"),
                    }
                }
            }
        }
    }

    /// Retries transient failures with capped exponential backoff until
    /// success, a fatal error, or shutdown
    async fn retry_forever<T, E, F, Fut>(
        &self,
        operation: &'static str,
        retries: &AtomicU64,
        mut op: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Transient + Display + Into<ProcessorError>,
    {
        let mut shutdown = self.shutdown.subscribe();
        let mut delay = self.config.retry_base_delay;
        let mut attempt: u64 = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() => {
                    attempt += 1;
                    retries.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient failure, retrying"
                    );
                }
                Err(e) => return Err(e.into()),
            }

            if *shutdown.borrow_and_update() {
                return Err(ProcessorError::Interrupted {
                    operation: operation.to_string(),
                });
            }
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => {
                    return Err(ProcessorError::Interrupted {
                        operation: operation.to_string(),
                    });
                }
            }
            delay = (delay * 2).min(self.config.retry_max_delay);
        }
    }
}
