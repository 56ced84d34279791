//! Durable aggregation state
//!
//! The state store owns these collections:
//!
//! - **offsets**: per partition, the last log offset whose effects are folded
//!   in, plus the largest event time seen on that partition
//! - **accumulators**: open windows keyed by [`WindowKey`]
//! - **fingerprints**: event fingerprints already counted by each open
//!   window, dropped when the window closes
//! - **closed**: tombstones for closed windows, holding the finalized row and
//!   whether the sink has acknowledged it
//!
//! Backends may keep a light per-window summary (contributing partitions and
//! count) next to the accumulator so listing open windows stays cheap.
//!
//! Every mutating operation is a single atomic commit. A batch's folds and
//! its offset advance land together or not at all, which is what makes
//! redelivery of already-committed offsets a no-op.

mod memory;
mod sled_backend;

pub use memory::MemoryStateStore;
pub use sled_backend::{SledConfig, SledStateStore};

use crate::aggregation::{Accumulator, MetricDelta};
use crate::error::{StateError, StateResult};
use crate::window::{WindowBounds, WindowKey};
use async_trait::async_trait;
use llm_telemetry_types::AggregateRow;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// Per-partition commit position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffsetCursor {
    /// Last offset whose effects are committed
    pub offset: u64,
    /// Largest event time folded from this partition
    pub max_event_time: Option<i64>,
}

impl OffsetCursor {
    /// Offset to resume consumption from
    pub fn next_offset(&self) -> u64 {
        self.offset.saturating_add(1)
    }
}

/// A contiguous run of log records from one partition, folded atomically
///
/// The offset range covers every record in the run, including ones that were
/// skipped as undecodable or late, so the cursor moves past them too.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FoldBatch {
    pub partition: u32,
    pub first_offset: u64,
    pub last_offset: u64,
    pub max_event_time: Option<i64>,
    pub deltas: Vec<(WindowKey, MetricDelta)>,
}

impl FoldBatch {
    pub fn new(partition: u32, first_offset: u64, last_offset: u64) -> Self {
        Self {
            partition,
            first_offset,
            last_offset,
            max_event_time: None,
            deltas: Vec::new(),
        }
    }

    /// Batch of exactly one event at `offset`
    pub fn single(partition: u32, offset: u64, key: WindowKey, delta: MetricDelta) -> Self {
        let mut batch = Self::new(partition, offset, offset);
        batch.push(key, delta);
        batch
    }

    pub fn push(&mut self, key: WindowKey, delta: MetricDelta) {
        self.observe_event_time(delta.event_time);
        self.deltas.push((key, delta));
    }

    pub fn observe_event_time(&mut self, event_time: i64) {
        self.max_event_time = Some(
            self.max_event_time
                .map_or(event_time, |max| max.max(event_time)),
        );
    }

    pub fn len(&self) -> usize {
        self.deltas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deltas.is_empty()
    }
}

/// What a commit did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitOutcome {
    /// Events folded into accumulators
    pub applied: usize,
    /// Events whose id the window had already counted
    pub duplicates: usize,
    /// Events addressed to windows that are already closed
    pub late: usize,
    /// The whole batch was at or below the stored offset and changed nothing
    pub replayed: bool,
}

/// Summary of one open window
#[derive(Debug, Clone, PartialEq)]
pub struct OpenWindow {
    pub key: WindowKey,
    pub partitions: BTreeSet<u32>,
    pub count: u64,
}

/// Tombstone of a closed window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosedWindow {
    pub row: AggregateRow,
    /// The sink has acknowledged the row
    pub emitted: bool,
}

impl ClosedWindow {
    pub fn window_end_millis(&self) -> i64 {
        self.row.window_end.timestamp_millis()
    }
}

/// Result of closing a window
#[derive(Debug, Clone, PartialEq)]
pub struct WindowClosure {
    pub accumulator: Accumulator,
    pub row: AggregateRow,
}

/// Counts reported by a successful verification pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VerifyReport {
    pub partitions: usize,
    pub open_windows: usize,
    pub closed_windows: usize,
    pub pending_emissions: usize,
}

/// Storage for aggregation state with atomic commits
///
/// Implementations must make each method atomic with respect to the others:
/// a reader never observes a batch's folds without its offset advance, nor a
/// removed accumulator without its tombstone.
#[async_trait]
pub trait AggregationStateStore: Send + Sync {
    /// Folds one event at `offset` into the window `key`
    ///
    /// Equivalent to committing a batch of one.
    async fn commit_fold(
        &self,
        partition: u32,
        offset: u64,
        key: WindowKey,
        delta: MetricDelta,
    ) -> StateResult<CommitOutcome> {
        self.commit_batch(FoldBatch::single(partition, offset, key, delta))
            .await
    }

    /// Folds a batch and advances the partition offset in one commit
    ///
    /// A batch ending at or below the stored offset is a no-op and reports
    /// `replayed`. A batch that starts at or below the stored offset but ends
    /// above it is a [`StateError::Corruption`]. Deltas addressed to closed
    /// windows are counted as late and dropped.
    async fn commit_batch(&self, batch: FoldBatch) -> StateResult<CommitOutcome>;

    /// Removes the accumulator for `key` and records its tombstone
    ///
    /// Returns `None` if the window has no accumulator or is already closed.
    async fn commit_close(
        &self,
        key: &WindowKey,
        bounds: WindowBounds,
    ) -> StateResult<Option<WindowClosure>>;

    /// Marks a closed window's row as acknowledged by the sink
    async fn ack_emitted(&self, key: &WindowKey) -> StateResult<()>;

    /// Closed rows the sink has not acknowledged, oldest window first
    async fn pending_emissions(&self) -> StateResult<Vec<AggregateRow>>;

    /// Committed cursor of every partition
    async fn load_offsets(&self) -> StateResult<HashMap<u32, OffsetCursor>>;

    /// Every open window with its contributing partitions
    async fn open_windows(&self) -> StateResult<Vec<OpenWindow>>;

    /// Current accumulator of an open window
    async fn accumulator(&self, key: &WindowKey) -> StateResult<Option<Accumulator>>;

    /// Tombstone of a closed window
    async fn closed_window(&self, key: &WindowKey) -> StateResult<Option<ClosedWindow>>;

    /// Checks cross-collection invariants, failing with
    /// [`StateError::Corruption`] if they do not hold
    async fn verify(&self) -> StateResult<VerifyReport>;

    /// Drops acknowledged tombstones whose window ended before `before`
    async fn prune_closed(&self, before: i64) -> StateResult<usize>;
}

/// How a batch relates to the committed cursor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BatchDisposition {
    Apply,
    Replay,
}

pub(crate) fn check_batch(
    stored: Option<&OffsetCursor>,
    batch: &FoldBatch,
) -> StateResult<BatchDisposition> {
    if batch.first_offset > batch.last_offset {
        return Err(StateError::corruption(format!(
            "batch for partition {} has inverted range {}..={}",
            batch.partition, batch.first_offset, batch.last_offset
        )));
    }
    match stored {
        Some(cursor) if batch.last_offset <= cursor.offset => Ok(BatchDisposition::Replay),
        Some(cursor) if batch.first_offset <= cursor.offset => {
            Err(StateError::corruption(format!(
                "batch {}..={} for partition {} straddles committed offset {}",
                batch.first_offset, batch.last_offset, batch.partition, cursor.offset
            )))
        }
        _ => Ok(BatchDisposition::Apply),
    }
}

pub(crate) fn advance_cursor(stored: Option<&OffsetCursor>, batch: &FoldBatch) -> OffsetCursor {
    let max_event_time = match (stored.and_then(|c| c.max_event_time), batch.max_event_time) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    };
    OffsetCursor {
        offset: batch.last_offset,
        max_event_time,
    }
}

/// Invariant checks shared by the backends
pub(crate) fn verify_windows<'a>(
    offsets: &HashMap<u32, OffsetCursor>,
    open: impl IntoIterator<Item = (&'a WindowKey, &'a BTreeSet<u32>)>,
    is_closed: impl Fn(&WindowKey) -> bool,
) -> StateResult<usize> {
    let mut open_windows = 0;
    for (key, partitions) in open {
        if is_closed(key) {
            return Err(StateError::corruption(format!(
                "window {key} is both open and closed"
            )));
        }
        if let Some(partition) = partitions.iter().find(|p| !offsets.contains_key(p))
        {
            return Err(StateError::corruption(format!(
                "window {key} holds events from partition {partition} with no committed offset"
            )));
        }
        open_windows += 1;
    }
    Ok(open_windows)
}
