//! In-memory state store
//!
//! Holds every collection behind one lock, so every operation is atomic.
//! Nothing survives a restart; intended for tests and ephemeral pipelines.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{debug, trace};

use super::{
    advance_cursor, check_batch, verify_windows, AggregationStateStore, BatchDisposition,
    ClosedWindow, CommitOutcome, FoldBatch, OffsetCursor, OpenWindow, VerifyReport,
    WindowClosure,
};
use crate::aggregation::Accumulator;
use crate::error::{StateError, StateResult};
use crate::window::{WindowBounds, WindowKey};
use llm_telemetry_types::AggregateRow;

#[derive(Debug, Default)]
struct MemoryState {
    offsets: HashMap<u32, OffsetCursor>,
    accumulators: BTreeMap<WindowKey, Accumulator>,
    fingerprints: BTreeMap<WindowKey, HashSet<u64>>,
    closed: BTreeMap<WindowKey, ClosedWindow>,
}

/// State store kept entirely in process memory
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    state: Mutex<MemoryState>,
    failures: AtomicU32,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` mutating calls fail with a transient error
    pub fn fail_next_writes(&self, count: u32) {
        self.failures.store(count, Ordering::SeqCst);
    }

    fn injected_failure(&self) -> StateResult<()> {
        let consumed = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match consumed {
            Ok(_) => Err(StateError::storage("memory", "injected write failure")),
            Err(_) => Ok(()),
        }
    }
}

#[async_trait]
impl AggregationStateStore for MemoryStateStore {
    async fn commit_batch(&self, batch: FoldBatch) -> StateResult<CommitOutcome> {
        self.injected_failure()?;
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let stored = state.offsets.get(&batch.partition).copied();
        if check_batch(stored.as_ref(), &batch)? == BatchDisposition::Replay {
            trace!(partition = batch.partition, last_offset = batch.last_offset, "Replayed batch ignored");
            return Ok(CommitOutcome {
                replayed: true,
                ..Default::default()
            });
        }

        let mut outcome = CommitOutcome::default();
        for (key, delta) in &batch.deltas {
            if state.closed.contains_key(key) {
                outcome.late += 1;
                continue;
            }
            let seen = state.fingerprints.entry(key.clone()).or_default();
            if !seen.insert(delta.fingerprint) {
                outcome.duplicates += 1;
                continue;
            }
            state
                .accumulators
                .entry(key.clone())
                .or_default()
                .fold(batch.partition, delta);
            outcome.applied += 1;
        }
        state
            .offsets
            .insert(batch.partition, advance_cursor(stored.as_ref(), &batch));
        Ok(outcome)
    }

    async fn commit_close(
        &self,
        key: &WindowKey,
        bounds: WindowBounds,
    ) -> StateResult<Option<WindowClosure>> {
        self.injected_failure()?;
        let mut state = self.state.lock();

        if state.closed.contains_key(key) {
            return Ok(None);
        }
        let Some(accumulator) = state.accumulators.remove(key) else {
            return Ok(None);
        };
        state.fingerprints.remove(key);
        let row = accumulator.finalize(bounds, &key.dimension_key);
        state.closed.insert(
            key.clone(),
            ClosedWindow {
                row: row.clone(),
                emitted: false,
            },
        );
        debug!(window = %key, count = row.count, "Window closed");
        Ok(Some(WindowClosure { accumulator, row }))
    }

    async fn ack_emitted(&self, key: &WindowKey) -> StateResult<()> {
        self.injected_failure()?;
        let mut state = self.state.lock();
        match state.closed.get_mut(key) {
            Some(closed) => {
                closed.emitted = true;
                Ok(())
            }
            None => Err(StateError::corruption(format!(
                "acknowledged window {key} has no tombstone"
            ))),
        }
    }

    async fn pending_emissions(&self) -> StateResult<Vec<AggregateRow>> {
        let state = self.state.lock();
        Ok(state
            .closed
            .values()
            .filter(|closed| !closed.emitted)
            .map(|closed| closed.row.clone())
            .collect())
    }

    async fn load_offsets(&self) -> StateResult<HashMap<u32, OffsetCursor>> {
        Ok(self.state.lock().offsets.clone())
    }

    async fn open_windows(&self) -> StateResult<Vec<OpenWindow>> {
        let state = self.state.lock();
        Ok(state
            .accumulators
            .iter()
            .map(|(key, accumulator)| OpenWindow {
                key: key.clone(),
                partitions: accumulator.partitions().clone(),
                count: accumulator.count(),
            })
            .collect())
    }

    async fn accumulator(&self, key: &WindowKey) -> StateResult<Option<Accumulator>> {
        Ok(self.state.lock().accumulators.get(key).cloned())
    }

    async fn closed_window(&self, key: &WindowKey) -> StateResult<Option<ClosedWindow>> {
        Ok(self.state.lock().closed.get(key).cloned())
    }

    async fn verify(&self) -> StateResult<VerifyReport> {
        let state = self.state.lock();
        let open = state
            .accumulators
            .iter()
            .map(|(key, accumulator)| (key, accumulator.partitions()));
        let open_windows =
            verify_windows(&state.offsets, open, |key| state.closed.contains_key(key))?;
        Ok(VerifyReport {
            partitions: state.offsets.len(),
            open_windows,
            closed_windows: state.closed.len(),
            pending_emissions: state.closed.values().filter(|c| !c.emitted).count(),
        })
    }

    async fn prune_closed(&self, before: i64) -> StateResult<usize> {
        let mut state = self.state.lock();
        let initial = state.closed.len();
        state
            .closed
            .retain(|_, closed| !(closed.emitted && closed.window_end_millis() < before));
        Ok(initial - state.closed.len())
    }
}
