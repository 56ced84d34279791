//! Sled-backed state store
//!
//! Each collection is a separate sled tree; commits span the trees in one
//! sled transaction. Values are bincode-encoded. Window keys encode the
//! window start with its sign bit flipped so byte order matches time order.
//!
//! Open windows are stored twice: the full accumulator, and a small summary
//! (partitions and count) in the `windows` tree for listing. Counted event
//! fingerprints live in their own tree under the window key, so a commit
//! writes one entry per new event instead of re-encoding a growing set.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sled::transaction::{
    ConflictableTransactionError, TransactionError, Transactional, TransactionalTree,
};
use sled::{Db, Tree};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use tracing::{debug, info, trace};

use super::{
    advance_cursor, check_batch, verify_windows, AggregationStateStore, BatchDisposition,
    ClosedWindow, CommitOutcome, FoldBatch, OffsetCursor, OpenWindow, VerifyReport,
    WindowClosure,
};
use crate::aggregation::Accumulator;
use crate::error::{StateError, StateResult};
use crate::window::{WindowBounds, WindowKey};
use llm_telemetry_types::{AggregateRow, DimensionKey};

const BACKEND: &str = "sled";
const OFFSETS_TREE: &str = "offsets";
const ACCUMULATORS_TREE: &str = "accumulators";
const WINDOWS_TREE: &str = "windows";
const FINGERPRINTS_TREE: &str = "fingerprints";
const CLOSED_TREE: &str = "closed";

/// Ends the window key inside a fingerprint key; never valid UTF-8
const FINGERPRINT_SEPARATOR: u8 = 0xFF;

/// Configuration for the sled state store
#[derive(Debug, Clone)]
pub struct SledConfig {
    /// Path to the database directory
    pub path: PathBuf,
    /// Page cache size in bytes
    pub cache_capacity: u64,
    /// Flush to disk before a commit returns
    pub sync_commits: bool,
}

impl Default for SledConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data/state"),
            cache_capacity: 64 * 1024 * 1024,
            sync_commits: true,
        }
    }
}

impl SledConfig {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            ..Default::default()
        }
    }

    pub fn with_cache_capacity(mut self, capacity: u64) -> Self {
        self.cache_capacity = capacity;
        self
    }

    pub fn with_sync_commits(mut self, sync: bool) -> Self {
        self.sync_commits = sync;
        self
    }
}

impl From<&llm_telemetry_config::StateConfig> for SledConfig {
    fn from(config: &llm_telemetry_config::StateConfig) -> Self {
        Self {
            path: config.path.clone(),
            cache_capacity: config.cache_capacity_bytes,
            sync_commits: config.sync_commits,
        }
    }
}

#[derive(Clone)]
struct Trees {
    db: Db,
    offsets: Tree,
    accumulators: Tree,
    windows: Tree,
    fingerprints: Tree,
    closed: Tree,
}

/// Listing entry kept next to each accumulator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct WindowSummary {
    partitions: BTreeSet<u32>,
    count: u64,
}

impl From<&Accumulator> for WindowSummary {
    fn from(accumulator: &Accumulator) -> Self {
        Self {
            partitions: accumulator.partitions().clone(),
            count: accumulator.count(),
        }
    }
}

/// Persistent state store on an embedded sled database
///
/// ## Example
///
/// ```rust,no_run
/// use processor::state::{AggregationStateStore, SledConfig, SledStateStore};
///
/// # async fn run() -> Result<(), processor::StateError> {
/// let store = SledStateStore::open(SledConfig::new("/var/lib/telemetry/state")).await?;
/// let report = store.verify().await?;
/// println!("{} open windows", report.open_windows);
/// # Ok(())
/// # }
/// ```
pub struct SledStateStore {
    trees: Trees,
    config: SledConfig,
}

impl SledStateStore {
    /// Opens or creates the database at `config.path`
    pub async fn open(config: SledConfig) -> StateResult<Self> {
        info!(path = ?config.path, "Opening sled state store");

        if let Some(parent) = config.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StateError::storage(BACKEND, format!("failed to create directory: {e}")))?;
        }

        let open_config = config.clone();
        let trees = tokio::task::spawn_blocking(move || -> StateResult<Trees> {
            let db = sled::Config::new()
                .path(&open_config.path)
                .cache_capacity(open_config.cache_capacity)
                .open()
                .map_err(|e| StateError::storage(BACKEND, format!("failed to open database: {e}")))?;
            let open_tree = |name: &str| {
                db.open_tree(name)
                    .map_err(|e| StateError::storage(BACKEND, format!("failed to open tree {name}: {e}")))
            };
            Ok(Trees {
                offsets: open_tree(OFFSETS_TREE)?,
                accumulators: open_tree(ACCUMULATORS_TREE)?,
                windows: open_tree(WINDOWS_TREE)?,
                fingerprints: open_tree(FINGERPRINTS_TREE)?,
                closed: open_tree(CLOSED_TREE)?,
                db,
            })
        })
        .await
        .map_err(|e| StateError::storage(BACKEND, format!("open task failed: {e}")))??;

        info!(
            partitions = trees.offsets.len(),
            open_windows = trees.accumulators.len(),
            closed_windows = trees.closed.len(),
            "Sled state store opened"
        );
        Ok(Self { trees, config })
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Flushes dirty pages to disk
    pub async fn flush(&self) -> StateResult<()> {
        self.trees
            .db
            .flush_async()
            .await
            .map_err(|e| StateError::storage(BACKEND, format!("flush failed: {e}")))?;
        Ok(())
    }

    /// Every tombstone, oldest window first
    pub async fn closed_windows(&self) -> StateResult<Vec<ClosedWindow>> {
        self.read(|trees| {
            trees
                .closed
                .iter()
                .map(|entry| {
                    let (key, value) = entry.map_err(storage_error)?;
                    decode(&value, &key_label(&key))
                })
                .collect()
        })
        .await
    }

    async fn read<T, F>(&self, op: F) -> StateResult<T>
    where
        F: FnOnce(&Trees) -> StateResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let trees = self.trees.clone();
        tokio::task::spawn_blocking(move || op(&trees))
            .await
            .map_err(|e| StateError::storage(BACKEND, format!("blocking task failed: {e}")))?
    }

    async fn write<T, F>(&self, op: F) -> StateResult<T>
    where
        F: FnOnce(&Trees) -> StateResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let sync = self.config.sync_commits;
        self.read(move |trees| {
            let result = op(trees)?;
            if sync {
                trees.db.flush().map_err(storage_error)?;
            }
            Ok(result)
        })
        .await
    }
}

#[async_trait]
impl AggregationStateStore for SledStateStore {
    async fn commit_batch(&self, batch: FoldBatch) -> StateResult<CommitOutcome> {
        self.write(move |trees| {
            let outcome = (
                &trees.offsets,
                &trees.accumulators,
                &trees.windows,
                &trees.fingerprints,
                &trees.closed,
            )
                .transaction(|(offsets, accumulators, windows, fingerprints, closed)| {
                    let fold_trees = FoldTrees {
                        offsets,
                        accumulators,
                        windows,
                        fingerprints,
                        closed,
                    };
                    fold_batch(&fold_trees, &batch)
                })
                .map_err(transaction_error)?;
            if outcome.replayed {
                trace!(partition = batch.partition, last_offset = batch.last_offset, "Replayed batch ignored");
            }
            Ok(outcome)
        })
        .await
    }

    async fn commit_close(
        &self,
        key: &WindowKey,
        bounds: WindowBounds,
    ) -> StateResult<Option<WindowClosure>> {
        let key = key.clone();
        self.write(move |trees| {
            let encoded = encode_window_key(&key);
            let closure = (&trees.accumulators, &trees.windows, &trees.closed)
                .transaction(|(accumulators, windows, closed)| {
                    if closed.get(&encoded)?.is_some() {
                        return Ok(None);
                    }
                    let Some(bytes) = accumulators.remove(encoded.as_slice())? else {
                        return Ok(None);
                    };
                    windows.remove(encoded.as_slice())?;
                    let accumulator: Accumulator =
                        decode(&bytes, &key.to_string()).map_err(ConflictableTransactionError::Abort)?;
                    let row = accumulator.finalize(bounds, &key.dimension_key);
                    let tombstone = ClosedWindow {
                        row: row.clone(),
                        emitted: false,
                    };
                    closed.insert(
                        encoded.as_slice(),
                        encode(&tombstone, &key.to_string()).map_err(ConflictableTransactionError::Abort)?,
                    )?;
                    Ok(Some(WindowClosure { accumulator, row }))
                })
                .map_err(transaction_error)?;

            // the tombstone now rejects the window's events, so its fingerprints can go
            let cleared = clear_fingerprints(&trees.fingerprints, &encoded)?;
            if let Some(closure) = &closure {
                debug!(window = %key, count = closure.row.count, cleared, "Window closed");
            }
            Ok(closure)
        })
        .await
    }

    async fn ack_emitted(&self, key: &WindowKey) -> StateResult<()> {
        let key = key.clone();
        self.write(move |trees| {
            let encoded = encode_window_key(&key);
            trees
                .closed
                .transaction(|closed| {
                    let Some(bytes) = closed.get(&encoded)? else {
                        return Err(ConflictableTransactionError::Abort(StateError::corruption(
                            format!("acknowledged window {key} has no tombstone"),
                        )));
                    };
                    let mut tombstone: ClosedWindow =
                        decode(&bytes, &key.to_string()).map_err(ConflictableTransactionError::Abort)?;
                    if !tombstone.emitted {
                        tombstone.emitted = true;
                        closed.insert(
                            encoded.as_slice(),
                            encode(&tombstone, &key.to_string()).map_err(ConflictableTransactionError::Abort)?,
                        )?;
                    }
                    Ok(())
                })
                .map_err(transaction_error)
        })
        .await
    }

    async fn pending_emissions(&self) -> StateResult<Vec<AggregateRow>> {
        let closed = self.closed_windows().await?;
        Ok(closed
            .into_iter()
            .filter(|closed| !closed.emitted)
            .map(|closed| closed.row)
            .collect())
    }

    async fn load_offsets(&self) -> StateResult<HashMap<u32, OffsetCursor>> {
        self.read(|trees| load_offsets(&trees.offsets)).await
    }

    async fn open_windows(&self) -> StateResult<Vec<OpenWindow>> {
        self.read(|trees| {
            load_summaries(&trees.windows).map(|entries| {
                entries
                    .into_iter()
                    .map(|(key, summary)| OpenWindow {
                        key,
                        partitions: summary.partitions,
                        count: summary.count,
                    })
                    .collect()
            })
        })
        .await
    }

    async fn accumulator(&self, key: &WindowKey) -> StateResult<Option<Accumulator>> {
        let key = key.clone();
        self.read(move |trees| {
            trees
                .accumulators
                .get(encode_window_key(&key))
                .map_err(storage_error)?
                .map(|bytes| decode(&bytes, &key.to_string()))
                .transpose()
        })
        .await
    }

    async fn closed_window(&self, key: &WindowKey) -> StateResult<Option<ClosedWindow>> {
        let key = key.clone();
        self.read(move |trees| {
            trees
                .closed
                .get(encode_window_key(&key))
                .map_err(storage_error)?
                .map(|bytes| decode(&bytes, &key.to_string()))
                .transpose()
        })
        .await
    }

    async fn verify(&self) -> StateResult<VerifyReport> {
        self.read(|trees| {
            let offsets = load_offsets(&trees.offsets)?;
            let summaries = load_summaries(&trees.windows)?;
            for (key, _) in &summaries {
                if !trees
                    .accumulators
                    .contains_key(encode_window_key(key))
                    .map_err(storage_error)?
                {
                    return Err(StateError::corruption(format!(
                        "window {key} is listed but has no accumulator"
                    )));
                }
            }
            if summaries.len() != trees.accumulators.len() {
                return Err(StateError::corruption(format!(
                    "{} accumulators but {} listed windows",
                    trees.accumulators.len(),
                    summaries.len()
                )));
            }

            let mut closed_windows = 0;
            let mut pending_emissions = 0;
            for entry in trees.closed.iter() {
                let (key, value) = entry.map_err(storage_error)?;
                decode_window_key(&key)?;
                let tombstone: ClosedWindow = decode(&value, &key_label(&key))?;
                closed_windows += 1;
                if !tombstone.emitted {
                    pending_emissions += 1;
                }
            }

            let open_windows = verify_windows(
                &offsets,
                summaries.iter().map(|(key, summary)| (key, &summary.partitions)),
                |key| {
                    trees
                        .closed
                        .contains_key(encode_window_key(key))
                        .unwrap_or(false)
                },
            )?;

            Ok(VerifyReport {
                partitions: offsets.len(),
                open_windows,
                closed_windows,
                pending_emissions,
            })
        })
        .await
    }

    async fn prune_closed(&self, before: i64) -> StateResult<usize> {
        self.write(move |trees| {
            let mut batch = sled::Batch::default();
            let mut pruned = Vec::new();
            for entry in trees.closed.iter() {
                let (key, value) = entry.map_err(storage_error)?;
                let tombstone: ClosedWindow = decode(&value, &key_label(&key))?;
                if tombstone.emitted && tombstone.window_end_millis() < before {
                    batch.remove(key.clone());
                    pruned.push(key);
                }
            }
            trees.closed.apply_batch(batch).map_err(storage_error)?;
            // fingerprints left behind by a close interrupted before its cleanup
            for key in &pruned {
                clear_fingerprints(&trees.fingerprints, key)?;
            }
            let pruned = pruned.len();
            if pruned > 0 {
                debug!(pruned, "Pruned closed window tombstones");
            }
            Ok(pruned)
        })
        .await
    }
}

/// Trees taking part in a batch commit
struct FoldTrees<'a> {
    offsets: &'a TransactionalTree,
    accumulators: &'a TransactionalTree,
    windows: &'a TransactionalTree,
    fingerprints: &'a TransactionalTree,
    closed: &'a TransactionalTree,
}

fn fold_batch(
    trees: &FoldTrees<'_>,
    batch: &FoldBatch,
) -> Result<CommitOutcome, ConflictableTransactionError<StateError>> {
    let partition_key = batch.partition.to_be_bytes();
    let stored: Option<OffsetCursor> = trees
        .offsets
        .get(partition_key)?
        .map(|bytes| decode(&bytes, &format!("offset/{}", batch.partition)))
        .transpose()
        .map_err(ConflictableTransactionError::Abort)?;

    let disposition =
        check_batch(stored.as_ref(), batch).map_err(ConflictableTransactionError::Abort)?;
    if disposition == BatchDisposition::Replay {
        return Ok(CommitOutcome {
            replayed: true,
            ..Default::default()
        });
    }

    // deltas for the same window are folded in memory and written once
    let mut touched: HashMap<Vec<u8>, (String, Accumulator)> = HashMap::new();
    let mut outcome = CommitOutcome::default();
    for (key, delta) in &batch.deltas {
        let encoded = encode_window_key(key);
        if trees.closed.get(&encoded)?.is_some() {
            outcome.late += 1;
            continue;
        }
        // reads see this transaction's own inserts, so repeats within the batch are caught too
        let fingerprint = fingerprint_key(&encoded, delta.fingerprint);
        if trees.fingerprints.get(&fingerprint)?.is_some() {
            outcome.duplicates += 1;
            continue;
        }
        trees.fingerprints.insert(fingerprint, Vec::<u8>::new())?;

        let (_, accumulator) = match touched.entry(encoded) {
            std::collections::hash_map::Entry::Occupied(entry) => entry.into_mut(),
            std::collections::hash_map::Entry::Vacant(entry) => {
                let label = key.to_string();
                let accumulator = trees
                    .accumulators
                    .get(entry.key().as_slice())?
                    .map(|bytes| decode(&bytes, &label))
                    .transpose()
                    .map_err(ConflictableTransactionError::Abort)?
                    .unwrap_or_default();
                entry.insert((label, accumulator))
            }
        };
        accumulator.fold(batch.partition, delta);
        outcome.applied += 1;
    }

    for (encoded, (label, accumulator)) in touched {
        let summary = encode(&WindowSummary::from(&accumulator), &label)
            .map_err(ConflictableTransactionError::Abort)?;
        let bytes = encode(&accumulator, &label).map_err(ConflictableTransactionError::Abort)?;
        trees.windows.insert(encoded.as_slice(), summary)?;
        trees.accumulators.insert(encoded, bytes)?;
    }

    let cursor = advance_cursor(stored.as_ref(), batch);
    let bytes = encode(&cursor, &format!("offset/{}", batch.partition))
        .map_err(ConflictableTransactionError::Abort)?;
    trees.offsets.insert(&partition_key[..], bytes)?;
    Ok(outcome)
}

fn fingerprint_prefix(encoded_key: &[u8]) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(encoded_key.len() + 9);
    prefix.extend_from_slice(encoded_key);
    prefix.push(FINGERPRINT_SEPARATOR);
    prefix
}

/// Window key, separator, fingerprint (8 bytes BE)
fn fingerprint_key(encoded_key: &[u8], fingerprint: u64) -> Vec<u8> {
    let mut key = fingerprint_prefix(encoded_key);
    key.extend_from_slice(&fingerprint.to_be_bytes());
    key
}

/// Removes every fingerprint recorded for one window
fn clear_fingerprints(tree: &Tree, encoded_key: &[u8]) -> StateResult<usize> {
    let mut batch = sled::Batch::default();
    let mut cleared = 0;
    for entry in tree.scan_prefix(fingerprint_prefix(encoded_key)) {
        let (key, _) = entry.map_err(storage_error)?;
        batch.remove(key);
        cleared += 1;
    }
    tree.apply_batch(batch).map_err(storage_error)?;
    Ok(cleared)
}

fn load_offsets(tree: &Tree) -> StateResult<HashMap<u32, OffsetCursor>> {
    let mut offsets = HashMap::new();
    for entry in tree.iter() {
        let (key, value) = entry.map_err(storage_error)?;
        let partition_bytes = <[u8; 4]>::try_from(&key[..]).map_err(|_| {
            StateError::corruption(format!("offset key {} is not a partition id", key_label(&key)))
        })?;
        let partition = u32::from_be_bytes(partition_bytes);
        offsets.insert(partition, decode(&value, &format!("offset/{partition}"))?);
    }
    Ok(offsets)
}

fn load_summaries(tree: &Tree) -> StateResult<Vec<(WindowKey, WindowSummary)>> {
    tree.iter()
        .map(|entry| {
            let (key, value) = entry.map_err(storage_error)?;
            let window_key = decode_window_key(&key)?;
            let summary = decode(&value, &window_key.to_string())?;
            Ok((window_key, summary))
        })
        .collect()
}

/// `start ^ sign bit` (8 bytes BE), model length (4 bytes BE), model, version
pub(crate) fn encode_window_key(key: &WindowKey) -> Vec<u8> {
    let model = key.dimension_key.model.as_bytes();
    let version = key.dimension_key.model_version.as_bytes();
    let mut bytes = Vec::with_capacity(12 + model.len() + version.len());
    bytes.extend_from_slice(&((key.window_start as u64) ^ (1 << 63)).to_be_bytes());
    bytes.extend_from_slice(&(model.len() as u32).to_be_bytes());
    bytes.extend_from_slice(model);
    bytes.extend_from_slice(version);
    bytes
}

pub(crate) fn decode_window_key(bytes: &[u8]) -> StateResult<WindowKey> {
    let malformed = || StateError::corruption(format!("malformed window key {}", hex::encode(bytes)));
    if bytes.len() < 12 {
        return Err(malformed());
    }
    let (start, rest) = bytes.split_at(8);
    let (model_len, rest) = rest.split_at(4);
    let start = u64::from_be_bytes(start.try_into().map_err(|_| malformed())?) ^ (1 << 63);
    let model_len = u32::from_be_bytes(model_len.try_into().map_err(|_| malformed())?) as usize;
    if rest.len() < model_len {
        return Err(malformed());
    }
    let (model, version) = rest.split_at(model_len);
    let model = std::str::from_utf8(model).map_err(|_| malformed())?;
    let version = std::str::from_utf8(version).map_err(|_| malformed())?;
    Ok(WindowKey::new(start as i64, DimensionKey::new(model, version)))
}

fn key_label(bytes: &[u8]) -> String {
    decode_window_key(bytes)
        .map(|key| key.to_string())
        .unwrap_or_else(|_| hex::encode(bytes))
}

fn encode<T: Serialize>(value: &T, key: &str) -> StateResult<Vec<u8>> {
    bincode::serialize(value).map_err(|e| StateError::SerializationFailed {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

fn decode<T: DeserializeOwned>(bytes: &[u8], key: &str) -> StateResult<T> {
    bincode::deserialize(bytes).map_err(|e| StateError::DeserializationFailed {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

fn storage_error(e: sled::Error) -> StateError {
    StateError::storage(BACKEND, e)
}

fn transaction_error(e: TransactionError<StateError>) -> StateError {
    match e {
        TransactionError::Abort(e) => e,
        TransactionError::Storage(e) => storage_error(e),
    }
}
