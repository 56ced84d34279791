//! Output sinks for finalized aggregate rows
//!
//! Rows are upserted by `(window_start, dimension_key)`. A closed window may be
//! delivered more than once after a crash; sinks must treat an identical row
//! as a no-op so redelivery leaves the output unchanged.

use async_trait::async_trait;
use llm_telemetry_types::{AggregateRow, DimensionKey};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use tracing::{debug, info, warn};

use crate::error::{SinkError, SinkResult};

type RowKey = (i64, DimensionKey);

fn row_key(row: &AggregateRow) -> RowKey {
    let (start, key) = row.key();
    (start, key.clone())
}

/// What an upsert did to the sink
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Replaced,
    /// An identical row was already present
    Unchanged,
}

/// Destination for closed-window rows
#[async_trait]
pub trait AggregateSink: Send + Sync {
    /// Writes `row`, replacing any row with the same key
    async fn upsert(&self, row: &AggregateRow) -> SinkResult<UpsertOutcome>;

    /// Makes previous upserts durable
    async fn flush(&self) -> SinkResult<()> {
        Ok(())
    }
}

/// Sink that keeps rows in memory
#[derive(Debug, Default)]
pub struct MemorySink {
    rows: Mutex<BTreeMap<RowKey, AggregateRow>>,
    writes: AtomicU64,
    failures: AtomicU32,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` upserts fail with a transient error
    pub fn fail_next_upserts(&self, count: u32) {
        self.failures.store(count, Ordering::SeqCst);
    }

    pub fn rows(&self) -> Vec<AggregateRow> {
        self.rows.lock().values().cloned().collect()
    }

    pub fn get(&self, window_start: i64, dimension_key: &DimensionKey) -> Option<AggregateRow> {
        self.rows
            .lock()
            .get(&(window_start, dimension_key.clone()))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.rows.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.lock().is_empty()
    }

    /// Upserts that changed the stored rows
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AggregateSink for MemorySink {
    async fn upsert(&self, row: &AggregateRow) -> SinkResult<UpsertOutcome> {
        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(SinkError::Unavailable("injected upsert failure".to_string()));
        }

        let mut rows = self.rows.lock();
        let outcome = match rows.insert(row_key(row), row.clone()) {
            None => UpsertOutcome::Inserted,
            Some(previous) if previous == *row => UpsertOutcome::Unchanged,
            Some(_) => UpsertOutcome::Replaced,
        };
        if outcome != UpsertOutcome::Unchanged {
            self.writes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(outcome)
    }
}

struct JsonLinesState {
    file: File,
    /// Content hash of the latest line written for each key
    index: HashMap<RowKey, String>,
}

/// Sink appending one JSON object per line to a file
///
/// Later lines supersede earlier ones with the same key. On open the file is
/// scanned to rebuild a content-hash index, so redelivering a row that is
/// already the latest for its key writes nothing.
pub struct JsonLinesSink {
    path: PathBuf,
    state: Mutex<JsonLinesState>,
}

impl JsonLinesSink {
    pub fn open(path: impl AsRef<Path>) -> SinkResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut index = HashMap::new();
        if path.exists() {
            for (line_no, line) in lines(&path)?.into_iter().enumerate() {
                match serde_json::from_slice::<AggregateRow>(&line) {
                    Ok(row) => {
                        index.insert(row_key(&row), content_hash(&line));
                    }
                    Err(e) => warn!(path = ?path, line = line_no + 1, error = %e, "Skipping unreadable sink line"),
                }
            }
        }

        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        if ends_without_newline(&path)? {
            // terminate a torn final line so the next row starts on its own line
            warn!(path = ?path, "Sink file ends in a partial line");
            file.write_all(b"\n")?;
            file.flush()?;
        }
        info!(path = ?path, rows = index.len(), "Opened JSON lines sink");
        Ok(Self {
            path,
            state: Mutex::new(JsonLinesState { file, index }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads every row in file order; unreadable lines are skipped
    pub fn read_rows(path: impl AsRef<Path>) -> SinkResult<Vec<AggregateRow>> {
        let path = path.as_ref();
        let mut rows = Vec::new();
        for line in lines(path)? {
            match serde_json::from_slice(&line) {
                Ok(row) => rows.push(row),
                Err(e) => warn!(path = ?path, error = %e, "Skipping unreadable sink line"),
            }
        }
        Ok(rows)
    }
}

/// Non-blank lines as raw bytes; a torn line may not be valid UTF-8
fn lines(path: &Path) -> SinkResult<Vec<Vec<u8>>> {
    let reader = BufReader::new(File::open(path)?);
    let mut lines = Vec::new();
    for line in reader.split(b'\n') {
        let line = line?;
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        lines.push(line);
    }
    Ok(lines)
}

fn ends_without_newline(path: &Path) -> SinkResult<bool> {
    let mut file = File::open(path)?;
    if file.metadata()?.len() == 0 {
        return Ok(false);
    }
    let mut last = [0u8; 1];
    file.seek(SeekFrom::End(-1))?;
    file.read_exact(&mut last)?;
    Ok(last[0] != b'\n')
}

#[async_trait]
impl AggregateSink for JsonLinesSink {
    async fn upsert(&self, row: &AggregateRow) -> SinkResult<UpsertOutcome> {
        let line = serde_json::to_vec(row).map_err(|e| SinkError::Serialization(e.to_string()))?;
        let hash = content_hash(&line);
        let key = row_key(row);

        let mut state = self.state.lock();
        let outcome = match state.index.get(&key) {
            Some(existing) if *existing == hash => return Ok(UpsertOutcome::Unchanged),
            Some(_) => UpsertOutcome::Replaced,
            None => UpsertOutcome::Inserted,
        };

        state.file.write_all(&line)?;
        state.file.write_all(b"\n")?;
        state.file.flush()?;
        state.index.insert(key, hash);
        debug!(window_start = %row.window_start, dimension = %row.dimension_key, ?outcome, "Row written");
        Ok(outcome)
    }

    async fn flush(&self) -> SinkResult<()> {
        self.state.lock().file.sync_data()?;
        Ok(())
    }
}

fn content_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}
