//! Dead Letter Queue (DLQ)
//!
//! Rejected payloads are appended here verbatim together with their rejection
//! reason. Records are append-only; nothing is ever rewritten in place except
//! by retention purging.
//!
//! Variants:
//! - `FileDeadLetterQueue`: JSON lines with size-based rotation
//! - `MemoryDeadLetterQueue`: in-process, for tests

use chrono::{DateTime, Utc};
use llm_telemetry_types::DeadLetterRecord;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tracing::{debug, info, warn};

const CURRENT_FILE: &str = "dlq_current.jsonl";
const ROTATED_PREFIX: &str = "dlq_";

/// DLQ error types
#[derive(Error, Debug)]
pub enum DLQError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

pub type Result<T> = std::result::Result<T, DLQError>;

/// File DLQ configuration
#[derive(Debug, Clone)]
pub struct DLQConfig {
    /// Directory holding the current file and its rotations
    pub file_path: PathBuf,
    /// Size in bytes after which the current file is rotated
    pub max_file_size_bytes: u64,
    /// Maximum number of rotated files to keep
    pub max_files: usize,
}

impl Default for DLQConfig {
    fn default() -> Self {
        Self {
            file_path: PathBuf::from("./data/dlq"),
            max_file_size_bytes: 100 * 1024 * 1024,
            max_files: 10,
        }
    }
}

impl From<&llm_telemetry_config::DeadLetterConfig> for DLQConfig {
    fn from(config: &llm_telemetry_config::DeadLetterConfig) -> Self {
        Self {
            file_path: config.path.clone(),
            max_file_size_bytes: config.max_file_size_bytes,
            max_files: config.max_files,
        }
    }
}

/// DLQ statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DLQStats {
    /// Records appended since start
    pub total_entries: u64,
    /// Records purged by retention
    pub total_purged: u64,
    /// Current file size in bytes
    pub file_size_bytes: u64,
    /// Rotations performed since start
    pub rotations: u64,
}

/// Append-only destination for rejected events
#[async_trait::async_trait]
pub trait DeadLetterSink: Send + Sync {
    /// Append one record
    async fn append(&self, record: DeadLetterRecord) -> Result<()>;

    /// Get DLQ statistics
    async fn stats(&self) -> Result<DLQStats>;
}

/// JSON-lines file DLQ with size-based rotation
pub struct FileDeadLetterQueue {
    config: DLQConfig,
    current_file: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
    total_entries: AtomicU64,
    total_purged: AtomicU64,
    rotations: AtomicU64,
}

impl FileDeadLetterQueue {
    pub fn new(config: DLQConfig) -> Result<Self> {
        if config.max_file_size_bytes == 0 {
            return Err(DLQError::ConfigError(
                "max_file_size_bytes must be greater than 0".to_string(),
            ));
        }
        fs::create_dir_all(&config.file_path)?;
        let current_file = config.file_path.join(CURRENT_FILE);

        Ok(Self {
            config,
            current_file,
            write_lock: tokio::sync::Mutex::new(()),
            total_entries: AtomicU64::new(0),
            total_purged: AtomicU64::new(0),
            rotations: AtomicU64::new(0),
        })
    }

    pub fn directory(&self) -> &Path {
        &self.config.file_path
    }

    /// Read every record, oldest rotation first, current file last
    pub async fn read_all(&self) -> Result<Vec<DeadLetterRecord>> {
        let _guard = self.write_lock.lock().await;
        let mut records = Vec::new();
        for path in self.files_oldest_first()? {
            records.extend(read_records(&path)?);
        }
        Ok(records)
    }

    /// Drop records received before `cutoff`, returning how many were removed
    pub async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let _guard = self.write_lock.lock().await;
        let mut removed = 0;

        for path in self.files_oldest_first()? {
            let records = read_records(&path)?;
            let before = records.len();
            let kept: Vec<_> = records
                .into_iter()
                .filter(|r| r.received_at >= cutoff)
                .collect();
            if kept.len() == before {
                continue;
            }
            removed += before - kept.len();

            if kept.is_empty() && path != self.current_file {
                fs::remove_file(&path)?;
            } else {
                write_records(&path, &kept)?;
            }
        }

        self.total_purged.fetch_add(removed as u64, Ordering::Relaxed);
        info!(removed, %cutoff, "Purged old dead-letter records");
        Ok(removed)
    }

    fn rotate_if_needed(&self) -> Result<()> {
        if !self.current_file.exists() {
            return Ok(());
        }
        if fs::metadata(&self.current_file)?.len() < self.config.max_file_size_bytes {
            return Ok(());
        }

        let sequence = self.rotations.fetch_add(1, Ordering::Relaxed);
        let rotated = self.config.file_path.join(format!(
            "{}{}_{:06}.jsonl",
            ROTATED_PREFIX,
            Utc::now().format("%Y%m%d%H%M%S%3f"),
            sequence
        ));
        fs::rename(&self.current_file, &rotated)?;
        info!(path = ?rotated, "Rotated dead-letter file");

        self.cleanup_old_files()
    }

    fn cleanup_old_files(&self) -> Result<()> {
        let mut rotated = self.rotated_files()?;
        while rotated.len() > self.config.max_files {
            let oldest = rotated.remove(0);
            fs::remove_file(&oldest)?;
            info!(path = ?oldest, "Removed old dead-letter file");
        }
        Ok(())
    }

    /// Rotated files sorted by name, which orders them by rotation time
    fn rotated_files(&self) -> Result<Vec<PathBuf>> {
        let mut files: Vec<PathBuf> = fs::read_dir(&self.config.file_path)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with(ROTATED_PREFIX) && n.ends_with(".jsonl") && n != CURRENT_FILE)
                    .unwrap_or(false)
            })
            .collect();
        files.sort();
        Ok(files)
    }

    fn files_oldest_first(&self) -> Result<Vec<PathBuf>> {
        let mut files = self.rotated_files()?;
        if self.current_file.exists() {
            files.push(self.current_file.clone());
        }
        Ok(files)
    }
}

#[async_trait::async_trait]
impl DeadLetterSink for FileDeadLetterQueue {
    async fn append(&self, record: DeadLetterRecord) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.rotate_if_needed()?;

        let json = serde_json::to_string(&record)
            .map_err(|e| DLQError::SerializationError(e.to_string()))?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.current_file)?;
        let mut writer = BufWriter::new(file);
        writeln!(writer, "{}", json)?;
        writer.flush()?;

        self.total_entries.fetch_add(1, Ordering::Relaxed);
        debug!(id = %record.id, reason = record.reason.label(), "Appended dead-letter record");
        Ok(())
    }

    async fn stats(&self) -> Result<DLQStats> {
        let file_size_bytes = match fs::metadata(&self.current_file) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };
        Ok(DLQStats {
            total_entries: self.total_entries.load(Ordering::Relaxed),
            total_purged: self.total_purged.load(Ordering::Relaxed),
            file_size_bytes,
            rotations: self.rotations.load(Ordering::Relaxed),
        })
    }
}

/// Read every record of a dead-letter file; unparsable lines are skipped
pub fn read_records(path: &Path) -> Result<Vec<DeadLetterRecord>> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let reader = BufReader::new(File::open(path)?);
    let mut records = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<DeadLetterRecord>(&line) {
            Ok(record) => records.push(record),
            Err(e) => warn!(path = ?path, error = %e, "Skipping unreadable dead-letter line"),
        }
    }
    Ok(records)
}

fn write_records(path: &Path, records: &[DeadLetterRecord]) -> Result<()> {
    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    let mut writer = BufWriter::new(file);
    for record in records {
        let json = serde_json::to_string(record)
            .map_err(|e| DLQError::SerializationError(e.to_string()))?;
        writeln!(writer, "{}", json)?;
    }
    writer.flush()?;
    Ok(())
}

/// In-memory DLQ
#[derive(Default)]
pub struct MemoryDeadLetterQueue {
    records: Mutex<Vec<DeadLetterRecord>>,
}

impl MemoryDeadLetterQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<DeadLetterRecord> {
        self.records.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

#[async_trait::async_trait]
impl DeadLetterSink for MemoryDeadLetterQueue {
    async fn append(&self, record: DeadLetterRecord) -> Result<()> {
        self.records.lock().push(record);
        Ok(())
    }

    async fn stats(&self) -> Result<DLQStats> {
        Ok(DLQStats {
            total_entries: self.records.lock().len() as u64,
            ..DLQStats::default()
        })
    }
}
