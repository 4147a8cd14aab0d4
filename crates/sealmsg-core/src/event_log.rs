//! Append-only JSONL audit trail with a SHA-256 hash chain.
//!
//! The engine reports lifecycle events through [`EventSink`]; `EventLog` is
//! the file-backed sink, `TracingEventSink` the default when no log file is
//! configured.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

const MAX_ROTATIONS: usize = 5;
const CHAIN_START: &str = "CHAIN_START";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventSeverity {
    Info,
    Warn,
    Error,
    Critical,
}

/// Observability collaborator for engine events.
pub trait EventSink: Send + Sync {
    fn record(&self, event_type: &str, severity: EventSeverity, data: serde_json::Value);
}

/// Forwards events to `tracing` only.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn record(&self, event_type: &str, severity: EventSeverity, data: serde_json::Value) {
        match severity {
            EventSeverity::Info => tracing::info!(event = event_type, %data),
            EventSeverity::Warn => tracing::warn!(event = event_type, %data),
            EventSeverity::Error | EventSeverity::Critical => {
                tracing::error!(event = event_type, %data)
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEntry {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub severity: EventSeverity,
    pub data: serde_json::Value,
    pub prev_hash: String,
    pub hash: String,
}

pub struct EventLog {
    path: PathBuf,
    inner: Mutex<LogState>,
    max_bytes: u64,
}

#[derive(Debug)]
struct LogState {
    last_seq: u64,
    last_hash: String,
}

impl EventLog {
    pub fn new<P: AsRef<Path>>(path: P, max_bytes: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let (last_seq, last_hash) = Self::load_state(&path)?;
        Ok(Self {
            path,
            inner: Mutex::new(LogState {
                last_seq,
                last_hash,
            }),
            max_bytes,
        })
    }

    fn load_state(path: &Path) -> Result<(u64, String)> {
        Ok(read_entries(path)?
            .pop()
            .map_or((0, CHAIN_START.to_string()), |last| (last.seq, last.hash)))
    }

    fn compute_hash(entry_without_hash: &serde_json::Value) -> String {
        let mut hasher = Sha256::new();
        hasher.update(entry_without_hash.to_string().as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn append(
        &self,
        event_type: &str,
        severity: EventSeverity,
        data: serde_json::Value,
    ) -> Result<EventEntry> {
        let mut state = self.inner.lock();
        self.rotate_if_needed(&mut state)?;
        let seq = state.last_seq + 1;
        let mut entry_value = serde_json::json!({
            "seq": seq,
            "timestamp": Utc::now(),
            "event_type": event_type,
            "severity": severity,
            "data": data,
            "prev_hash": state.last_hash,
        });
        let hash = Self::compute_hash(&entry_value);
        entry_value["hash"] = serde_json::Value::String(hash.clone());

        let entry: EventEntry = serde_json::from_value(entry_value)?;
        self.write_entry(&entry)?;
        state.last_seq = seq;
        state.last_hash = hash;
        Ok(entry)
    }

    fn write_entry(&self, entry: &EventEntry) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{}", serde_json::to_string(entry)?)?;
        file.flush()?;
        Ok(())
    }

    fn rotate_if_needed(&self, state: &mut LogState) -> Result<()> {
        match fs::metadata(&self.path) {
            Ok(meta) if meta.len() >= self.max_bytes => {}
            _ => return Ok(()),
        }
        for i in (1..=MAX_ROTATIONS).rev() {
            let rotated = self.path_with_suffix(i)?;
            if rotated.exists() {
                if i == MAX_ROTATIONS {
                    fs::remove_file(&rotated)?;
                } else {
                    fs::rename(&rotated, self.path_with_suffix(i + 1)?)?;
                }
            }
        }
        fs::rename(&self.path, self.path_with_suffix(1)?)?;
        // New file, new chain; seq stays monotonic.
        state.last_hash = CHAIN_START.to_string();
        Ok(())
    }

    /// Most recent first, optionally bounded by `since` and `limit`.
    pub fn read_recent(
        &self,
        since: Option<DateTime<Utc>>,
        limit: Option<usize>,
    ) -> Result<Vec<EventEntry>> {
        let mut entries: Vec<EventEntry> = read_entries(&self.path)?
            .into_iter()
            .filter(|e| since.map_or(true, |ts| e.timestamp >= ts))
            .collect();
        entries.reverse();
        if let Some(lim) = limit {
            entries.truncate(lim);
        }
        Ok(entries)
    }

    /// Recompute every hash in the current file and check the links.
    pub fn verify_chain(&self) -> Result<usize> {
        let entries = read_entries(&self.path)?;
        let mut prev: &str = CHAIN_START;
        for entry in &entries {
            if entry.prev_hash != prev {
                return Err(anyhow!("chain broken at seq {}", entry.seq));
            }
            let mut value = serde_json::to_value(entry)?;
            if let Some(obj) = value.as_object_mut() {
                obj.remove("hash");
            }
            if Self::compute_hash(&value) != entry.hash {
                return Err(anyhow!("hash mismatch at seq {}", entry.seq));
            }
            prev = entry.hash.as_str();
        }
        Ok(entries.len())
    }

    fn path_with_suffix(&self, index: usize) -> Result<PathBuf> {
        let filename = self
            .path
            .file_name()
            .ok_or_else(|| anyhow!("event log path has no file name"))?
            .to_string_lossy()
            .to_string();
        Ok(self.path.with_file_name(format!("{filename}.{index}")))
    }
}

/// Every entry of one log file in file order; a missing file is empty.
fn read_entries(path: &Path) -> Result<Vec<EventEntry>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };
    let mut entries = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        if !line.trim().is_empty() {
            entries.push(serde_json::from_str(&line)?);
        }
    }
    Ok(entries)
}

impl EventSink for EventLog {
    fn record(&self, event_type: &str, severity: EventSeverity, data: serde_json::Value) {
        TracingEventSink.record(event_type, severity, data.clone());
        if let Err(err) = self.append(event_type, severity, data) {
            tracing::warn!(error = %err, event = event_type, "event log append failed");
        }
    }
}
