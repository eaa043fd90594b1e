//! Append-only audit journal of enforcement and administrative actions.
//!
//! Each line is a JSON entry whose `hash` is the SHA-256 of the entry
//! without its hash, chained through `prev_hash`. The chain restarts at
//! `CHAIN_START` in every rotated file; `seq` stays monotonic.

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
pub const DEFAULT_MAX_BYTES: u64 = 5 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventSeverity {
    Info,
    Warn,
    Error,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub severity: EventSeverity,
    pub data: serde_json::Value,
    pub prev_hash: String,
    pub hash: String,
}

pub struct Journal {
    path: PathBuf,
    inner: Mutex<LogState>,
    max_bytes: u64,
}

#[derive(Debug)]
struct LogState {
    last_seq: u64,
    last_hash: String,
}

impl Journal {
    pub fn new<P: AsRef<Path>>(path: P, max_bytes: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
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

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load_state(path: &Path) -> Result<(u64, String)> {
        let mut last_seq = 0;
        let mut last_hash = CHAIN_START.to_string();
        for entry in Self::read_entries(path)? {
            last_seq = entry.seq;
            last_hash = entry.hash;
        }
        Ok((last_seq, last_hash))
    }

    fn read_entries(path: &Path) -> Result<Vec<JournalEntry>> {
        if !path.exists() {
            return Ok(vec![]);
        }
        let reader = BufReader::new(File::open(path)?);
        let mut entries = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            entries.push(serde_json::from_str(&line)?);
        }
        Ok(entries)
    }

    fn compute_hash(entry_without_hash: &serde_json::Value) -> String {
        let mut hasher = Sha256::new();
        hasher.update(entry_without_hash.to_string().as_bytes());
        hex::encode(hasher.finalize())
    }

    fn unhashed_value(
        seq: u64,
        timestamp: &DateTime<Utc>,
        event_type: &str,
        severity: &EventSeverity,
        data: &serde_json::Value,
        prev_hash: &str,
    ) -> serde_json::Value {
        serde_json::json!({
            "seq": seq,
            "timestamp": timestamp,
            "event_type": event_type,
            "severity": severity,
            "data": data,
            "prev_hash": prev_hash,
        })
    }

    pub fn append(
        &self,
        event_type: &str,
        severity: EventSeverity,
        data: serde_json::Value,
    ) -> Result<JournalEntry> {
        self.rotate_if_needed()?;
        let mut state = self.inner.lock();
        let seq = state.last_seq + 1;
        let timestamp = Utc::now();
        let value = Self::unhashed_value(
            seq,
            &timestamp,
            event_type,
            &severity,
            &data,
            &state.last_hash,
        );
        let hash = Self::compute_hash(&value);
        let entry = JournalEntry {
            seq,
            timestamp,
            event_type: event_type.to_string(),
            severity,
            data,
            prev_hash: state.last_hash.clone(),
            hash: hash.clone(),
        };
        self.write_entry(&entry)?;
        state.last_seq = seq;
        state.last_hash = hash;
        Ok(entry)
    }

    fn write_entry(&self, entry: &JournalEntry) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let line = serde_json::to_string(entry)?;
        writeln!(file, "{}", line)?;
        file.flush()?;
        Ok(())
    }

    fn rotate_if_needed(&self) -> Result<()> {
        let mut state = self.inner.lock();
        match fs::metadata(&self.path) {
            Ok(metadata) if metadata.len() >= self.max_bytes => {}
            _ => return Ok(()),
        }
        for i in (1..=MAX_ROTATIONS).rev() {
            let rotated = self.path_with_suffix(i);
            if rotated.exists() {
                if i == MAX_ROTATIONS {
                    fs::remove_file(&rotated)?;
                } else {
                    fs::rename(&rotated, self.path_with_suffix(i + 1))?;
                }
            }
        }
        fs::rename(&self.path, self.path_with_suffix(1))?;
        state.last_hash = CHAIN_START.to_string();
        Ok(())
    }

    /// Read recent entries from the current file, newest first.
    pub fn read_recent(
        &self,
        since: Option<DateTime<Utc>>,
        limit: Option<usize>,
    ) -> Result<Vec<JournalEntry>> {
        let mut entries: Vec<JournalEntry> = Self::read_entries(&self.path)?
            .into_iter()
            .filter(|e| since.map_or(true, |ts| e.timestamp >= ts))
            .collect();
        entries.reverse();
        if let Some(lim) = limit {
            entries.truncate(lim);
        }
        Ok(entries)
    }

    /// Recompute every hash in the current file and check the chain links.
    pub fn verify_chain(&self) -> Result<usize> {
        let entries = Self::read_entries(&self.path)?;
        let mut prev = CHAIN_START.to_string();
        for entry in &entries {
            if entry.prev_hash != prev {
                return Err(anyhow!("chain broken before seq {}", entry.seq));
            }
            let value = Self::unhashed_value(
                entry.seq,
                &entry.timestamp,
                &entry.event_type,
                &entry.severity,
                &entry.data,
                &entry.prev_hash,
            );
            if Self::compute_hash(&value) != entry.hash {
                return Err(anyhow!("hash mismatch at seq {}", entry.seq));
            }
            prev = entry.hash.clone();
        }
        Ok(entries.len())
    }

    fn path_with_suffix(&self, index: usize) -> PathBuf {
        let filename = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "journal".to_string());
        self.path.with_file_name(format!("{}.{}", filename, index))
    }
}
