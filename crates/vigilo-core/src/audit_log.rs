//! Hash-chained audit trail of the daemon's own lifecycle.
//!
//! Records `SERVICE_STARTED`, `SERVICE_STOPPED`, `STORE_RECOVERED`,
//! `BASELINE_RELOADED`, `ENTRY_ADDED`, `ENTRY_UPDATED`, `ENTRY_REMOVED` and
//! `HISTORY_PRUNED`. Change alerts live in the alert history, not here.

use crate::error::Result;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

const MAX_ROTATIONS: usize = 5;
const CHAIN_START: &str = "CHAIN_START";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditSeverity {
    Info,
    Warn,
    Error,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub severity: AuditSeverity,
    pub data: serde_json::Value,
    pub prev_hash: String,
    pub hash: String,
}

/// Result of walking the hash chain of the current log file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainStatus {
    Intact { entries: usize },
    Broken { at_seq: Option<u64>, line: usize },
}

/// Each line commits to its predecessor, so a truncated or edited trail
/// shows up in [`AuditLog::verify_chain`]. Rotated files start a new chain.
pub struct AuditLog {
    path: PathBuf,
    inner: Mutex<LogState>,
    max_bytes: u64,
}

#[derive(Debug)]
struct LogState {
    last_seq: u64,
    last_hash: String,
}

impl AuditLog {
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
        if !path.exists() {
            return Ok((0, CHAIN_START.to_string()));
        }
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        let mut last_seq = 0;
        let mut last_hash = CHAIN_START.to_string();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            // Resume the chain from the last entry that parses.
            match serde_json::from_str::<AuditEntry>(&line) {
                Ok(entry) => {
                    last_seq = entry.seq;
                    last_hash = entry.hash;
                }
                Err(e) => warn!(path = %path.display(), error = %e, "unreadable audit line"),
            }
        }
        Ok((last_seq, last_hash))
    }

    fn compute_hash(entry_without_hash: &serde_json::Value) -> String {
        let mut hasher = Sha256::new();
        hasher.update(entry_without_hash.to_string().as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn append(
        &self,
        event_type: &str,
        severity: AuditSeverity,
        data: serde_json::Value,
    ) -> Result<AuditEntry> {
        self.rotate_if_needed()?;
        let mut state = self.inner.lock();
        let seq = state.last_seq + 1;
        let prev_hash = state.last_hash.clone();
        let mut entry_value = serde_json::json!({
            "seq": seq,
            "timestamp": Utc::now(),
            "event_type": event_type,
            "severity": severity,
            "data": data,
            "prev_hash": prev_hash,
        });
        let hash = Self::compute_hash(&entry_value);
        entry_value["hash"] = serde_json::Value::String(hash.clone());

        let entry: AuditEntry = serde_json::from_value(entry_value)?;
        self.write_entry(&entry)?;
        state.last_seq = seq;
        state.last_hash = hash;
        Ok(entry)
    }

    fn write_entry(&self, entry: &AuditEntry) -> Result<()> {
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
        if let Ok(metadata) = fs::metadata(&self.path) {
            if metadata.len() < self.max_bytes {
                return Ok(());
            }
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
        if self.path.exists() {
            fs::rename(&self.path, self.path_with_suffix(1))?;
        }
        // new file, new chain; seq stays monotonic
        state.last_hash = CHAIN_START.to_string();
        Ok(())
    }

    /// Recompute every hash in the current file and check the links.
    pub fn verify_chain(&self) -> Result<ChainStatus> {
        if !self.path.exists() {
            return Ok(ChainStatus::Intact { entries: 0 });
        }
        let reader = BufReader::new(File::open(&self.path)?);
        let mut expected_prev = CHAIN_START.to_string();
        let mut count = 0;
        for (index, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: AuditEntry = match serde_json::from_str(&line) {
                Ok(e) => e,
                Err(_) => {
                    return Ok(ChainStatus::Broken {
                        at_seq: None,
                        line: index + 1,
                    })
                }
            };
            let body = serde_json::json!({
                "seq": entry.seq,
                "timestamp": entry.timestamp,
                "event_type": entry.event_type,
                "severity": entry.severity,
                "data": entry.data,
                "prev_hash": entry.prev_hash,
            });
            if entry.prev_hash != expected_prev || Self::compute_hash(&body) != entry.hash {
                return Ok(ChainStatus::Broken {
                    at_seq: Some(entry.seq),
                    line: index + 1,
                });
            }
            expected_prev = entry.hash;
            count += 1;
        }
        Ok(ChainStatus::Intact { entries: count })
    }

    /// Lifecycle events from the current file, newest first.
    pub fn read_recent(
        &self,
        since: Option<DateTime<Utc>>,
        limit: Option<usize>,
    ) -> Result<Vec<AuditEntry>> {
        if !self.path.exists() {
            return Ok(vec![]);
        }
        let reader = BufReader::new(File::open(&self.path)?);
        let mut entries = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let Ok(entry) = serde_json::from_str::<AuditEntry>(&line) else {
                continue;
            };
            if let Some(since_ts) = &since {
                if entry.timestamp < *since_ts {
                    continue;
                }
            }
            entries.push(entry);
        }
        entries.reverse();
        if let Some(lim) = limit {
            entries.truncate(lim);
        }
        Ok(entries)
    }

    fn path_with_suffix(&self, index: usize) -> PathBuf {
        let filename = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "audit.log".to_string());
        self.path.with_file_name(format!("{}.{}", filename, index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn chain_and_rotation() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("audit.log");
        let log = AuditLog::new(path.clone(), 512).unwrap();
        for i in 0..50 {
            let e = log
                .append("ENTRY_ADDED", AuditSeverity::Info, serde_json::json!({"i": i}))
                .unwrap();
            assert!(!e.hash.is_empty());
            assert_eq!(e.seq as usize, i + 1);
        }
        assert!(path.with_file_name("audit.log.1").exists());
        assert!(matches!(log.verify_chain().unwrap(), ChainStatus::Intact { .. }));
    }

    #[test]
    fn tampered_line_breaks_chain() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("audit.log");
        let log = AuditLog::new(path.clone(), 1 << 20).unwrap();
        for i in 0..3 {
            log.append("ENTRY_UPDATED", AuditSeverity::Info, serde_json::json!({"i": i}))
                .unwrap();
        }
        let text = fs::read_to_string(&path).unwrap();
        fs::write(&path, text.replacen("{\"i\":1}", "{\"i\":9}", 1)).unwrap();
        assert_eq!(
            log.verify_chain().unwrap(),
            ChainStatus::Broken {
                at_seq: Some(2),
                line: 2
            }
        );
    }

    #[test]
    fn sequence_resumes_after_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("audit.log");
        {
            let log = AuditLog::new(&path, 1 << 20).unwrap();
            log.append("STORE_RECOVERED", AuditSeverity::Warn, serde_json::json!({})).unwrap();
        }
        let log = AuditLog::new(&path, 1 << 20).unwrap();
        let e = log.append("SERVICE_STARTED", AuditSeverity::Info, serde_json::json!({})).unwrap();
        assert_eq!(e.seq, 2);
        assert_eq!(log.read_recent(None, None).unwrap()[0].event_type, "SERVICE_STARTED");
    }
}
