//! Append-only alert history.
//!
//! One JSON object per line. The daemon appends while administrative
//! commands may prune, so every append and every prune holds an exclusive
//! file lock on the sibling `history.lock`. Appends go out in a single
//! `write_all` on an `O_APPEND` handle; readers take no lock and skip a
//! torn trailing line if they race an append. Retention pruning is the only
//! rewrite and replaces the file atomically.

use crate::baseline::AlertMode;
use crate::error::Result;
use crate::lock::StoreLock;
use crate::report::AlertReport;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::Duration as StdDuration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub report: AlertReport,
    pub delivered_channel: AlertMode,
    pub delivery_succeeded: bool,
    pub dispatched_at: DateTime<Utc>,
}

pub struct HistoryLog {
    path: PathBuf,
    lock_path: PathBuf,
    lock_timeout: StdDuration,
    lock_retry: StdDuration,
    writer: Mutex<()>,
}

impl HistoryLog {
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(Self {
            lock_path: path.with_extension("lock"),
            path,
            lock_timeout: StdDuration::from_secs(5),
            lock_retry: StdDuration::from_millis(10),
            writer: Mutex::new(()),
        })
    }

    pub fn with_lock_policy(mut self, timeout: StdDuration, retry: StdDuration) -> Self {
        self.lock_timeout = timeout;
        self.lock_retry = retry;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(
        &self,
        report: &AlertReport,
        channel: AlertMode,
        succeeded: bool,
    ) -> Result<HistoryEntry> {
        let entry = HistoryEntry {
            report: report.clone(),
            delivered_channel: channel,
            delivery_succeeded: succeeded,
            dispatched_at: Utc::now(),
        };
        self.append_entry(&entry)?;
        debug!(path = %report.path.display(), channel = %channel, succeeded, "history entry appended");
        Ok(entry)
    }

    /// Append an already built entry under the history lock.
    pub fn append_entry(&self, entry: &HistoryEntry) -> Result<()> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');

        let _guard = self.writer.lock();
        let _lock = self.lock()?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(&line)?;
        file.sync_data()?;
        Ok(())
    }

    fn lock(&self) -> Result<StoreLock> {
        StoreLock::acquire(&self.lock_path, self.lock_timeout, self.lock_retry)
    }

    /// All entries, oldest first.
    pub fn read_all(&self) -> Result<Vec<HistoryEntry>> {
        let file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let reader = BufReader::new(file);
        let mut entries = Vec::new();
        for (index, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<HistoryEntry>(&line) {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!(line = index + 1, error = %e, "skipping unreadable history line"),
            }
        }
        Ok(entries)
    }

    /// Most recent first, optionally bounded by `since` and `limit`.
    pub fn read_recent(
        &self,
        since: Option<DateTime<Utc>>,
        limit: Option<usize>,
    ) -> Result<Vec<HistoryEntry>> {
        let mut entries: Vec<HistoryEntry> = self
            .read_all()?
            .into_iter()
            .filter(|e| since.map_or(true, |s| e.dispatched_at >= s))
            .collect();
        entries.reverse();
        if let Some(lim) = limit {
            entries.truncate(lim);
        }
        Ok(entries)
    }

    /// Drop entries dispatched more than `age` ago. Returns how many were
    /// removed.
    pub fn prune_older_than(&self, age: Duration) -> Result<usize> {
        let _guard = self.writer.lock();
        let _lock = self.lock()?;
        let entries = self.read_all()?;
        let cutoff = Utc::now() - age;
        let total = entries.len();
        let kept: Vec<&HistoryEntry> = entries
            .iter()
            .filter(|e| e.dispatched_at >= cutoff)
            .collect();
        let removed = total - kept.len();
        if removed == 0 {
            return Ok(0);
        }

        let parent = self
            .path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let mut staging = tempfile::Builder::new()
            .prefix(".history-")
            .tempfile_in(&parent)?;
        for entry in kept {
            let mut line = serde_json::to_vec(entry)?;
            line.push(b'\n');
            staging.write_all(&line)?;
        }
        staging.as_file().sync_all()?;
        staging
            .persist(&self.path)
            .map_err(|e| crate::error::VigiloError::Io(e.error))?;
        info!(removed, cutoff = %cutoff, "alert history pruned");
        Ok(removed)
    }
}
