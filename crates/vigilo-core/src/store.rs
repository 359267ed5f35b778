//! Durable baseline store.
//!
//! The whole mapping lives in one JSON document that is only ever replaced
//! atomically: the new content is written to a temp file in the same
//! directory, fsynced, then renamed over the old one. Readers therefore see
//! either the previous or the next mapping, never a partial write.
//!
//! Every mutation runs as load–mutate–save under [`StoreLock`]. Writes are
//! totally ordered by lock acquisition; last writer wins.

use crate::baseline::{BaselineEntry, BaselineMap};
use crate::error::{Result, VigiloError};
use crate::lock::StoreLock;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

const STORE_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct StoreDocument {
    version: u32,
    entries: Vec<BaselineEntry>,
}

/// Outcome of falling back from a corrupt store.
#[derive(Debug, Clone)]
pub struct StoreRecovery {
    pub reason: String,
    /// Where the unreadable document was moved so an operator can inspect it.
    pub preserved_at: Option<PathBuf>,
}

impl StoreRecovery {
    pub fn hint(&self) -> String {
        match &self.preserved_at {
            Some(p) => format!(
                "baseline store was unreadable ({}); the corrupt file was preserved at {} and monitoring continues with an empty baseline",
                self.reason,
                p.display()
            ),
            None => format!(
                "baseline store was unreadable ({}); monitoring continues with an empty baseline",
                self.reason
            ),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BaselineStore {
    path: PathBuf,
    lock_path: PathBuf,
    lock_timeout: Duration,
    lock_retry: Duration,
}

impl BaselineStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let lock_path = path.with_extension("lock");
        Self {
            path,
            lock_path,
            lock_timeout: Duration::from_secs(5),
            lock_retry: Duration::from_millis(50),
        }
    }

    pub fn with_lock_policy(mut self, timeout: Duration, retry: Duration) -> Self {
        self.lock_timeout = timeout;
        self.lock_retry = retry;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Point-in-time read without the lock. A missing document is an empty
    /// store; anything unparsable is `StoreCorrupt`.
    pub fn load(&self) -> Result<BaselineMap> {
        let bytes = match fs::read(&self.path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BaselineMap::new()),
            Err(e) => return Err(e.into()),
        };
        self.parse(&bytes)
    }

    fn parse(&self, bytes: &[u8]) -> Result<BaselineMap> {
        let corrupt = |reason: String| VigiloError::StoreCorrupt {
            path: self.path.clone(),
            reason,
        };
        let doc: StoreDocument =
            serde_json::from_slice(bytes).map_err(|e| corrupt(e.to_string()))?;
        if doc.version != STORE_VERSION {
            return Err(corrupt(format!("unsupported store version {}", doc.version)));
        }
        let mut map = BaselineMap::new();
        for entry in doc.entries {
            entry.validate().map_err(|e| corrupt(e.to_string()))?;
            if map.insert(entry.path.clone(), entry).is_some() {
                return Err(corrupt("duplicate path in store".into()));
            }
        }
        debug!(path = %self.path.display(), entries = map.len(), "baseline store loaded");
        Ok(map)
    }

    /// Load, falling back to an empty mapping when the document is corrupt.
    /// The corrupt document is moved aside (never silently overwritten) and
    /// the returned recovery carries the hint to surface to the operator.
    pub fn load_or_recover(&self) -> Result<(BaselineMap, Option<StoreRecovery>)> {
        match self.load() {
            Ok(map) => Ok((map, None)),
            Err(VigiloError::StoreCorrupt { reason, .. }) => {
                let _lock = self.lock()?;
                // Another writer may have repaired it while we waited.
                if let Ok(map) = self.load() {
                    return Ok((map, None));
                }
                let target = self.path.with_file_name(format!(
                    "{}.corrupt-{}",
                    self.file_name(),
                    Utc::now().format("%Y%m%dT%H%M%S")
                ));
                let preserved_at = match fs::rename(&self.path, &target) {
                    Ok(()) => Some(target),
                    Err(e) => {
                        warn!(error = %e, "could not preserve corrupt baseline store");
                        None
                    }
                };
                let recovery = StoreRecovery {
                    reason,
                    preserved_at,
                };
                warn!("{}", recovery.hint());
                Ok((BaselineMap::new(), Some(recovery)))
            }
            Err(e) => Err(e),
        }
    }

    /// Replace the whole mapping atomically.
    pub fn save(&self, map: &BaselineMap) -> Result<()> {
        let _lock = self.lock()?;
        self.write_atomic(map)
    }

    /// Run `f` on the freshly loaded mapping under the writer lock and
    /// persist the result. Nothing is written if `f` fails.
    pub fn update<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut BaselineMap) -> Result<T>,
    {
        let _lock = self.lock()?;
        let mut map = self.load()?;
        let out = f(&mut map)?;
        self.write_atomic(&map)?;
        Ok(out)
    }

    /// Insert or replace an entry, returning the previous one.
    pub fn upsert(&self, entry: BaselineEntry) -> Result<Option<BaselineEntry>> {
        entry.validate()?;
        self.update(|map| Ok(map.insert(entry.path.clone(), entry)))
    }

    /// Insert an entry that must not exist yet.
    pub fn insert_new(&self, entry: BaselineEntry) -> Result<()> {
        entry.validate()?;
        self.update(|map| {
            if map.contains_key(&entry.path) {
                return Err(VigiloError::InvalidEntry(format!(
                    "{} is already monitored",
                    entry.path.display()
                )));
            }
            map.insert(entry.path.clone(), entry);
            Ok(())
        })
    }

    pub fn remove(&self, path: &Path) -> Result<Option<BaselineEntry>> {
        self.update(|map| Ok(map.remove(path)))
    }

    fn lock(&self) -> Result<StoreLock> {
        if let Some(parent) = self.lock_path.parent() {
            fs::create_dir_all(parent)?;
        }
        StoreLock::acquire(&self.lock_path, self.lock_timeout, self.lock_retry)
    }

    fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "baseline.json".to_string())
    }

    fn write_atomic(&self, map: &BaselineMap) -> Result<()> {
        for entry in map.values() {
            entry.validate()?;
        }
        let doc = StoreDocument {
            version: STORE_VERSION,
            entries: map.values().cloned().collect(),
        };
        let mut bytes = serde_json::to_vec_pretty(&doc)?;
        bytes.push(b'\n');

        let parent = self
            .path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        fs::create_dir_all(&parent)?;
        let mut staging = tempfile::Builder::new()
            .prefix(".baseline-")
            .tempfile_in(&parent)?;
        staging.write_all(&bytes)?;
        staging.as_file().sync_all()?;
        restrict_permissions(staging.path());
        staging
            .persist(&self.path)
            .map_err(|e| VigiloError::Io(e.error))?;

        #[cfg(unix)]
        {
            match fs::OpenOptions::new().read(true).open(&parent) {
                Ok(dir) => {
                    if let Err(e) = dir.sync_all() {
                        debug!(dir = %parent.display(), error = %e, "store directory fsync failed");
                    }
                }
                Err(e) => debug!(dir = %parent.display(), error = %e, "store directory not opened for fsync"),
            }
        }

        debug!(path = %self.path.display(), entries = map.len(), "baseline store saved");
        Ok(())
    }
}

fn restrict_permissions(path: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(0o600)) {
            warn!(path = %path.display(), error = %e, "could not restrict store file permissions");
        }
    }
    #[cfg(not(unix))]
    let _ = path;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::baseline::{AlertMode, WatchEvent};
    use crate::snapshot::snapshot;
    use tempfile::tempdir;

    fn entry_for(path: &Path) -> BaselineEntry {
        BaselineEntry::new(
            path.to_path_buf(),
            snapshot(path).unwrap(),
            WatchEvent::preset("default").unwrap(),
            AlertMode::Log,
        )
        .unwrap()
    }

    #[test]
    fn save_of_load_is_byte_stable() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a.conf");
        let b = dir.path().join("b.conf");
        fs::write(&a, b"alpha").unwrap();
        fs::write(&b, b"beta").unwrap();
        let store = BaselineStore::new(dir.path().join("baseline.json"));
        store.upsert(entry_for(&b)).unwrap();
        store.upsert(entry_for(&a)).unwrap();

        let before = fs::read(store.path()).unwrap();
        let map = store.load().unwrap();
        store.save(&map).unwrap();
        let after = fs::read(store.path()).unwrap();
        assert_eq!(before, after);
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn missing_store_loads_empty() {
        let dir = tempdir().unwrap();
        let store = BaselineStore::new(dir.path().join("baseline.json"));
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn corrupt_store_is_preserved_and_recovered() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("baseline.json");
        fs::write(&path, b"{ not json").unwrap();
        let store = BaselineStore::new(&path);
        assert!(matches!(store.load(), Err(VigiloError::StoreCorrupt { .. })));

        let (map, recovery) = store.load_or_recover().unwrap();
        assert!(map.is_empty());
        let recovery = recovery.unwrap();
        let preserved = recovery.preserved_at.clone().unwrap();
        assert_eq!(fs::read(&preserved).unwrap(), b"{ not json");
        assert!(recovery.hint().contains("preserved"));
        assert!(!path.exists());
    }

    #[test]
    fn insert_new_rejects_duplicates_and_remove_deletes() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("a.conf");
        fs::write(&file, b"alpha").unwrap();
        let store = BaselineStore::new(dir.path().join("baseline.json"));
        store.insert_new(entry_for(&file)).unwrap();
        assert!(store.insert_new(entry_for(&file)).is_err());
        let removed = store.remove(&file).unwrap();
        assert!(removed.is_some());
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn failed_update_leaves_store_untouched() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("a.conf");
        fs::write(&file, b"alpha").unwrap();
        let store = BaselineStore::new(dir.path().join("baseline.json"));
        store.upsert(entry_for(&file)).unwrap();
        let before = fs::read(store.path()).unwrap();
        let res: Result<()> = store.update(|map| {
            map.clear();
            Err(VigiloError::InvalidEntry("abort".into()))
        });
        assert!(res.is_err());
        assert_eq!(fs::read(store.path()).unwrap(), before);
    }

    #[test]
    fn concurrent_upserts_are_not_lost() {
        let dir = tempdir().unwrap();
        let store = BaselineStore::new(dir.path().join("baseline.json"))
            .with_lock_policy(Duration::from_secs(10), Duration::from_millis(1));
        let mut handles = Vec::new();
        for i in 0..8 {
            let file = dir.path().join(format!("f{i}"));
            fs::write(&file, format!("{i}")).unwrap();
            let store = store.clone();
            handles.push(std::thread::spawn(move || {
                store.upsert(entry_for(&file)).unwrap();
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(store.load().unwrap().len(), 8);
    }

    #[cfg(unix)]
    #[test]
    fn saved_store_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempdir().unwrap();
        let file = dir.path().join("a.conf");
        fs::write(&file, b"alpha").unwrap();
        let store = BaselineStore::new(dir.path().join("baseline.json"));
        store.upsert(entry_for(&file)).unwrap();
        let mode = fs::metadata(store.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
