//! OS file-change notifications as a stream of [`RawEvent`]s.
//!
//! `notify` delivers events on its own thread; a bridge thread converts them
//! and forwards them into a bounded tokio channel. The receiver is the raw
//! event source of the monitoring loop. When the bridge stops (watcher
//! dropped or backend failure) the channel closes, which the loop treats as
//! loss of the event source.

use anyhow::Result;
use chrono::{DateTime, Utc};
use notify::event::{ModifyKind, RenameMode};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use tokio::sync::mpsc as async_mpsc;
use tracing::{debug, error, info, warn};
use vigilo_core::baseline::BaselineMap;
use vigilo_core::snapshot::EntryKind;

const RAW_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RawOperation {
    Write,
    Unlink,
    Rename,
    Chmod,
    Create,
}

/// One notification from the OS. Several may arrive for one logical edit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawEvent {
    pub source_path: PathBuf,
    pub operation: RawOperation,
    /// Rename target, when the backend reports both halves.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<PathBuf>,
    pub timestamp: DateTime<Utc>,
}

impl RawEvent {
    pub fn new(source_path: impl Into<PathBuf>, operation: RawOperation) -> Self {
        Self {
            source_path: source_path.into(),
            operation,
            destination: None,
            timestamp: Utc::now(),
        }
    }

    pub fn renamed(from: impl Into<PathBuf>, to: impl Into<PathBuf>) -> Self {
        Self {
            source_path: from.into(),
            operation: RawOperation::Rename,
            destination: Some(to.into()),
            timestamp: Utc::now(),
        }
    }

    /// Every path this event may have changed, with the operation as seen
    /// from that path. A rename target is a creation at the destination.
    pub fn touched(&self) -> Vec<(PathBuf, RawOperation)> {
        let mut out = vec![(self.source_path.clone(), self.operation)];
        if let Some(dest) = &self.destination {
            out.push((dest.clone(), RawOperation::Create));
        }
        out
    }
}

/// Keeps OS-level watches in line with the baseline.
pub trait WatchRegistry: Send {
    fn sync(&mut self, baseline: &BaselineMap) -> Result<()>;
}

/// Registry for callers that feed raw events themselves.
#[derive(Debug, Default)]
pub struct NoopRegistry;

impl WatchRegistry for NoopRegistry {
    fn sync(&mut self, _baseline: &BaselineMap) -> Result<()> {
        Ok(())
    }
}

/// Directories that must be watched for `baseline`: the parent of every
/// entry (so deletion, recreation and renames are seen) and every
/// directory entry itself (for its children).
pub fn watch_targets(baseline: &BaselineMap) -> BTreeSet<PathBuf> {
    let mut targets = BTreeSet::new();
    for entry in baseline.values() {
        if let Some(parent) = entry.path.parent() {
            targets.insert(parent.to_path_buf());
        }
        if entry.kind == EntryKind::Directory {
            targets.insert(entry.path.clone());
        }
    }
    targets
}

pub struct FsWatcher {
    watcher: RecommendedWatcher,
    watched: BTreeSet<PathBuf>,
}

impl FsWatcher {
    pub fn new() -> Result<(Self, async_mpsc::Receiver<RawEvent>)> {
        let (raw_tx, raw_rx) = async_mpsc::channel(RAW_CHANNEL_CAPACITY);
        let (sync_tx, sync_rx) = mpsc::channel::<notify::Result<Event>>();

        let watcher = RecommendedWatcher::new(
            move |res| {
                let _ = sync_tx.send(res);
            },
            Config::default(),
        )?;

        std::thread::Builder::new()
            .name("vigilo-watch-bridge".into())
            .spawn(move || loop {
                match sync_rx.recv() {
                    Ok(Ok(event)) => {
                        for raw in convert_event(&event) {
                            if raw_tx.blocking_send(raw).is_err() {
                                debug!("raw event receiver dropped, stopping bridge");
                                return;
                            }
                        }
                    }
                    Ok(Err(e)) => error!("file watcher error: {}", e),
                    Err(_) => {
                        debug!("watcher channel closed");
                        return;
                    }
                }
            })?;

        Ok((
            Self {
                watcher,
                watched: BTreeSet::new(),
            },
            raw_rx,
        ))
    }

    fn watch(&mut self, path: &Path) -> bool {
        if !path.exists() {
            warn!("path does not exist, cannot watch: {}", path.display());
            return false;
        }
        match self.watcher.watch(path, RecursiveMode::NonRecursive) {
            Ok(()) => {
                info!("watching: {}", path.display());
                true
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to watch");
                false
            }
        }
    }
}

impl WatchRegistry for FsWatcher {
    fn sync(&mut self, baseline: &BaselineMap) -> Result<()> {
        let targets = watch_targets(baseline);
        let stale: Vec<PathBuf> = self.watched.difference(&targets).cloned().collect();
        for path in stale {
            if let Err(e) = self.watcher.unwatch(&path) {
                debug!(path = %path.display(), error = %e, "unwatch failed");
            }
            self.watched.remove(&path);
        }
        let fresh: Vec<PathBuf> = targets.difference(&self.watched).cloned().collect();
        for path in fresh {
            // Retried on the next sync if the directory appears later.
            if self.watch(&path) {
                self.watched.insert(path);
            }
        }
        Ok(())
    }
}

fn convert_event(event: &Event) -> Vec<RawEvent> {
    let all = |op: RawOperation| -> Vec<RawEvent> {
        event.paths.iter().map(|p| RawEvent::new(p, op)).collect()
    };
    match &event.kind {
        EventKind::Create(_) => all(RawOperation::Create),
        EventKind::Remove(_) => all(RawOperation::Unlink),
        EventKind::Modify(ModifyKind::Name(mode)) => match mode {
            RenameMode::Both if event.paths.len() >= 2 => {
                vec![RawEvent::renamed(&event.paths[0], &event.paths[1])]
            }
            RenameMode::To => all(RawOperation::Create),
            _ => all(RawOperation::Rename),
        },
        EventKind::Modify(ModifyKind::Metadata(_)) => all(RawOperation::Chmod),
        EventKind::Modify(_) => all(RawOperation::Write),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, MetadataKind};
    use std::collections::BTreeSet as Set;
    use vigilo_core::baseline::{AlertMode, BaselineEntry, WatchEvent};
    use vigilo_core::snapshot::snapshot;

    #[test]
    fn rename_pair_becomes_one_event_with_destination() {
        let event = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Both)))
            .add_path(PathBuf::from("/w/a.conf"))
            .add_path(PathBuf::from("/w/b.conf"));
        let raw = convert_event(&event);
        assert_eq!(raw.len(), 1);
        assert_eq!(raw[0].operation, RawOperation::Rename);
        assert_eq!(raw[0].destination, Some(PathBuf::from("/w/b.conf")));
        assert_eq!(
            raw[0].touched(),
            vec![
                (PathBuf::from("/w/a.conf"), RawOperation::Rename),
                (PathBuf::from("/w/b.conf"), RawOperation::Create)
            ]
        );
    }

    #[test]
    fn metadata_and_create_kinds_map() {
        let chmod = Event::new(EventKind::Modify(ModifyKind::Metadata(MetadataKind::Permissions)))
            .add_path(PathBuf::from("/w/a"));
        assert_eq!(convert_event(&chmod)[0].operation, RawOperation::Chmod);
        let create =
            Event::new(EventKind::Create(CreateKind::File)).add_path(PathBuf::from("/w/n"));
        assert_eq!(convert_event(&create)[0].operation, RawOperation::Create);
        assert!(convert_event(&Event::new(EventKind::Any)).is_empty());
    }

    #[test]
    fn targets_cover_parents_and_directories() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.conf");
        std::fs::write(&file, b"x").unwrap();
        let sub = dir.path().join("drop");
        std::fs::create_dir(&sub).unwrap();

        let mut map = BaselineMap::new();
        let events: Set<WatchEvent> = [WatchEvent::Modify].into_iter().collect();
        for p in [&file, &sub] {
            let entry =
                BaselineEntry::new(p.clone(), snapshot(p).unwrap(), events.clone(), AlertMode::Log)
                    .unwrap();
            map.insert(p.clone(), entry);
        }
        let targets = watch_targets(&map);
        assert!(targets.contains(dir.path()));
        assert!(targets.contains(&sub));
        assert_eq!(targets.len(), 2);
    }
}
