//! Event classification.
//!
//! Raw notifications are resolved onto a monitored path, coalesced per path
//! over a debounce window, and then judged by comparing a fresh snapshot
//! against the entry's `last_seen_state`. The change kind comes from the
//! snapshot diff; the raw operation only matters for recognising moves and
//! new children of a monitored directory.

use crate::integrity::watcher::{RawEvent, RawOperation};
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};
use vigilo_core::baseline::{BaselineEntry, BaselineMap, WatchEvent};
use vigilo_core::error::{Result, VigiloError};
use vigilo_core::report::{ChangeKind, ChangeRecord};
use vigilo_core::snapshot::{self, diff, EntryKind, Snapshot, SnapshotDiff, SnapshotField};

/// A raw path mapped onto the baseline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    /// Baseline entry the change is accounted to.
    pub entry_path: PathBuf,
    /// Path to evaluate: the entry itself or a new child of it.
    pub path: PathBuf,
}

impl Resolved {
    pub fn is_child(&self) -> bool {
        self.entry_path != self.path
    }
}

/// Map `path` to the entry it belongs to: an exact match, or a monitored
/// directory with `childAdded` active when `path` is a newly created child.
pub fn resolve(baseline: &BaselineMap, path: &Path, operation: RawOperation) -> Option<Resolved> {
    if baseline.contains_key(path) {
        return Some(Resolved {
            entry_path: path.to_path_buf(),
            path: path.to_path_buf(),
        });
    }
    if operation != RawOperation::Create {
        return None;
    }
    let parent = path.parent()?;
    let dir = baseline.get(parent)?;
    if dir.kind == EntryKind::Directory && dir.watches(WatchEvent::ChildAdded) {
        return Some(Resolved {
            entry_path: parent.to_path_buf(),
            path: path.to_path_buf(),
        });
    }
    None
}

// ── Coalescing ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Pending {
    pub target: Resolved,
    pub event: RawEvent,
    first_seen: Instant,
    last_seen: Instant,
}

/// Per-path debounce. Every event for a path restarts its window; the
/// latest event wins, except that a known rename destination is kept so a
/// trailing notification cannot hide a move.
#[derive(Debug)]
pub struct Coalescer {
    window: Duration,
    max_hold: Duration,
    pending: HashMap<PathBuf, Pending>,
}

impl Coalescer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            max_hold: window * 10,
            pending: HashMap::new(),
        }
    }

    pub fn push(&mut self, target: Resolved, event: RawEvent, now: Instant) {
        match self.pending.get_mut(&target.path) {
            Some(existing) => {
                let destination = event
                    .destination
                    .clone()
                    .or_else(|| existing.event.destination.take());
                existing.event = RawEvent {
                    destination,
                    ..event
                };
                existing.last_seen = now;
                trace!(path = %target.path.display(), "coalesced raw event");
            }
            None => {
                self.pending.insert(
                    target.path.clone(),
                    Pending {
                        target,
                        event,
                        first_seen: now,
                        last_seen: now,
                    },
                );
            }
        }
    }

    /// Take up to `limit` paths whose window has elapsed and whose entry is
    /// not in `busy`.
    pub fn drain_ready(
        &mut self,
        now: Instant,
        busy: &HashSet<PathBuf>,
        limit: usize,
    ) -> Vec<Pending> {
        let (window, max_hold) = (self.window, self.max_hold);
        self.take(busy, limit, |p| {
            now.duration_since(p.last_seen) >= window
                || now.duration_since(p.first_seen) >= max_hold
        })
    }

    /// Like [`drain_ready`](Self::drain_ready) but ignores the window. Used
    /// when shutting down.
    pub fn drain_now(&mut self, busy: &HashSet<PathBuf>, limit: usize) -> Vec<Pending> {
        self.take(busy, limit, |_| true)
    }

    fn take(
        &mut self,
        busy: &HashSet<PathBuf>,
        limit: usize,
        ready: impl Fn(&Pending) -> bool,
    ) -> Vec<Pending> {
        let mut keys: Vec<(Instant, PathBuf)> = self
            .pending
            .iter()
            .filter(|(_, p)| !busy.contains(&p.target.entry_path) && ready(p))
            .map(|(k, p)| (p.first_seen, k.clone()))
            .collect();
        keys.sort();

        let mut out = Vec::new();
        let mut claimed: HashSet<PathBuf> = HashSet::new();
        for (_, key) in keys {
            if out.len() >= limit {
                break;
            }
            // Two children of one directory share an entry; one at a time.
            let entry_path = &self.pending[&key].target.entry_path;
            if !claimed.insert(entry_path.clone()) {
                continue;
            }
            if let Some(p) = self.pending.remove(&key) {
                out.push(p);
            }
        }
        out
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

// ── Classification ──────────────────────────────────────────────────────────

/// A genuine semantic change, plus what the entry should look like after it
/// has been processed.
#[derive(Debug, Clone)]
pub struct Classified {
    pub record: ChangeRecord,
    /// False when the entry does not watch this kind: the state is still
    /// rolled forward but nothing is dispatched or recorded.
    pub watched: bool,
    pub next_state: Snapshot,
    pub missing: bool,
}

/// Snapshot `path`. `None` when it does not exist. Unreadable content falls
/// back to a metadata-only capture so permission changes stay visible.
pub fn observe(path: &Path) -> Result<Option<Snapshot>> {
    match snapshot::snapshot(path) {
        Ok(s) => Ok(Some(s)),
        Err(VigiloError::PathMissing(_)) => Ok(None),
        Err(VigiloError::PathUnreadable { reason, .. }) => {
            warn!(path = %path.display(), reason = %reason, "content unreadable, comparing metadata only");
            match snapshot::metadata_snapshot(path) {
                Ok(s) => Ok(Some(s)),
                Err(VigiloError::PathMissing(_)) => Ok(None),
                Err(e) => Err(e),
            }
        }
        Err(e) => Err(e),
    }
}

/// Evaluate one coalesced event against `entry`. `None` means nothing
/// changed (or the path could not be observed at all).
pub fn evaluate(entry: &BaselineEntry, target: &Resolved, event: &RawEvent) -> Option<Classified> {
    let current = match observe(&target.path) {
        Ok(c) => c,
        Err(e) => {
            warn!(path = %target.path.display(), error = %e, "cannot observe path");
            return None;
        }
    };
    if target.is_child() {
        return classify_child(entry, &target.path, current);
    }
    classify_entry(entry, current, event)
}

fn classify_child(
    entry: &BaselineEntry,
    child: &Path,
    current: Option<Snapshot>,
) -> Option<Classified> {
    // Created and gone again before the window closed.
    let current = current?;
    let next_state = match observe(&entry.path) {
        Ok(Some(dir)) => rolling_state(&entry.last_seen_state, &dir),
        _ => entry.last_seen_state.clone(),
    };
    let record = ChangeRecord {
        path: child.to_path_buf(),
        entry_path: entry.path.clone(),
        event_type: ChangeKind::Add,
        previous_snapshot: None,
        diff: diff(None, Some(&current)),
        current_snapshot: Some(current),
        destination: None,
        detected_at: Utc::now(),
    };
    Some(Classified {
        watched: entry.watches(WatchEvent::ChildAdded),
        record,
        next_state,
        missing: entry.is_missing(),
    })
}

fn classify_entry(
    entry: &BaselineEntry,
    current: Option<Snapshot>,
    event: &RawEvent,
) -> Option<Classified> {
    let previous = &entry.last_seen_state;
    let build = |kind: ChangeKind,
                 changes: SnapshotDiff,
                 current: Option<Snapshot>,
                 destination: Option<PathBuf>| ChangeRecord {
        path: entry.path.clone(),
        entry_path: entry.path.clone(),
        event_type: kind,
        previous_snapshot: if entry.is_missing() {
            None
        } else {
            Some(previous.clone())
        },
        current_snapshot: current,
        diff: changes,
        destination,
        detected_at: Utc::now(),
    };

    match current {
        None => {
            if entry.is_missing() {
                trace!(path = %entry.path.display(), "already missing");
                return None;
            }
            let changes = diff(Some(previous), None);
            let (kind, dest) = match moved_to(previous, event) {
                Some((dest, snap)) => (ChangeKind::Move, Some((dest, snap))),
                None => (ChangeKind::Delete, None),
            };
            let (destination, dest_snapshot) = match dest {
                Some((d, s)) => (Some(d), Some(s)),
                None => (None, None),
            };
            Some(Classified {
                watched: entry.watches(kind.watch_event()),
                record: build(kind, changes, dest_snapshot, destination),
                // last known-good state is kept for judging a recreation
                next_state: previous.clone(),
                missing: true,
            })
        }
        Some(current) => {
            let changes = semantic_diff(entry.kind, previous, &current);
            let kind = if changes.content_changed() {
                ChangeKind::Modify
            } else if changes.access_changed() {
                ChangeKind::PermissionChange
            } else if entry.is_missing() {
                ChangeKind::Add
            } else {
                if !current.readable {
                    debug!(path = %entry.path.display(), "metadata unchanged, content not comparable");
                }
                return None;
            };
            let changes = if kind == ChangeKind::Add {
                diff(None, Some(&current))
            } else {
                changes
            };
            Some(Classified {
                watched: entry.watches(kind.watch_event()),
                next_state: rolling_state(previous, &current),
                record: build(kind, changes, Some(current), None),
                missing: false,
            })
        }
    }
}

/// Compare snapshots the way an entry of `kind` is judged. A directory's
/// child count belongs to `childAdded`, not to the directory itself.
fn semantic_diff(kind: EntryKind, previous: &Snapshot, current: &Snapshot) -> SnapshotDiff {
    let mut changes = diff(Some(previous), Some(current));
    if kind == EntryKind::Directory {
        changes.changes.retain(|c| c.field != SnapshotField::Size);
    }
    changes
}

/// The source is gone; did it land at the rename destination?
fn moved_to(previous: &Snapshot, event: &RawEvent) -> Option<(PathBuf, Snapshot)> {
    let dest = event.destination.as_ref()?;
    let snap = observe(dest).ok()??;
    let same_inode = previous.inode != 0 && snap.inode == previous.inode;
    let same_content = previous.content_hash.is_some() && previous.content_hash == snap.content_hash;
    (same_inode || same_content).then(|| (dest.clone(), snap))
}

/// Next rolling reference. A metadata-only capture keeps the last known
/// content so the next readable snapshot is still compared against it.
pub fn rolling_state(previous: &Snapshot, current: &Snapshot) -> Snapshot {
    // Content of a different kind of object says nothing about this one.
    if current.readable || current.kind != previous.kind {
        return current.clone();
    }
    Snapshot {
        content_hash: previous.content_hash.clone(),
        size: previous.size,
        readable: previous.readable,
        ..current.clone()
    }
}
