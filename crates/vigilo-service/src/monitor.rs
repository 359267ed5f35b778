//! The monitoring loop.
//!
//! One task owns the in-memory baseline, consumes raw events, coalesces
//! them and hands ready paths to a bounded pool of workers. A worker
//! classifies, dispatches, appends history and persists the new rolling
//! state, in that order. At most one worker runs per baseline entry. The
//! durable map returned by each persist (which also carries any
//! administrative edits) replaces the in-memory one.

use crate::alert::Dispatcher;
use crate::integrity::classifier::{self, Classified, Coalescer, Resolved};
use crate::integrity::watcher::{RawEvent, RawOperation, WatchRegistry};
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, trace, warn};
use vigilo_core::audit_log::{AuditLog, AuditSeverity};
use vigilo_core::baseline::{BaselineEntry, BaselineMap};
use vigilo_core::error::VigiloError;
use vigilo_core::history::HistoryLog;
use vigilo_core::report::ChangeKind;
use vigilo_core::settings::MonitorSettings;
use vigilo_core::store::BaselineStore;

const PERSIST_RETRY_DELAYS_MS: [u64; 3] = [100, 500, 2000];

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("raw event source closed; monitoring cannot continue")]
    EventSourceLost,

    #[error("could not persist baseline for {path} after {attempts} attempts: {source}")]
    PersistFailed {
        path: PathBuf,
        attempts: u32,
        #[source]
        source: VigiloError,
    },

    #[error("worker task failed: {0}")]
    Worker(String),

    #[error(transparent)]
    Store(#[from] VigiloError),
}

/// Lifecycle of one monitored path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PathState {
    Baselined,
    Watching,
    Evaluating,
    Alerted,
    Suppressed,
    Removed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorState {
    Starting,
    Running,
    Draining,
    Stopped,
}

#[derive(Debug)]
struct StatusBoard {
    state: MonitorState,
    paths: BTreeMap<PathBuf, PathState>,
    alerted: u64,
    suppressed: u64,
}

impl StatusBoard {
    fn set_path(&mut self, path: &Path, state: PathState) {
        let prev = self.paths.insert(path.to_path_buf(), state);
        trace!(path = %path.display(), from = ?prev, to = ?state, "path state");
    }
}

/// Control and inspection handle for a running [`Monitor`].
#[derive(Clone)]
pub struct MonitorHandle {
    shutdown: Arc<watch::Sender<bool>>,
    board: Arc<Mutex<StatusBoard>>,
}

impl MonitorHandle {
    /// Stop accepting raw events, finish in-flight work, then exit.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    pub fn state(&self) -> MonitorState {
        self.board.lock().state
    }

    pub fn path_state(&self, path: &Path) -> Option<PathState> {
        self.board.lock().paths.get(path).copied()
    }

    /// Changes dispatched as alerts so far.
    pub fn alerts_raised(&self) -> u64 {
        self.board.lock().alerted
    }

    /// Changes that were classified but not watched.
    pub fn changes_suppressed(&self) -> u64 {
        self.board.lock().suppressed
    }
}

struct Shared {
    settings: MonitorSettings,
    store: BaselineStore,
    history: HistoryLog,
    dispatcher: Dispatcher,
    audit: Option<Arc<AuditLog>>,
    board: Arc<Mutex<StatusBoard>>,
}

impl Shared {
    fn audit(&self, event_type: &str, severity: AuditSeverity, data: serde_json::Value) {
        if let Some(audit) = &self.audit {
            if let Err(e) = audit.append(event_type, severity, data) {
                warn!(event_type, error = %e, "audit log append failed");
            }
        }
    }
}

struct WorkerResult {
    entry_path: PathBuf,
    outcome: Result<Processed, MonitorError>,
}

struct Processed {
    /// Durable mapping after the persist, `None` when nothing changed.
    baseline: Option<BaselineMap>,
}

pub struct Monitor {
    shared: Arc<Shared>,
    baseline: BaselineMap,
    shutdown_rx: watch::Receiver<bool>,
}

impl Monitor {
    pub fn new(
        settings: MonitorSettings,
        store: BaselineStore,
        history: HistoryLog,
        dispatcher: Dispatcher,
        audit: Option<Arc<AuditLog>>,
    ) -> (Self, MonitorHandle) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let board = Arc::new(Mutex::new(StatusBoard {
            state: MonitorState::Starting,
            paths: BTreeMap::new(),
            alerted: 0,
            suppressed: 0,
        }));
        let shared = Arc::new(Shared {
            settings,
            store,
            history,
            dispatcher,
            audit,
            board: board.clone(),
        });
        (
            Self {
                shared,
                baseline: BaselineMap::new(),
                shutdown_rx,
            },
            MonitorHandle {
                shutdown: Arc::new(shutdown_tx),
                board,
            },
        )
    }

    /// Run until shutdown or a fatal condition. Returns an error only for
    /// loss of the event source, exhausted persist retries, or a store that
    /// cannot be opened at all.
    pub async fn run<R: WatchRegistry>(
        mut self,
        mut raw: mpsc::Receiver<RawEvent>,
        mut registry: R,
    ) -> Result<(), MonitorError> {
        let settings = self.shared.settings.clone();
        let (initial, recovery) = self.shared.store.load_or_recover()?;
        if let Some(recovery) = recovery {
            self.shared.audit(
                "STORE_RECOVERED",
                AuditSeverity::Warn,
                serde_json::json!({
                    "reason": recovery.reason,
                    "preserved_at": recovery.preserved_at,
                }),
            );
        }
        self.install(initial, &mut registry);
        self.shared.audit(
            "SERVICE_STARTED",
            AuditSeverity::Info,
            serde_json::json!({ "entries": self.baseline.len() }),
        );
        info!(entries = self.baseline.len(), "monitoring started");
        self.shared.board.lock().state = MonitorState::Running;

        let mut coalescer = Coalescer::new(settings.debounce());
        // Re-evaluate everything once so changes made while stopped, or a
        // persist lost to a crash, are not missed.
        let now = Instant::now();
        for path in self.baseline.keys() {
            let target = Resolved {
                entry_path: path.clone(),
                path: path.clone(),
            };
            coalescer.push(target, RawEvent::new(path, RawOperation::Write), now);
        }

        let mut in_flight: HashSet<PathBuf> = HashSet::new();
        let mut workers: JoinSet<WorkerResult> = JoinSet::new();
        let mut tick = tokio::time::interval(settings.tick());
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut reload = tokio::time::interval(settings.reload_interval());
        reload.set_missed_tick_behavior(MissedTickBehavior::Delay);
        reload.tick().await;

        let mut fatal: Option<MonitorError> = None;
        loop {
            tokio::select! {
                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        info!("shutdown requested");
                        break;
                    }
                }
                received = raw.recv() => match received {
                    Some(event) => self.accept(&mut coalescer, event),
                    None => {
                        error!("raw event source closed");
                        fatal = Some(MonitorError::EventSourceLost);
                        break;
                    }
                },
                Some(joined) = workers.join_next(), if !workers.is_empty() => {
                    if let Err(e) = self.finish(joined, &mut in_flight, &mut registry) {
                        error!(error = %e, "fatal monitoring error");
                        fatal = Some(e);
                        break;
                    }
                }
                _ = tick.tick() => {}
                _ = reload.tick() => self.reload(&mut registry),
            }
            self.spawn_ready(&mut coalescer, &mut in_flight, &mut workers, false);
        }

        self.shared.board.lock().state = MonitorState::Draining;
        // No new events; whatever was already delivered is still taken.
        raw.close();
        while let Ok(event) = raw.try_recv() {
            self.accept(&mut coalescer, event);
        }
        // Accepted events are still evaluated; a fatal error stops new work
        // but never interrupts a persist that has started.
        loop {
            if fatal.is_none() {
                self.spawn_ready(&mut coalescer, &mut in_flight, &mut workers, true);
            }
            match workers.join_next().await {
                Some(joined) => {
                    if let Err(e) = self.finish(joined, &mut in_flight, &mut registry) {
                        error!(error = %e, "fatal monitoring error while draining");
                        fatal.get_or_insert(e);
                    }
                }
                None => break,
            }
        }
        if !coalescer.is_empty() {
            warn!(pending = coalescer.len(), "dropping unevaluated events");
        }

        self.shared.audit(
            "SERVICE_STOPPED",
            if fatal.is_some() {
                AuditSeverity::Critical
            } else {
                AuditSeverity::Info
            },
            serde_json::json!({ "reason": fatal.as_ref().map(|e| e.to_string()) }),
        );
        self.shared.board.lock().state = MonitorState::Stopped;
        info!("monitoring stopped");
        match fatal {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn accept(&self, coalescer: &mut Coalescer, event: RawEvent) {
        let now = Instant::now();
        for (path, operation) in event.touched() {
            let Some(target) = classifier::resolve(&self.baseline, &path, operation) else {
                trace!(path = %path.display(), "event outside monitored set");
                continue;
            };
            let raw = if path == event.source_path {
                event.clone()
            } else {
                RawEvent {
                    source_path: path,
                    operation,
                    destination: None,
                    timestamp: event.timestamp,
                }
            };
            coalescer.push(target, raw, now);
        }
    }

    fn spawn_ready(
        &self,
        coalescer: &mut Coalescer,
        in_flight: &mut HashSet<PathBuf>,
        workers: &mut JoinSet<WorkerResult>,
        force: bool,
    ) {
        let capacity = self
            .shared
            .settings
            .workers
            .pool_size
            .saturating_sub(workers.len());
        if capacity == 0 || coalescer.is_empty() {
            return;
        }
        let batch = if force {
            coalescer.drain_now(in_flight, capacity)
        } else {
            coalescer.drain_ready(Instant::now(), in_flight, capacity)
        };
        for pending in batch {
            let Some(entry) = self.baseline.get(&pending.target.entry_path).cloned() else {
                debug!(path = %pending.target.entry_path.display(), "entry removed before evaluation");
                continue;
            };
            in_flight.insert(entry.path.clone());
            self.shared
                .board
                .lock()
                .set_path(&entry.path, PathState::Evaluating);
            let shared = self.shared.clone();
            workers.spawn(async move {
                let entry_path = entry.path.clone();
                let outcome = process(shared, entry, pending.target, pending.event).await;
                WorkerResult {
                    entry_path,
                    outcome,
                }
            });
        }
    }

    fn finish<R: WatchRegistry>(
        &mut self,
        joined: Result<WorkerResult, JoinError>,
        in_flight: &mut HashSet<PathBuf>,
        registry: &mut R,
    ) -> Result<(), MonitorError> {
        let result = joined.map_err(|e| MonitorError::Worker(e.to_string()))?;
        in_flight.remove(&result.entry_path);
        let processed = result.outcome?;
        if self.baseline.contains_key(&result.entry_path) {
            self.shared
                .board
                .lock()
                .set_path(&result.entry_path, PathState::Watching);
        }
        if let Some(map) = processed.baseline {
            self.install(map, registry);
        }
        Ok(())
    }

    /// Pick up administrative edits from the durable store.
    fn reload<R: WatchRegistry>(&mut self, registry: &mut R) {
        match self.shared.store.load() {
            Ok(map) => {
                if map != self.baseline {
                    self.shared.audit(
                        "BASELINE_RELOADED",
                        AuditSeverity::Info,
                        serde_json::json!({ "entries": map.len() }),
                    );
                    self.install(map, registry);
                }
            }
            Err(VigiloError::StoreCorrupt { reason, .. }) => {
                // Keep monitoring with the last good mapping and put it back
                // on disk; the corrupt document is preserved for inspection.
                warn!(reason = %reason, "baseline store became unreadable");
                let recovered = self
                    .shared
                    .store
                    .load_or_recover()
                    .and_then(|(_, recovery)| {
                        self.shared.store.save(&self.baseline)?;
                        Ok(recovery)
                    });
                match recovered {
                    Ok(recovery) => self.shared.audit(
                        "STORE_RECOVERED",
                        AuditSeverity::Warn,
                        serde_json::json!({
                            "reason": reason,
                            "preserved_at": recovery.and_then(|r| r.preserved_at),
                            "restored_entries": self.baseline.len(),
                        }),
                    ),
                    Err(e) => error!(error = %e, "could not restore baseline store"),
                }
            }
            Err(e) => warn!(error = %e, "baseline reload failed"),
        }
    }

    /// Replace the in-memory mapping, auditing configuration differences and
    /// keeping OS watches in line.
    fn install<R: WatchRegistry>(&mut self, map: BaselineMap, registry: &mut R) {
        let watches_changed = !map
            .iter()
            .map(|(path, entry)| (path, entry.kind))
            .eq(self.baseline.iter().map(|(path, entry)| (path, entry.kind)));
        {
            let mut board = self.shared.board.lock();
            for (path, entry) in &map {
                match self.baseline.get(path) {
                    None => {
                        board.set_path(path, PathState::Baselined);
                        board.set_path(path, PathState::Watching);
                        self.shared.audit(
                            "ENTRY_ADDED",
                            AuditSeverity::Info,
                            serde_json::json!({
                                "path": path,
                                "events": entry.watched_events,
                                "alert_mode": entry.alert_mode,
                            }),
                        );
                    }
                    Some(old)
                        if old.watched_events != entry.watched_events
                            || old.alert_mode != entry.alert_mode =>
                    {
                        self.shared.audit(
                            "ENTRY_UPDATED",
                            AuditSeverity::Info,
                            serde_json::json!({
                                "path": path,
                                "events": entry.watched_events,
                                "alert_mode": entry.alert_mode,
                            }),
                        );
                    }
                    Some(_) => {}
                }
            }
            for path in self.baseline.keys().filter(|p| !map.contains_key(*p)) {
                board.set_path(path, PathState::Removed);
                self.shared.audit(
                    "ENTRY_REMOVED",
                    AuditSeverity::Info,
                    serde_json::json!({ "path": path }),
                );
            }
        }
        self.baseline = map;
        if watches_changed {
            if let Err(e) = registry.sync(&self.baseline) {
                warn!(error = %e, "failed to update file watches");
            }
        }
    }
}

async fn process(
    shared: Arc<Shared>,
    entry: BaselineEntry,
    target: Resolved,
    event: RawEvent,
) -> Result<Processed, MonitorError> {
    let subject = entry.clone();
    let classified = match tokio::task::spawn_blocking(move || {
        classifier::evaluate(&subject, &target, &event)
    })
    .await
    {
        Ok(c) => c,
        Err(e) => {
            error!(path = %entry.path.display(), error = %e, "classification task failed");
            None
        }
    };
    let Some(classified) = classified else {
        trace!(path = %entry.path.display(), "no semantic change");
        return Ok(Processed { baseline: None });
    };

    let record = &classified.record;
    if classified.watched {
        info!(path = %record.path.display(), event = %record.event_type, "change detected");
        let report = shared.dispatcher.dispatch(record, entry.alert_mode).await;
        if let Err(e) = shared.history.append(
            &report,
            report.delivered_channel(),
            report.delivery_succeeded(),
        ) {
            error!(path = %record.path.display(), error = %e, "failed to record alert history");
        }
        let mut board = shared.board.lock();
        board.alerted += 1;
        board.set_path(&entry.path, PathState::Alerted);
    } else {
        debug!(path = %record.path.display(), event = %record.event_type, "change not watched, suppressed");
        let mut board = shared.board.lock();
        board.suppressed += 1;
        board.set_path(&entry.path, PathState::Suppressed);
    }

    let map = persist(&shared, &entry, &classified).await?;
    Ok(Processed {
        baseline: Some(map),
    })
}

/// Roll the entry forward in the durable store, retrying lock and write
/// failures a bounded number of times.
async fn persist(
    shared: &Shared,
    entry: &BaselineEntry,
    classified: &Classified,
) -> Result<BaselineMap, MonitorError> {
    let follow = followed_entry(&shared.settings, entry, classified);
    let attempts = shared.settings.store.persist_attempts;
    let mut last_error = None;
    for attempt in 1..=attempts {
        let store = shared.store.clone();
        let path = entry.path.clone();
        let next_state = classified.next_state.clone();
        let missing = classified.missing;
        let follow = follow.clone();
        let result = tokio::task::spawn_blocking(move || {
            store.update(|map| {
                apply_change(map, &path, next_state, missing, follow);
                Ok(map.clone())
            })
        })
        .await;
        match result {
            Ok(Ok(map)) => return Ok(map),
            Ok(Err(e)) => {
                warn!(path = %entry.path.display(), attempt, error = %e, "baseline persist failed");
                last_error = Some(e);
            }
            Err(e) => {
                warn!(path = %entry.path.display(), attempt, error = %e, "baseline persist task failed");
                last_error = Some(VigiloError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    e.to_string(),
                )));
            }
        }
        if attempt < attempts {
            let idx = (attempt as usize - 1).min(PERSIST_RETRY_DELAYS_MS.len() - 1);
            tokio::time::sleep(Duration::from_millis(PERSIST_RETRY_DELAYS_MS[idx])).await;
        }
    }
    Err(MonitorError::PersistFailed {
        path: entry.path.clone(),
        attempts,
        source: last_error.unwrap_or_else(|| VigiloError::LockTimeout {
            path: shared.store.path().to_path_buf(),
            waited_ms: 0,
        }),
    })
}

/// With `follow_moves`, a move adds the destination under the same
/// configuration. The source entry stays (missing) either way.
fn followed_entry(
    settings: &MonitorSettings,
    entry: &BaselineEntry,
    classified: &Classified,
) -> Option<BaselineEntry> {
    let record = &classified.record;
    if !settings.moves.follow_moves || record.event_type != ChangeKind::Move {
        return None;
    }
    let destination = record.destination.clone()?;
    let snapshot = record.current_snapshot.clone()?;
    match BaselineEntry::new(
        destination,
        snapshot,
        entry.watched_events.clone(),
        entry.alert_mode,
    ) {
        Ok(e) => Some(e),
        Err(e) => {
            warn!(error = %e, "cannot follow move");
            None
        }
    }
}

fn apply_change(
    map: &mut BaselineMap,
    path: &Path,
    next_state: vigilo_core::snapshot::Snapshot,
    missing: bool,
    follow: Option<BaselineEntry>,
) {
    match map.get_mut(path) {
        Some(entry) => {
            if entry.kind != next_state.kind {
                debug!(path = %path.display(), from = ?entry.kind, to = ?next_state.kind, "entry changed kind");
                entry.kind = next_state.kind;
            }
            entry.last_seen_state = next_state;
            entry.missing_since = if missing {
                entry.missing_since.or_else(|| Some(Utc::now()))
            } else {
                None
            };
        }
        None => debug!(path = %path.display(), "entry removed while evaluating, state not kept"),
    }
    if let Some(new_entry) = follow {
        map.entry(new_entry.path.clone()).or_insert(new_entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use vigilo_core::baseline::{AlertMode, WatchEvent};
    use vigilo_core::snapshot::{snapshot, EntryKind};

    #[test]
    fn apply_change_sets_and_clears_missing() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.conf");
        std::fs::write(&file, b"x").unwrap();
        let snap = snapshot(&file).unwrap();
        let events: BTreeSet<WatchEvent> = [WatchEvent::Delete].into_iter().collect();
        let mut map = BaselineMap::new();
        map.insert(
            file.clone(),
            BaselineEntry::new(file.clone(), snap.clone(), events, AlertMode::Log).unwrap(),
        );

        apply_change(&mut map, &file, snap.clone(), true, None);
        let since = map[&file].missing_since.unwrap();
        apply_change(&mut map, &file, snap.clone(), true, None);
        assert_eq!(map[&file].missing_since, Some(since));
        apply_change(&mut map, &file, snap, false, None);
        assert!(map[&file].missing_since.is_none());
    }

    #[test]
    fn apply_change_ignores_removed_entries() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("gone.conf");
        std::fs::write(&file, b"x").unwrap();
        let mut map = BaselineMap::new();
        apply_change(&mut map, &file, snapshot(&file).unwrap(), false, None);
        assert!(map.is_empty());
    }

    #[test]
    fn apply_change_follows_kind_change() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("conf.d");
        std::fs::create_dir(&target).unwrap();
        let events: BTreeSet<WatchEvent> = [WatchEvent::Modify].into_iter().collect();
        let mut map = BaselineMap::new();
        map.insert(
            target.clone(),
            BaselineEntry::new(target.clone(), snapshot(&target).unwrap(), events, AlertMode::Log)
                .unwrap(),
        );

        std::fs::remove_dir(&target).unwrap();
        std::fs::write(&target, b"replaced").unwrap();
        apply_change(&mut map, &target, snapshot(&target).unwrap(), false, None);

        let entry = &map[&target];
        assert_eq!(entry.kind, EntryKind::File);
        assert!(entry.last_seen_state.content_hash.is_some());
        entry.validate().unwrap();
    }
}
