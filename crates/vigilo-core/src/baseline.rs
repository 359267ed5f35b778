//! Baseline data model: one `BaselineEntry` per monitored path.

use crate::error::{Result, VigiloError};
use crate::snapshot::{EntryKind, Snapshot};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// The in-memory mapping held by the store, ordered so serialization is stable.
pub type BaselineMap = BTreeMap<PathBuf, BaselineEntry>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "camelCase")]
pub enum WatchEvent {
    Modify,
    Delete,
    Move,
    PermissionChange,
    ChildAdded,
}

impl WatchEvent {
    pub const ALL: [WatchEvent; 5] = [
        WatchEvent::Modify,
        WatchEvent::Delete,
        WatchEvent::Move,
        WatchEvent::PermissionChange,
        WatchEvent::ChildAdded,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WatchEvent::Modify => "modify",
            WatchEvent::Delete => "delete",
            WatchEvent::Move => "move",
            WatchEvent::PermissionChange => "permissionChange",
            WatchEvent::ChildAdded => "childAdded",
        }
    }

    /// Named event sets: `full` watches everything, `default` watches
    /// modify, delete and permission changes.
    pub fn preset(name: &str) -> Option<BTreeSet<WatchEvent>> {
        match name {
            "full" => Some(Self::ALL.into_iter().collect()),
            "default" => Some(
                [
                    WatchEvent::Modify,
                    WatchEvent::Delete,
                    WatchEvent::PermissionChange,
                ]
                .into_iter()
                .collect(),
            ),
            _ => None,
        }
    }
}

impl fmt::Display for WatchEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WatchEvent {
    type Err = VigiloError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "modify" => Ok(WatchEvent::Modify),
            "delete" => Ok(WatchEvent::Delete),
            "move" => Ok(WatchEvent::Move),
            "permissionchange" | "permissions" | "permission-change" => {
                Ok(WatchEvent::PermissionChange)
            }
            "childadded" | "add" | "child-added" => Ok(WatchEvent::ChildAdded),
            other => Err(VigiloError::InvalidEntry(format!(
                "unknown watch event '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum AlertMode {
    Desktop,
    Log,
    Email,
    Webhook,
    Silent,
}

impl AlertMode {
    pub const ALL: [AlertMode; 5] = [
        AlertMode::Desktop,
        AlertMode::Log,
        AlertMode::Email,
        AlertMode::Webhook,
        AlertMode::Silent,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AlertMode::Desktop => "desktop",
            AlertMode::Log => "log",
            AlertMode::Email => "email",
            AlertMode::Webhook => "webhook",
            AlertMode::Silent => "silent",
        }
    }
}

impl fmt::Display for AlertMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AlertMode {
    type Err = VigiloError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "desktop" | "system" => Ok(AlertMode::Desktop),
            "log" => Ok(AlertMode::Log),
            "email" => Ok(AlertMode::Email),
            "webhook" | "remote" => Ok(AlertMode::Webhook),
            "silent" => Ok(AlertMode::Silent),
            other => Err(VigiloError::InvalidEntry(format!(
                "unknown alert mode '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BaselineEntry {
    pub path: PathBuf,
    pub kind: EntryKind,
    /// Snapshot recorded when the entry was added.
    pub baseline: Snapshot,
    pub watched_events: BTreeSet<WatchEvent>,
    pub alert_mode: AlertMode,
    /// Rolling reference for diffing, replaced after every processed change.
    pub last_seen_state: Snapshot,
    pub added_at: DateTime<Utc>,
    /// Set while the path is absent from disk. The entry is kept so a
    /// recreated path is judged against its last known-good state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub missing_since: Option<DateTime<Utc>>,
}

impl BaselineEntry {
    pub fn new(
        path: PathBuf,
        snapshot: Snapshot,
        watched_events: BTreeSet<WatchEvent>,
        alert_mode: AlertMode,
    ) -> Result<Self> {
        let entry = Self {
            path,
            kind: snapshot.kind,
            baseline: snapshot.clone(),
            watched_events,
            alert_mode,
            last_seen_state: snapshot,
            added_at: Utc::now(),
            missing_since: None,
        };
        entry.validate()?;
        Ok(entry)
    }

    pub fn validate(&self) -> Result<()> {
        if self.watched_events.is_empty() {
            return Err(VigiloError::InvalidEntry(format!(
                "{}: watched event set must not be empty",
                self.path.display()
            )));
        }
        if !self.path.is_absolute() {
            return Err(VigiloError::InvalidEntry(format!(
                "{}: path must be absolute",
                self.path.display()
            )));
        }
        // The path may change kind between snapshots, so each snapshot is
        // checked against the kind it recorded.
        for snapshot in [&self.baseline, &self.last_seen_state] {
            if snapshot.kind == EntryKind::Directory && snapshot.content_hash.is_some() {
                return Err(VigiloError::InvalidEntry(format!(
                    "{}: directory snapshots carry no content hash",
                    self.path.display()
                )));
            }
        }
        Ok(())
    }

    pub fn watches(&self, event: WatchEvent) -> bool {
        self.watched_events.contains(&event)
    }

    pub fn content_hash(&self) -> Option<&str> {
        self.last_seen_state.content_hash.as_deref()
    }

    pub fn is_missing(&self) -> bool {
        self.missing_since.is_some()
    }
}

const FORBIDDEN_PREFIXES: &[&str] = &["/etc/shadow", "/etc/passwd", "/root/.ssh", "/proc", "/sys"];

/// Paths that must never be placed under monitoring.
pub fn is_forbidden_path(path: &Path) -> bool {
    FORBIDDEN_PREFIXES
        .iter()
        .any(|prefix| path.starts_with(prefix))
}
