//! Classified changes and the alert reports built from them.

use crate::baseline::{AlertMode, WatchEvent};
use crate::snapshot::{FieldChange, Snapshot, SnapshotDiff};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

/// Logical change category, derived from the snapshot diff rather than the
/// raw filesystem operation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum ChangeKind {
    Modify,
    Delete,
    Move,
    PermissionChange,
    Add,
}

impl ChangeKind {
    /// The watched-event switch that gates this kind of change.
    pub fn watch_event(&self) -> WatchEvent {
        match self {
            ChangeKind::Modify => WatchEvent::Modify,
            ChangeKind::Delete => WatchEvent::Delete,
            ChangeKind::Move => WatchEvent::Move,
            ChangeKind::PermissionChange => WatchEvent::PermissionChange,
            ChangeKind::Add => WatchEvent::ChildAdded,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Modify => "modify",
            ChangeKind::Delete => "delete",
            ChangeKind::Move => "move",
            ChangeKind::PermissionChange => "permissionChange",
            ChangeKind::Add => "add",
        }
    }

    pub fn interpretation(&self) -> &'static str {
        match self {
            ChangeKind::Modify => "File content or metadata was modified",
            ChangeKind::Delete => "File was deleted from filesystem",
            ChangeKind::Move => "File was moved or renamed",
            ChangeKind::PermissionChange => "Permissions or ownership changed",
            ChangeKind::Add => "New file was created",
        }
    }

    pub fn recommendation(&self) -> &'static str {
        match self {
            ChangeKind::Modify => "Review changes and verify legitimacy",
            ChangeKind::Delete => "Restore from backup if unauthorized",
            ChangeKind::Move => "Verify new location and update monitoring",
            ChangeKind::PermissionChange => "Confirm the change was authorised",
            ChangeKind::Add => "Verify file origin and legitimacy",
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Output of classification. Immutable once built.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChangeRecord {
    /// Path the change happened on (a child path for `Add` under a
    /// monitored directory).
    pub path: PathBuf,
    /// Key of the baseline entry this change is accounted to.
    pub entry_path: PathBuf,
    pub event_type: ChangeKind,
    pub previous_snapshot: Option<Snapshot>,
    pub current_snapshot: Option<Snapshot>,
    pub diff: SnapshotDiff,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<PathBuf>,
    pub detected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Delivered,
    Failed { error: String },
    TimedOut { after_ms: u64 },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DispatchAttempt {
    pub channel: AlertMode,
    pub attempt: u32,
    pub outcome: AttemptOutcome,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Not dispatched yet.
    Pending,
    Delivered,
    /// The configured channel failed every attempt; the log channel took it.
    Degraded,
    /// Alert mode `silent`: recorded only.
    Silenced,
    /// Even the log fallback failed. The history entry is the only trace.
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AlertReport {
    pub id: Uuid,
    pub path: PathBuf,
    pub entry_path: PathBuf,
    pub event_type: ChangeKind,
    pub detected_at: DateTime<Utc>,
    pub diff_summary: String,
    pub changes: Vec<FieldChange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<PathBuf>,
    pub owner_uid: Option<u32>,
    pub owner_gid: Option<u32>,
    pub permission_bits: Option<u32>,
    pub interpretation: String,
    pub recommendation: String,
    pub alert_mode: AlertMode,
    pub dispatch_attempts: Vec<DispatchAttempt>,
    pub delivery: DeliveryStatus,
}

impl AlertReport {
    pub fn from_record(record: &ChangeRecord, alert_mode: AlertMode) -> Self {
        let reference = record
            .current_snapshot
            .as_ref()
            .or(record.previous_snapshot.as_ref());
        Self {
            id: Uuid::new_v4(),
            path: record.path.clone(),
            entry_path: record.entry_path.clone(),
            event_type: record.event_type,
            detected_at: record.detected_at,
            diff_summary: record.diff.summary(),
            changes: record.diff.changes.clone(),
            destination: record.destination.clone(),
            owner_uid: reference.map(|s| s.owner_uid),
            owner_gid: reference.map(|s| s.owner_gid),
            permission_bits: reference.map(|s| s.permission_bits),
            interpretation: record.event_type.interpretation().to_string(),
            recommendation: record.event_type.recommendation().to_string(),
            alert_mode,
            dispatch_attempts: Vec::new(),
            delivery: DeliveryStatus::Pending,
        }
    }

    /// Channel that last carried (or last tried to carry) the report. After
    /// a fallback this is `log`; with no attempts it is the configured mode.
    pub fn delivered_channel(&self) -> AlertMode {
        self.dispatch_attempts
            .last()
            .map(|a| a.channel)
            .unwrap_or(self.alert_mode)
    }

    pub fn delivery_succeeded(&self) -> bool {
        matches!(
            self.delivery,
            DeliveryStatus::Delivered | DeliveryStatus::Degraded
        )
    }
}
