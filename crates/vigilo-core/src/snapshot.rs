//! Snapshot engine.
//!
//! Captures the hash and metadata of a path and compares two captures. Only
//! content hash, size, permission bits, ownership, kind and existence take
//! part in the comparison; mtime, atime and inode are carried for reporting
//! and move detection but never produce a difference on their own.

use crate::error::{Result, VigiloError};
use blake3::Hasher;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Read;
use std::path::{Component, Path, PathBuf};

const HASH_BUFFER: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Directory,
}

impl EntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::File => "file",
            EntryKind::Directory => "directory",
        }
    }
}

/// Point-in-time capture of a path.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Snapshot {
    pub kind: EntryKind,
    /// BLAKE3 hex digest of the file bytes; always `None` for directories
    /// and for metadata-only captures.
    pub content_hash: Option<String>,
    /// Byte length for files, immediate child count for directories.
    pub size: u64,
    pub permission_bits: u32,
    pub owner_uid: u32,
    pub owner_gid: u32,
    pub modified_time: DateTime<Utc>,
    #[serde(default)]
    pub inode: u64,
    /// False when only `stat` succeeded (content could not be read).
    #[serde(default = "default_true")]
    pub readable: bool,
}

fn default_true() -> bool {
    true
}

/// Capture hash and metadata for `path`.
///
/// Fails with `PathMissing` when the path does not exist and with
/// `PathUnreadable` when it exists but cannot be read.
pub fn snapshot(path: &Path) -> Result<Snapshot> {
    let meta = fs::metadata(path).map_err(|e| VigiloError::from_io(path, e))?;
    let mut snap = from_metadata(&meta);
    match snap.kind {
        EntryKind::File => {
            let (hash, size) = hash_file(path)?;
            snap.content_hash = Some(hash);
            snap.size = size;
        }
        EntryKind::Directory => {
            snap.size = count_children(path)?;
        }
    }
    Ok(snap)
}

/// Capture metadata only. Used when the content of `path` cannot be read
/// but `stat` still works, so permission changes remain observable.
pub fn metadata_snapshot(path: &Path) -> Result<Snapshot> {
    let meta = fs::metadata(path).map_err(|e| VigiloError::from_io(path, e))?;
    let mut snap = from_metadata(&meta);
    snap.readable = false;
    Ok(snap)
}

/// Hash a single file with BLAKE3, returning the hex digest and byte count.
pub fn hash_file(path: &Path) -> Result<(String, u64)> {
    let mut file = File::open(path).map_err(|e| VigiloError::from_io(path, e))?;
    let mut hasher = Hasher::new();
    let mut buffer = vec![0u8; HASH_BUFFER];
    let mut total = 0u64;
    loop {
        let n = file
            .read(&mut buffer)
            .map_err(|e| VigiloError::from_io(path, e))?;
        if n == 0 {
            break;
        }
        total += n as u64;
        hasher.update(&buffer[..n]);
    }
    Ok((hasher.finalize().to_hex().to_string(), total))
}

fn count_children(path: &Path) -> Result<u64> {
    let entries = fs::read_dir(path).map_err(|e| VigiloError::from_io(path, e))?;
    Ok(entries.filter_map(|e| e.ok()).count() as u64)
}

fn from_metadata(meta: &fs::Metadata) -> Snapshot {
    let kind = if meta.is_dir() {
        EntryKind::Directory
    } else {
        EntryKind::File
    };
    let modified_time = meta
        .modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now());

    #[cfg(unix)]
    let (permission_bits, owner_uid, owner_gid, inode) = {
        use std::os::unix::fs::MetadataExt;
        (meta.mode() & 0o7777, meta.uid(), meta.gid(), meta.ino())
    };
    #[cfg(not(unix))]
    let (permission_bits, owner_uid, owner_gid, inode) = {
        let bits = if meta.permissions().readonly() { 0o444 } else { 0o644 };
        (bits, 0u32, 0u32, 0u64)
    };

    Snapshot {
        kind,
        content_hash: None,
        size: if kind == EntryKind::File { meta.len() } else { 0 },
        permission_bits,
        owner_uid,
        owner_gid,
        modified_time,
        inode,
        readable: true,
    }
}

// ── Diffing ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotField {
    Existence,
    Kind,
    ContentHash,
    Size,
    PermissionBits,
    OwnerUid,
    OwnerGid,
}

impl SnapshotField {
    pub fn as_str(&self) -> &'static str {
        match self {
            SnapshotField::Existence => "existence",
            SnapshotField::Kind => "kind",
            SnapshotField::ContentHash => "content_hash",
            SnapshotField::Size => "size",
            SnapshotField::PermissionBits => "permissions",
            SnapshotField::OwnerUid => "owner_uid",
            SnapshotField::OwnerGid => "owner_gid",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FieldChange {
    pub field: SnapshotField,
    pub before: Option<String>,
    pub after: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SnapshotDiff {
    pub changes: Vec<FieldChange>,
}

impl SnapshotDiff {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn contains(&self, field: SnapshotField) -> bool {
        self.changes.iter().any(|c| c.field == field)
    }

    pub fn content_changed(&self) -> bool {
        self.contains(SnapshotField::ContentHash)
            || self.contains(SnapshotField::Size)
            || self.contains(SnapshotField::Kind)
    }

    pub fn access_changed(&self) -> bool {
        self.contains(SnapshotField::PermissionBits)
            || self.contains(SnapshotField::OwnerUid)
            || self.contains(SnapshotField::OwnerGid)
    }

    /// One-line human summary, e.g. `size: 10 -> 12; permissions: 644 -> 600`.
    pub fn summary(&self) -> String {
        if self.changes.is_empty() {
            return "no semantic change".to_string();
        }
        self.changes
            .iter()
            .map(|c| {
                format!(
                    "{}: {} -> {}",
                    c.field.as_str(),
                    c.before.as_deref().unwrap_or("-"),
                    c.after.as_deref().unwrap_or("-")
                )
            })
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Compare two captures. `None` means the path did not exist.
pub fn diff(previous: Option<&Snapshot>, current: Option<&Snapshot>) -> SnapshotDiff {
    let mut changes = Vec::new();
    let (prev, cur) = match (previous, current) {
        (None, None) => return SnapshotDiff::default(),
        (Some(_), None) => {
            changes.push(FieldChange {
                field: SnapshotField::Existence,
                before: Some("present".into()),
                after: Some("missing".into()),
            });
            return SnapshotDiff { changes };
        }
        (None, Some(_)) => {
            changes.push(FieldChange {
                field: SnapshotField::Existence,
                before: Some("missing".into()),
                after: Some("present".into()),
            });
            return SnapshotDiff { changes };
        }
        (Some(p), Some(c)) => (p, c),
    };

    if prev.kind != cur.kind {
        changes.push(FieldChange {
            field: SnapshotField::Kind,
            before: Some(prev.kind.as_str().into()),
            after: Some(cur.kind.as_str().into()),
        });
    }
    // Content can only be compared when both sides were actually read.
    if prev.readable && cur.readable {
        if prev.content_hash != cur.content_hash {
            changes.push(FieldChange {
                field: SnapshotField::ContentHash,
                before: prev.content_hash.clone(),
                after: cur.content_hash.clone(),
            });
        }
        if prev.size != cur.size {
            changes.push(FieldChange {
                field: SnapshotField::Size,
                before: Some(prev.size.to_string()),
                after: Some(cur.size.to_string()),
            });
        }
    }
    if prev.permission_bits != cur.permission_bits {
        changes.push(FieldChange {
            field: SnapshotField::PermissionBits,
            before: Some(format!("{:o}", prev.permission_bits)),
            after: Some(format!("{:o}", cur.permission_bits)),
        });
    }
    if prev.owner_uid != cur.owner_uid {
        changes.push(FieldChange {
            field: SnapshotField::OwnerUid,
            before: Some(prev.owner_uid.to_string()),
            after: Some(cur.owner_uid.to_string()),
        });
    }
    if prev.owner_gid != cur.owner_gid {
        changes.push(FieldChange {
            field: SnapshotField::OwnerGid,
            before: Some(prev.owner_gid.to_string()),
            after: Some(cur.owner_gid.to_string()),
        });
    }
    SnapshotDiff { changes }
}

/// Normalize to an absolute path with symlinks resolved and no trailing
/// separator. Paths that no longer exist are resolved through their parent.
pub fn normalize_path(path: &Path) -> Result<PathBuf> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };
    if let Ok(canonical) = absolute.canonicalize() {
        return Ok(canonical);
    }
    let lexical = lexical_clean(&absolute);
    match (lexical.parent(), lexical.file_name()) {
        (Some(parent), Some(name)) => match parent.canonicalize() {
            Ok(p) => Ok(p.join(name)),
            Err(_) => Ok(lexical),
        },
        _ => Ok(lexical),
    }
}

fn lexical_clean(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn identical_bytes_hash_identically() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a.txt");
        let b = dir.path().join("b.txt");
        fs::write(&a, b"same bytes").unwrap();
        fs::write(&b, b"same bytes").unwrap();
        let (ha, sa) = hash_file(&a).unwrap();
        let (hb, _) = hash_file(&b).unwrap();
        assert_eq!(ha, hb);
        assert_eq!(sa, 10);
        assert_eq!(ha, blake3::hash(b"same bytes").to_hex().to_string());
    }

    #[test]
    fn directory_snapshot_has_no_hash_and_counts_children() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("one"), b"1").unwrap();
        fs::write(dir.path().join("two"), b"2").unwrap();
        let snap = snapshot(dir.path()).unwrap();
        assert_eq!(snap.kind, EntryKind::Directory);
        assert!(snap.content_hash.is_none());
        assert_eq!(snap.size, 2);
    }

    #[test]
    fn missing_path_is_reported() {
        let dir = tempdir().unwrap();
        let err = snapshot(&dir.path().join("nope")).unwrap_err();
        assert!(matches!(err, VigiloError::PathMissing(_)));
    }

    #[test]
    fn mtime_only_change_is_not_a_difference() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f");
        fs::write(&path, b"content").unwrap();
        let before = snapshot(&path).unwrap();
        let mut after = before.clone();
        after.modified_time = before.modified_time + chrono::Duration::seconds(90);
        after.inode += 1;
        assert!(diff(Some(&before), Some(&after)).is_empty());
    }

    #[test]
    fn content_change_is_detected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f");
        fs::write(&path, b"content").unwrap();
        let before = snapshot(&path).unwrap();
        fs::write(&path, b"changed content").unwrap();
        let after = snapshot(&path).unwrap();
        let d = diff(Some(&before), Some(&after));
        assert!(d.content_changed());
        assert!(!d.access_changed());
        assert!(d.summary().contains("size: 7 -> 15"));
    }

    #[cfg(unix)]
    #[test]
    fn permission_change_is_detected() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempdir().unwrap();
        let path = dir.path().join("f");
        fs::write(&path, b"content").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();
        let before = snapshot(&path).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o600)).unwrap();
        let after = snapshot(&path).unwrap();
        let d = diff(Some(&before), Some(&after));
        assert!(d.access_changed());
        assert!(!d.content_changed());
        assert_eq!(d.changes[0].before.as_deref(), Some("644"));
        assert_eq!(d.changes[0].after.as_deref(), Some("600"));
    }

    #[test]
    fn metadata_only_capture_skips_content_comparison() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f");
        fs::write(&path, b"content").unwrap();
        let full = snapshot(&path).unwrap();
        let meta_only = metadata_snapshot(&path).unwrap();
        assert!(meta_only.content_hash.is_none());
        assert!(diff(Some(&full), Some(&meta_only)).is_empty());
    }

    #[test]
    fn existence_transitions() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f");
        fs::write(&path, b"x").unwrap();
        let snap = snapshot(&path).unwrap();
        assert!(diff(Some(&snap), None).contains(SnapshotField::Existence));
        assert!(diff(None, Some(&snap)).contains(SnapshotField::Existence));
        assert!(diff(None, None).is_empty());
    }

    #[test]
    fn normalize_strips_dots_for_missing_paths() {
        let dir = tempdir().unwrap();
        let canonical_dir = dir.path().canonicalize().unwrap();
        let messy = dir.path().join("sub").join("..").join("gone.conf");
        assert_eq!(normalize_path(&messy).unwrap(), canonical_dir.join("gone.conf"));
    }
}
