use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VigiloError {
    #[error("path does not exist: {0}")]
    PathMissing(PathBuf),

    #[error("path unreadable: {path}: {reason}")]
    PathUnreadable { path: PathBuf, reason: String },

    #[error("baseline store corrupt at {path}: {reason}")]
    StoreCorrupt { path: PathBuf, reason: String },

    #[error("alert channel {channel} unavailable: {reason}")]
    ChannelUnavailable { channel: String, reason: String },

    #[error("alert channel {channel} timed out after {timeout_ms} ms")]
    ChannelTimeout { channel: String, timeout_ms: u64 },

    #[error("invalid baseline entry: {0}")]
    InvalidEntry(String),

    #[error("could not acquire store lock {path} within {waited_ms} ms")]
    LockTimeout { path: PathBuf, waited_ms: u64 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, VigiloError>;

impl VigiloError {
    /// Map an I/O failure on `path` onto the snapshot taxonomy.
    pub fn from_io(path: impl Into<PathBuf>, err: std::io::Error) -> Self {
        let path = path.into();
        match err.kind() {
            std::io::ErrorKind::NotFound => VigiloError::PathMissing(path),
            _ => VigiloError::PathUnreadable {
                path,
                reason: err.to_string(),
            },
        }
    }
}
