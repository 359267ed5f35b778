use directories::ProjectDirs;
use std::path::{Path, PathBuf};

pub const APP_QUALIFIER: &str = "com";
pub const APP_ORG: &str = "vigilo";
pub const APP_NAME: &str = "vigilo";

pub const DATA_DIR_ENV: &str = "VIGILO_DATA_DIR";

pub fn data_dir() -> anyhow::Result<PathBuf> {
    if let Ok(override_path) = std::env::var(DATA_DIR_ENV) {
        if !override_path.is_empty() {
            return Ok(PathBuf::from(override_path));
        }
    }
    let dirs = ProjectDirs::from(APP_QUALIFIER, APP_ORG, APP_NAME)
        .ok_or_else(|| anyhow::anyhow!("cannot determine data directory"))?;
    Ok(dirs.data_dir().to_path_buf())
}

/// Locations of the independently readable durable resources.
#[derive(Debug, Clone)]
pub struct DataPaths {
    pub root: PathBuf,
    pub baseline: PathBuf,
    pub history: PathBuf,
    pub audit_log: PathBuf,
    pub alert_log: PathBuf,
    pub settings: PathBuf,
}

impl DataPaths {
    pub fn new(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref().to_path_buf();
        Self {
            baseline: root.join("baseline.json"),
            history: root.join("history.jsonl"),
            audit_log: root.join("audit.log"),
            alert_log: root.join("alerts.log"),
            settings: root.join("settings.json"),
            root,
        }
    }

    /// Explicit override first, then `VIGILO_DATA_DIR`, then the platform
    /// data directory.
    pub fn resolve(override_root: Option<PathBuf>) -> anyhow::Result<Self> {
        let root = match override_root {
            Some(p) => p,
            None => data_dir()?,
        };
        Ok(Self::new(root))
    }

    pub fn ensure(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.root)
    }
}
