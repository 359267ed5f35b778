use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClassifierSettings {
    /// Raw events for one path inside this window collapse into one evaluation.
    pub debounce_ms: u64,
    /// How often pending windows are checked for expiry.
    pub tick_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DispatchSettings {
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub channel_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StoreSettings {
    pub lock_timeout_ms: u64,
    pub lock_retry_ms: u64,
    pub persist_attempts: u32,
    pub reload_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HistorySettings {
    pub retention_days: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct MoveSettings {
    /// When set, a classified move creates a baseline entry at the destination.
    pub follow_moves: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DesktopSettings {
    pub command: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EmailSettings {
    pub sendmail_command: String,
    pub from: Option<String>,
    pub to: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct WebhookSettings {
    pub url: Option<String>,
    pub token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct MonitorSettings {
    pub classifier: ClassifierSettings,
    pub dispatch: DispatchSettings,
    pub workers: WorkerSettings,
    pub store: StoreSettings,
    pub history: HistorySettings,
    pub moves: MoveSettings,
    pub desktop: DesktopSettings,
    pub email: EmailSettings,
    pub webhook: WebhookSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorkerSettings {
    pub pool_size: usize,
}

impl Default for ClassifierSettings {
    fn default() -> Self {
        Self {
            debounce_ms: 300,
            tick_ms: 50,
        }
    }
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base_ms: 200,
            channel_timeout_ms: 5_000,
        }
    }
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self { pool_size: 4 }
    }
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            lock_timeout_ms: 5_000,
            lock_retry_ms: 50,
            persist_attempts: 3,
            reload_interval_secs: 10,
        }
    }
}

impl Default for HistorySettings {
    fn default() -> Self {
        Self {
            retention_days: 730,
        }
    }
}

impl Default for DesktopSettings {
    fn default() -> Self {
        Self {
            command: "notify-send".into(),
        }
    }
}

impl Default for EmailSettings {
    fn default() -> Self {
        Self {
            sendmail_command: "sendmail".into(),
            from: None,
            to: None,
        }
    }
}

impl MonitorSettings {
    /// Read `path` if present (defaults otherwise), apply environment
    /// overrides, then validate.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let mut settings = if path.exists() {
            let data = std::fs::read_to_string(path)?;
            serde_json::from_str(&data)
                .map_err(|e| anyhow::anyhow!("invalid settings {}: {e}", path.display()))?
        } else {
            Self::default()
        };
        settings.apply_env();
        settings.validate()?;
        Ok(settings)
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        self.validate()?;
        let data = serde_json::to_string_pretty(self)?;
        std::fs::write(path, data)?;
        Ok(())
    }

    fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("VIGILO_WEBHOOK_URL") {
            self.webhook.url = Some(url);
        }
        if let Ok(token) = std::env::var("VIGILO_WEBHOOK_TOKEN") {
            self.webhook.token = Some(token);
        }
        if let Ok(to) = std::env::var("VIGILO_ALERT_EMAIL_TO") {
            self.email.to = Some(to);
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.classifier.debounce_ms == 0 || self.classifier.debounce_ms > 10_000 {
            anyhow::bail!("Debounce window must be between 1 and 10000 ms");
        }
        if self.classifier.tick_ms == 0 || self.classifier.tick_ms > self.classifier.debounce_ms {
            anyhow::bail!("Classifier tick must be positive and not exceed the debounce window");
        }
        if self.dispatch.max_attempts == 0 || self.dispatch.max_attempts > 10 {
            anyhow::bail!("Dispatch attempts must be between 1 and 10");
        }
        if self.dispatch.channel_timeout_ms == 0 {
            anyhow::bail!("Channel timeout must be positive");
        }
        if self.workers.pool_size == 0 || self.workers.pool_size > 64 {
            anyhow::bail!("Worker pool size must be between 1 and 64");
        }
        if self.store.persist_attempts == 0 {
            anyhow::bail!("Persist attempts must be at least 1");
        }
        if self.store.reload_interval_secs == 0 {
            anyhow::bail!("Reload interval must be positive");
        }
        if self.history.retention_days == 0 {
            anyhow::bail!("History retention must be at least one day");
        }
        if let Some(url) = &self.webhook.url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                anyhow::bail!("Webhook URL must be http(s)");
            }
        }
        Ok(())
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.classifier.debounce_ms)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.classifier.tick_ms)
    }

    pub fn channel_timeout(&self) -> Duration {
        Duration::from_millis(self.dispatch.channel_timeout_ms)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.dispatch.backoff_base_ms)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.store.lock_timeout_ms)
    }

    pub fn lock_retry(&self) -> Duration {
        Duration::from_millis(self.store.lock_retry_ms)
    }

    pub fn reload_interval(&self) -> Duration {
        Duration::from_secs(self.store.reload_interval_secs)
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(self.history.retention_days as i64)
    }
}
