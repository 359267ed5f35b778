//! Concrete notifier channels.

use crate::alert::format;
use crate::alert::Notifier;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};
use vigilo_core::baseline::AlertMode;
use vigilo_core::error::{Result, VigiloError};
use vigilo_core::report::AlertReport;
use vigilo_core::settings::MonitorSettings;

fn unavailable(mode: AlertMode, reason: impl ToString) -> VigiloError {
    VigiloError::ChannelUnavailable {
        channel: mode.to_string(),
        reason: reason.to_string(),
    }
}

// ── log ─────────────────────────────────────────────────────────────────────

/// Appends the formatted summary to `alerts.log`. Also the fallback channel.
pub struct LogNotifier {
    path: PathBuf,
    writer: tokio::sync::Mutex<()>,
}

impl LogNotifier {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            writer: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl Notifier for LogNotifier {
    fn mode(&self) -> AlertMode {
        AlertMode::Log
    }

    async fn send(&self, report: &AlertReport) -> Result<()> {
        warn!(
            path = %report.path.display(),
            event = %report.event_type,
            diff = %report.diff_summary,
            "integrity alert"
        );
        let mut block = format::summary(report);
        block.push_str("\n\n");

        let _guard = self.writer.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| unavailable(AlertMode::Log, e))?;
        file.write_all(block.as_bytes())
            .await
            .map_err(|e| unavailable(AlertMode::Log, e))?;
        file.flush().await.map_err(|e| unavailable(AlertMode::Log, e))?;
        Ok(())
    }
}

// ── desktop ─────────────────────────────────────────────────────────────────

pub struct DesktopNotifier {
    command: String,
}

impl DesktopNotifier {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

#[async_trait]
impl Notifier for DesktopNotifier {
    fn mode(&self) -> AlertMode {
        AlertMode::Desktop
    }

    async fn send(&self, report: &AlertReport) -> Result<()> {
        let status = Command::new(&self.command)
            .arg("--urgency=normal")
            .arg("--icon=dialog-warning")
            .arg("File Monitoring Alert")
            .arg(format::desktop_message(report))
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status()
            .await
            .map_err(|e| unavailable(AlertMode::Desktop, e))?;
        if !status.success() {
            return Err(unavailable(
                AlertMode::Desktop,
                format!("{} exited with {}", self.command, status),
            ));
        }
        Ok(())
    }
}

// ── email ───────────────────────────────────────────────────────────────────

/// Hands a plain-text message to a local `sendmail -t`.
pub struct EmailNotifier {
    sendmail: String,
    from: String,
    to: String,
}

impl EmailNotifier {
    pub fn new(sendmail: impl Into<String>, from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            sendmail: sendmail.into(),
            from: from.into(),
            to: to.into(),
        }
    }

    fn message(&self, report: &AlertReport) -> String {
        format!(
            "From: {}\r\nTo: {}\r\nSubject: {}\r\nContent-Type: text/plain; charset=utf-8\r\n\r\n{}\r\n",
            self.from,
            self.to,
            format::subject(report),
            format::summary(report)
        )
    }
}

#[async_trait]
impl Notifier for EmailNotifier {
    fn mode(&self) -> AlertMode {
        AlertMode::Email
    }

    async fn send(&self, report: &AlertReport) -> Result<()> {
        let mut child = Command::new(&self.sendmail)
            .arg("-t")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| unavailable(AlertMode::Email, e))?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(self.message(report).as_bytes())
                .await
                .map_err(|e| unavailable(AlertMode::Email, e))?;
        }
        let status = child
            .wait()
            .await
            .map_err(|e| unavailable(AlertMode::Email, e))?;
        if !status.success() {
            return Err(unavailable(AlertMode::Email, format!("sendmail exited with {status}")));
        }
        debug!(to = %self.to, "alert mail handed to sendmail");
        Ok(())
    }
}

// ── webhook ─────────────────────────────────────────────────────────────────

/// POSTs the report as JSON, with a bearer token when configured.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
    token: Option<String>,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, token: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("vigilo/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| unavailable(AlertMode::Webhook, e))?;
        Ok(Self {
            client,
            url: url.into(),
            token,
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    fn mode(&self) -> AlertMode {
        AlertMode::Webhook
    }

    async fn send(&self, report: &AlertReport) -> Result<()> {
        let mut req = self.client.post(&self.url).json(report);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        let res = req
            .send()
            .await
            .map_err(|e| unavailable(AlertMode::Webhook, e))?;
        if !res.status().is_success() {
            return Err(unavailable(
                AlertMode::Webhook,
                format!("webhook answered {}", res.status()),
            ));
        }
        Ok(())
    }
}

// ── availability ────────────────────────────────────────────────────────────

fn command_on_path(command: &str) -> bool {
    let candidate = Path::new(command);
    if candidate.components().count() > 1 {
        return candidate.is_file();
    }
    std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join(command).is_file()))
        .unwrap_or(false)
}

/// Modes that can actually deliver with `settings` on this host.
pub fn available_modes(settings: &MonitorSettings) -> Vec<AlertMode> {
    let mut modes = vec![AlertMode::Log];
    if command_on_path(&settings.desktop.command) {
        modes.push(AlertMode::Desktop);
    }
    if settings.email.from.is_some()
        && settings.email.to.is_some()
        && command_on_path(&settings.email.sendmail_command)
    {
        modes.push(AlertMode::Email);
    }
    if settings.webhook.url.is_some() {
        modes.push(AlertMode::Webhook);
    }
    modes.push(AlertMode::Silent);
    modes
}

/// Build every configured channel. The log channel is always present.
pub fn build_notifiers(settings: &MonitorSettings, alert_log: &Path) -> Vec<Arc<dyn Notifier>> {
    let mut out: Vec<Arc<dyn Notifier>> = vec![Arc::new(LogNotifier::new(alert_log))];
    for mode in available_modes(settings) {
        match mode {
            AlertMode::Desktop => out.push(Arc::new(DesktopNotifier::new(&settings.desktop.command))),
            AlertMode::Email => {
                if let (Some(from), Some(to)) = (&settings.email.from, &settings.email.to) {
                    out.push(Arc::new(EmailNotifier::new(
                        &settings.email.sendmail_command,
                        from,
                        to,
                    )));
                }
            }
            AlertMode::Webhook => {
                if let Some(url) = &settings.webhook.url {
                    match WebhookNotifier::new(url, settings.webhook.token.clone()) {
                        Ok(n) => out.push(Arc::new(n)),
                        Err(e) => warn!(error = %e, "webhook channel disabled"),
                    }
                }
            }
            AlertMode::Log | AlertMode::Silent => {}
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use vigilo_core::report::{ChangeKind, ChangeRecord};
    use vigilo_core::snapshot::SnapshotDiff;

    fn report() -> AlertReport {
        let record = ChangeRecord {
            path: PathBuf::from("/srv/app/config.yml"),
            entry_path: PathBuf::from("/srv/app/config.yml"),
            event_type: ChangeKind::Delete,
            previous_snapshot: None,
            current_snapshot: None,
            diff: SnapshotDiff::default(),
            destination: None,
            detected_at: Utc::now(),
        };
        AlertReport::from_record(&record, AlertMode::Log)
    }

    #[tokio::test]
    async fn log_notifier_appends_summary() {
        let dir = tempfile::tempdir().unwrap();
        let notifier = LogNotifier::new(dir.path().join("alerts.log"));
        notifier.send(&report()).await.unwrap();
        notifier.send(&report()).await.unwrap();
        let text = std::fs::read_to_string(notifier.path()).unwrap();
        assert_eq!(text.matches("FILE MONITORING ALERT").count(), 2);
        assert!(text.contains("Restore from backup if unauthorized"));
    }

    #[tokio::test]
    async fn missing_desktop_command_is_unavailable() {
        let notifier = DesktopNotifier::new("/nonexistent/vigilo-notify");
        let err = notifier.send(&report()).await.unwrap_err();
        assert!(matches!(err, VigiloError::ChannelUnavailable { .. }));
    }

    #[test]
    fn unconfigured_channels_are_not_available() {
        let mut settings = MonitorSettings::default();
        settings.desktop.command = "/nonexistent/vigilo-notify".into();
        let modes = available_modes(&settings);
        assert_eq!(modes, vec![AlertMode::Log, AlertMode::Silent]);

        settings.webhook.url = Some("https://hooks.example.org/vigilo".into());
        assert!(available_modes(&settings).contains(&AlertMode::Webhook));
    }
}
