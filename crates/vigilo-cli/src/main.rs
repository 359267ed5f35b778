use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;
use vigilo_core::baseline::{is_forbidden_path, AlertMode, BaselineEntry, WatchEvent};
use vigilo_core::history::HistoryLog;
use vigilo_core::paths::DataPaths;
use vigilo_core::report::{AlertReport, ChangeKind, ChangeRecord};
use vigilo_core::settings::MonitorSettings;
use vigilo_core::snapshot::{self, normalize_path, SnapshotDiff};
use vigilo_core::store::BaselineStore;
use vigilo_service::alert::notifiers::{available_modes, build_notifiers};
use vigilo_service::alert::{Dispatcher, RetryPolicy};

#[derive(Parser)]
#[command(name = "vigilo")]
#[command(about = "Manage the files and directories watched by vigilo", long_about = None)]
struct Cli {
    /// Data directory (defaults to VIGILO_DATA_DIR, then the platform data dir)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Print machine-readable JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start monitoring a file or directory
    Add {
        path: PathBuf,

        /// Named event set: full or default (overrides individual flags)
        #[arg(long)]
        preset: Option<String>,

        #[command(flatten)]
        events: EventFlags,

        /// Alert channel: desktop, log, email, webhook or silent
        #[arg(long, default_value = "log")]
        mode: AlertMode,
    },

    /// Stop monitoring a path
    Remove { path: PathBuf },

    /// List monitored paths
    List,

    /// Show the stored baseline of one path
    Info { path: PathBuf },

    /// Change the watched events of a path
    Events {
        #[command(subcommand)]
        action: EventsAction,
    },

    /// Alert channel configuration and testing
    Alert {
        #[command(subcommand)]
        action: AlertAction,
    },

    /// Show recorded alerts, newest first
    History {
        /// Only alerts dispatched at or after this RFC 3339 timestamp
        #[arg(long)]
        since: Option<DateTime<Utc>>,

        #[arg(short, long, default_value = "50")]
        limit: usize,
    },

    /// Drop history entries older than the retention period
    Prune {
        /// Retention in days (defaults to the configured retention)
        #[arg(long)]
        days: Option<u32>,
    },
}

#[derive(Args, Default)]
struct EventFlags {
    #[arg(long)]
    modify: bool,
    #[arg(long)]
    delete: bool,
    #[arg(long = "move")]
    moved: bool,
    #[arg(long)]
    permission_change: bool,
    #[arg(long)]
    child_added: bool,
}

impl EventFlags {
    fn selected(&self) -> BTreeSet<WatchEvent> {
        [
            (self.modify, WatchEvent::Modify),
            (self.delete, WatchEvent::Delete),
            (self.moved, WatchEvent::Move),
            (self.permission_change, WatchEvent::PermissionChange),
            (self.child_added, WatchEvent::ChildAdded),
        ]
        .into_iter()
        .filter_map(|(on, event)| on.then_some(event))
        .collect()
    }
}

#[derive(Subcommand)]
enum EventsAction {
    /// Replace the watched set
    Set {
        path: PathBuf,
        #[arg(required = true)]
        events: Vec<WatchEvent>,
    },
    /// Watch additional events
    Add {
        path: PathBuf,
        #[arg(required = true)]
        events: Vec<WatchEvent>,
    },
    /// Stop watching events (at least one must remain)
    Remove {
        path: PathBuf,
        #[arg(required = true)]
        events: Vec<WatchEvent>,
    },
}

#[derive(Subcommand)]
enum AlertAction {
    /// Change the alert channel of a path
    Set { path: PathBuf, mode: AlertMode },
    /// List channels usable with the current settings
    Modes,
    /// Send a synthetic alert through every usable channel
    Test,
}

struct Admin {
    paths: DataPaths,
    settings: MonitorSettings,
    store: BaselineStore,
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();

    let paths = DataPaths::resolve(cli.data_dir)?;
    paths
        .ensure()
        .with_context(|| format!("cannot create data directory {}", paths.root.display()))?;
    let settings = MonitorSettings::load(&paths.settings)?;
    let store = BaselineStore::new(&paths.baseline)
        .with_lock_policy(settings.lock_timeout(), settings.lock_retry());
    let ctx = Admin {
        paths,
        settings,
        store,
        json: cli.json,
    };

    match cli.command {
        Commands::Add {
            path,
            preset,
            events,
            mode,
        } => add(&ctx, &path, preset.as_deref(), &events, mode),
        Commands::Remove { path } => remove(&ctx, &path),
        Commands::List => list(&ctx),
        Commands::Info { path } => info_cmd(&ctx, &path),
        Commands::Events { action } => edit_events(&ctx, action),
        Commands::Alert { action } => match action {
            AlertAction::Set { path, mode } => set_mode(&ctx, &path, mode),
            AlertAction::Modes => {
                let modes: Vec<&str> = available_modes(&ctx.settings)
                    .iter()
                    .map(AlertMode::as_str)
                    .collect();
                println!("{}", modes.join("\n"));
                Ok(())
            }
            AlertAction::Test => alert_test(&ctx).await,
        },
        Commands::History { since, limit } => history(&ctx, since, limit),
        Commands::Prune { days } => prune(&ctx, days),
    }
}

/// Resolve an operator-supplied path the same way entries are keyed.
fn resolve_path(path: &Path) -> Result<PathBuf> {
    normalize_path(path).with_context(|| format!("cannot resolve {}", path.display()))
}

fn add(
    ctx: &Admin,
    path: &Path,
    preset: Option<&str>,
    flags: &EventFlags,
    mode: AlertMode,
) -> Result<()> {
    let path = resolve_path(path)?;
    if is_forbidden_path(&path) {
        bail!("refusing to monitor protected system path {}", path.display());
    }
    let events = match preset {
        Some(name) => WatchEvent::preset(name)
            .ok_or_else(|| anyhow!("unknown preset '{name}' (expected full or default)"))?,
        None => {
            let selected = flags.selected();
            if selected.is_empty() {
                WatchEvent::preset("default").unwrap_or_default()
            } else {
                selected
            }
        }
    };
    let snap = snapshot::snapshot(&path)
        .with_context(|| format!("cannot take baseline of {}", path.display()))?;
    let entry = BaselineEntry::new(path.clone(), snap, events, mode)?;
    ctx.store.insert_new(entry.clone())?;
    info!(path = %path.display(), "entry added");
    if ctx.json {
        println!("{}", serde_json::to_string_pretty(&entry)?);
    } else {
        println!("monitoring {} ({}, alert: {})", path.display(), entry.kind.as_str(), mode);
    }
    Ok(())
}

fn remove(ctx: &Admin, path: &Path) -> Result<()> {
    let path = resolve_path(path)?;
    match ctx.store.remove(&path)? {
        Some(_) => {
            println!("no longer monitoring {}", path.display());
            Ok(())
        }
        None => bail!("{} is not monitored", path.display()),
    }
}

fn list(ctx: &Admin) -> Result<()> {
    let map = ctx.store.load()?;
    if ctx.json {
        let entries: Vec<&BaselineEntry> = map.values().collect();
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }
    if map.is_empty() {
        println!("nothing is monitored");
        return Ok(());
    }
    for entry in map.values() {
        let events: Vec<&str> = entry.watched_events.iter().map(WatchEvent::as_str).collect();
        println!(
            "{}\t{}\t{}\t{}{}",
            entry.path.display(),
            entry.kind.as_str(),
            entry.alert_mode,
            events.join(","),
            if entry.is_missing() { "\t(missing)" } else { "" }
        );
    }
    Ok(())
}

fn info_cmd(ctx: &Admin, path: &Path) -> Result<()> {
    let path = resolve_path(path)?;
    let map = ctx.store.load()?;
    let entry = map
        .get(&path)
        .ok_or_else(|| anyhow!("{} is not monitored", path.display()))?;
    println!("{}", serde_json::to_string_pretty(entry)?);
    Ok(())
}

fn edit_events(ctx: &Admin, action: EventsAction) -> Result<()> {
    let path = match &action {
        EventsAction::Set { path, .. }
        | EventsAction::Add { path, .. }
        | EventsAction::Remove { path, .. } => resolve_path(path)?,
    };
    let updated = update_entry(ctx, &path, |entry| match action {
        EventsAction::Set { events, .. } => entry.watched_events = events.into_iter().collect(),
        EventsAction::Add { events, .. } => entry.watched_events.extend(events),
        EventsAction::Remove { events, .. } => {
            for e in &events {
                entry.watched_events.remove(e);
            }
        }
    })?;
    let names: Vec<&str> = updated.watched_events.iter().map(WatchEvent::as_str).collect();
    println!("{}: {}", path.display(), names.join(","));
    Ok(())
}

fn set_mode(ctx: &Admin, path: &Path, mode: AlertMode) -> Result<()> {
    let path = resolve_path(path)?;
    update_entry(ctx, &path, |entry| entry.alert_mode = mode)?;
    println!("{}: alert mode {}", path.display(), mode);
    Ok(())
}

/// Apply `edit` under the store lock; the edited entry must still validate.
fn update_entry(
    ctx: &Admin,
    path: &Path,
    edit: impl FnOnce(&mut BaselineEntry),
) -> Result<BaselineEntry> {
    let updated = ctx.store.update(|map| {
        let entry = map.get_mut(path).ok_or_else(|| {
            vigilo_core::VigiloError::InvalidEntry(format!("{} is not monitored", path.display()))
        })?;
        edit(entry);
        entry.validate()?;
        Ok(entry.clone())
    })?;
    debug!(path = %path.display(), "entry updated");
    Ok(updated)
}

async fn alert_test(ctx: &Admin) -> Result<()> {
    let dispatcher = Dispatcher::new(
        build_notifiers(&ctx.settings, &ctx.paths.alert_log),
        RetryPolicy::from_settings(&ctx.settings),
    );
    let record = ChangeRecord {
        path: ctx.paths.root.join("vigilo-test-alert"),
        entry_path: ctx.paths.root.join("vigilo-test-alert"),
        event_type: ChangeKind::Modify,
        previous_snapshot: None,
        current_snapshot: None,
        diff: SnapshotDiff::default(),
        destination: None,
        detected_at: Utc::now(),
    };
    let mut failed = Vec::new();
    let mut results: Vec<AlertReport> = Vec::new();
    for mode in available_modes(&ctx.settings) {
        let report = dispatcher.dispatch(&record, mode).await;
        let ok = report.delivery_succeeded() || mode == AlertMode::Silent;
        if !ctx.json {
            println!("{:<8} {:?}", mode.as_str(), report.delivery);
        }
        if !ok {
            failed.push(mode.as_str());
        }
        results.push(report);
    }
    if ctx.json {
        println!("{}", serde_json::to_string_pretty(&results)?);
    }
    if !failed.is_empty() {
        bail!("alert test failed for: {}", failed.join(", "));
    }
    Ok(())
}

fn history(ctx: &Admin, since: Option<DateTime<Utc>>, limit: usize) -> Result<()> {
    let log = HistoryLog::new(&ctx.paths.history)?;
    let entries = log.read_recent(since, Some(limit))?;
    if ctx.json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }
    if entries.is_empty() {
        println!("no alerts recorded");
        return Ok(());
    }
    for e in entries {
        println!(
            "{}\t{}\t{}\t{}{}",
            e.dispatched_at.to_rfc3339(),
            e.report.event_type,
            e.report.path.display(),
            e.delivered_channel,
            if e.delivery_succeeded { "" } else { "\t(undelivered)" }
        );
    }
    Ok(())
}

fn prune(ctx: &Admin, days: Option<u32>) -> Result<()> {
    let retention = match days {
        Some(d) => chrono::Duration::days(i64::from(d)),
        None => ctx.settings.retention(),
    };
    let log = HistoryLog::new(&ctx.paths.history)?
        .with_lock_policy(ctx.settings.lock_timeout(), ctx.settings.lock_retry());
    let removed = log.prune_older_than(retention)?;
    println!("removed {removed} history entries");
    Ok(())
}
