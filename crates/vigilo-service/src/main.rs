use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use vigilo_core::audit_log::{AuditLog, AuditSeverity};
use vigilo_core::history::HistoryLog;
use vigilo_core::paths::DataPaths;
use vigilo_core::settings::MonitorSettings;
use vigilo_core::store::BaselineStore;
use vigilo_service::alert::notifiers::build_notifiers;
use vigilo_service::alert::{Dispatcher, RetryPolicy};
use vigilo_service::integrity::watcher::FsWatcher;
use vigilo_service::Monitor;

const AUDIT_LOG_MAX_BYTES: u64 = 5 * 1024 * 1024;

#[derive(Parser, Debug)]
#[command(author, version, about = "Vigilo file integrity monitoring service", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the monitoring loop in the foreground
    Run {
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
    /// Check the audit log hash chain
    VerifyAudit {
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let cli = Cli::parse();
    match cli.command {
        Commands::Run { data_dir } => run_command(data_dir).await,
        Commands::VerifyAudit { data_dir } => verify_audit_command(data_dir),
    }
}

async fn run_command(data_dir_override: Option<PathBuf>) -> Result<()> {
    let paths = DataPaths::resolve(data_dir_override)?;
    paths
        .ensure()
        .with_context(|| format!("cannot create data directory {}", paths.root.display()))?;
    let settings = MonitorSettings::load(&paths.settings)?;
    let audit = Arc::new(AuditLog::new(&paths.audit_log, AUDIT_LOG_MAX_BYTES)?);

    let history = HistoryLog::new(&paths.history)?
        .with_lock_policy(settings.lock_timeout(), settings.lock_retry());
    match history.prune_older_than(settings.retention()) {
        Ok(0) => {}
        Ok(removed) => {
            audit.append(
                "HISTORY_PRUNED",
                AuditSeverity::Info,
                serde_json::json!({
                    "removed": removed,
                    "retention_days": settings.history.retention_days,
                }),
            )?;
        }
        Err(e) => warn!(error = %e, "history retention pruning failed"),
    }

    let store = BaselineStore::new(&paths.baseline)
        .with_lock_policy(settings.lock_timeout(), settings.lock_retry());
    let dispatcher = Dispatcher::new(
        build_notifiers(&settings, &paths.alert_log),
        RetryPolicy::from_settings(&settings),
    );
    let (watcher, raw_rx) = FsWatcher::new().context("cannot start file watcher")?;
    let (monitor, handle) = Monitor::new(settings, store, history, dispatcher, Some(audit));

    let mut monitor_task = tokio::spawn(monitor.run(raw_rx, watcher));
    info!(data_dir = %paths.root.display(), "service started");

    let outcome = tokio::select! {
        res = signal::ctrl_c() => {
            res?;
            info!("service stopping");
            handle.shutdown();
            monitor_task.await?
        }
        res = &mut monitor_task => res?,
    };
    if let Err(e) = outcome {
        error!(error = %e, "monitoring terminated");
        return Err(e.into());
    }
    Ok(())
}

fn verify_audit_command(data_dir_override: Option<PathBuf>) -> Result<()> {
    let paths = DataPaths::resolve(data_dir_override)?;
    let audit = AuditLog::new(&paths.audit_log, AUDIT_LOG_MAX_BYTES)?;
    match audit.verify_chain()? {
        vigilo_core::audit_log::ChainStatus::Intact { entries } => {
            println!("audit log intact ({entries} entries)");
            Ok(())
        }
        vigilo_core::audit_log::ChainStatus::Broken { at_seq, line } => {
            anyhow::bail!(
                "audit log chain broken at line {line}{}",
                at_seq.map(|s| format!(" (seq {s})")).unwrap_or_default()
            )
        }
    }
}
