use chrono::Utc;
use predicates::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::{tempdir, TempDir};
use vigilo_core::baseline::{AlertMode, BaselineMap, WatchEvent};
use vigilo_core::history::HistoryLog;
use vigilo_core::report::{AlertReport, ChangeKind, ChangeRecord};
use vigilo_core::snapshot::SnapshotDiff;
use vigilo_core::store::BaselineStore;

/// A data directory with channel settings that never reach the host.
fn data_dir() -> TempDir {
    let dir = tempdir().unwrap();
    let settings = serde_json::json!({
        "desktop": { "command": "/nonexistent/vigilo-notify" },
        "dispatch": { "backoff_base_ms": 1 }
    });
    fs::write(
        dir.path().join("settings.json"),
        serde_json::to_vec_pretty(&settings).unwrap(),
    )
    .unwrap();
    dir
}

fn vigilo(data: &Path) -> assert_cmd::Command {
    let mut cmd = assert_cmd::Command::cargo_bin("vigilo").unwrap();
    cmd.env("VIGILO_DATA_DIR", data)
        .env_remove("VIGILO_WEBHOOK_URL")
        .env_remove("VIGILO_WEBHOOK_TOKEN")
        .env_remove("VIGILO_ALERT_EMAIL_TO");
    cmd
}

fn watched_file(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, b"key = value\n").unwrap();
    path.canonicalize().unwrap()
}

fn stored(data: &Path) -> BaselineMap {
    BaselineStore::new(data.join("baseline.json")).load().unwrap()
}

#[test]
fn add_then_list() {
    let data = data_dir();
    let work = tempdir().unwrap();
    let file = watched_file(work.path(), "app.conf");

    vigilo(data.path())
        .arg("add")
        .arg(&file)
        .arg("--mode")
        .arg("silent")
        .assert()
        .success()
        .stdout(predicate::str::contains("monitoring"));

    vigilo(data.path())
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains(file.to_str().unwrap()))
        .stdout(predicate::str::contains("modify,delete,permissionChange"));

    let map = stored(data.path());
    assert_eq!(map[&file].alert_mode, AlertMode::Silent);
    assert!(map[&file].baseline.content_hash.is_some());
}

#[test]
fn preset_overrides_individual_flags() {
    let data = data_dir();
    let work = tempdir().unwrap();
    let file = watched_file(work.path(), "app.conf");

    vigilo(data.path())
        .args(["add", "--preset", "full", "--modify"])
        .arg(&file)
        .assert()
        .success();

    assert_eq!(stored(data.path())[&file].watched_events.len(), 5);
}

#[test]
fn duplicate_add_is_rejected() {
    let data = data_dir();
    let work = tempdir().unwrap();
    let file = watched_file(work.path(), "app.conf");

    vigilo(data.path()).arg("add").arg(&file).assert().success();
    vigilo(data.path())
        .arg("add")
        .arg(&file)
        .assert()
        .failure()
        .stderr(predicate::str::contains("already monitored"));
}

#[test]
fn protected_paths_are_refused() {
    let data = data_dir();
    vigilo(data.path())
        .args(["add", "/proc/cpuinfo"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("protected system path"));
    assert!(!data.path().join("baseline.json").exists());
}

#[test]
fn missing_path_cannot_be_added() {
    let data = data_dir();
    let work = tempdir().unwrap();
    vigilo(data.path())
        .arg("add")
        .arg(work.path().join("nope.conf"))
        .assert()
        .failure();
}

#[test]
fn event_edits_keep_at_least_one_event() {
    let data = data_dir();
    let work = tempdir().unwrap();
    let file = watched_file(work.path(), "app.conf");
    vigilo(data.path())
        .args(["add", "--modify"])
        .arg(&file)
        .assert()
        .success();

    vigilo(data.path())
        .args(["events", "add"])
        .arg(&file)
        .args(["move", "permissionChange"])
        .assert()
        .success()
        .stdout(predicate::str::contains("modify,move,permissionChange"));

    vigilo(data.path())
        .args(["events", "remove"])
        .arg(&file)
        .args(["modify", "move", "permissionChange"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("must not be empty"));

    // The rejected edit left the stored entry untouched.
    let events = &stored(data.path())[&file].watched_events;
    assert_eq!(events.len(), 3);
    assert!(events.contains(&WatchEvent::Modify));

    vigilo(data.path())
        .args(["events", "set"])
        .arg(&file)
        .arg("delete")
        .assert()
        .success()
        .stdout(predicate::str::ends_with("delete\n"));
}

#[test]
fn alert_mode_can_be_changed() {
    let data = data_dir();
    let work = tempdir().unwrap();
    let file = watched_file(work.path(), "app.conf");
    vigilo(data.path()).arg("add").arg(&file).assert().success();

    vigilo(data.path())
        .args(["alert", "set"])
        .arg(&file)
        .arg("webhook")
        .assert()
        .success();
    assert_eq!(stored(data.path())[&file].alert_mode, AlertMode::Webhook);

    vigilo(data.path())
        .args(["alert", "set"])
        .arg(&file)
        .arg("pager")
        .assert()
        .failure();
}

#[test]
fn remove_and_info() {
    let data = data_dir();
    let work = tempdir().unwrap();
    let file = watched_file(work.path(), "app.conf");
    vigilo(data.path()).arg("add").arg(&file).assert().success();

    vigilo(data.path())
        .arg("info")
        .arg(&file)
        .assert()
        .success()
        .stdout(predicate::str::contains("\"lastSeenState\""));

    vigilo(data.path()).arg("remove").arg(&file).assert().success();
    vigilo(data.path())
        .arg("remove")
        .arg(&file)
        .assert()
        .failure()
        .stderr(predicate::str::contains("is not monitored"));
    vigilo(data.path())
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("nothing is monitored"));
}

#[test]
fn alert_modes_and_test_use_only_configured_channels() {
    let data = data_dir();
    vigilo(data.path())
        .args(["alert", "modes"])
        .assert()
        .success()
        .stdout(predicate::eq("log\nsilent\n"));

    vigilo(data.path())
        .args(["alert", "test"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Delivered"))
        .stdout(predicate::str::contains("Silenced"));
    let alerts = fs::read_to_string(data.path().join("alerts.log")).unwrap();
    assert!(alerts.contains("FILE MONITORING ALERT"));
}

fn record_alert(data: &Path, path: &str) {
    let record = ChangeRecord {
        path: PathBuf::from(path),
        entry_path: PathBuf::from(path),
        event_type: ChangeKind::Delete,
        previous_snapshot: None,
        current_snapshot: None,
        diff: SnapshotDiff::default(),
        destination: None,
        detected_at: Utc::now(),
    };
    let report = AlertReport::from_record(&record, AlertMode::Log);
    HistoryLog::new(data.join("history.jsonl"))
        .unwrap()
        .append(&report, AlertMode::Log, false)
        .unwrap();
}

#[test]
fn history_and_prune() {
    let data = data_dir();
    vigilo(data.path())
        .arg("history")
        .assert()
        .success()
        .stdout(predicate::str::contains("no alerts recorded"));

    record_alert(data.path(), "/srv/first.conf");
    record_alert(data.path(), "/srv/second.conf");

    vigilo(data.path())
        .args(["history", "--limit", "1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("/srv/second.conf"))
        .stdout(predicate::str::contains("(undelivered)"))
        .stdout(predicate::str::contains("/srv/first.conf").not());

    vigilo(data.path())
        .arg("prune")
        .assert()
        .success()
        .stdout(predicate::str::contains("removed 0"));
    vigilo(data.path())
        .args(["prune", "--days", "0"])
        .assert()
        .success()
        .stdout(predicate::str::contains("removed 2"));
}
