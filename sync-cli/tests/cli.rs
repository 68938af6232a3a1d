//! End-to-end tests for the sync-sim binary.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::tempdir;

fn sync_sim() -> Command {
    Command::cargo_bin("sync-sim").unwrap()
}

#[test]
fn schedule_reports_aggressive_for_hot_device() {
    sync_sim()
        .args(["schedule", "--battery", "0.9", "--thermal", "critical"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Level:  aggressive"));
}

#[test]
fn schedule_json_is_machine_readable() {
    let output = sync_sim()
        .args(["--json", "schedule", "--battery", "0.5"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["level"], "standard");
    assert!(report["intervals_ms"]["scorecard"].is_u64());
}

#[test]
fn unknown_thermal_state_is_rejected() {
    sync_sim()
        .args(["schedule", "--battery", "0.5", "--thermal", "toasty"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown thermal state"));
}

#[test]
fn config_file_changes_thresholds() {
    let dir = tempdir().unwrap();
    let config = dir.path().join("config.toml");
    std::fs::write(
        &config,
        "[power]\nconservative_enter_battery = 0.6\nconservative_exit_battery = 0.7\n",
    )
    .unwrap();

    sync_sim()
        .arg("--config")
        .arg(&config)
        .args(["schedule", "--battery", "0.5"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Level:  conservative"));
}

#[test]
fn pending_on_missing_database() {
    let dir = tempdir().unwrap();
    let db = dir.path().join("none.db");

    sync_sim()
        .arg("pending")
        .arg("--db")
        .arg(&db)
        .assert()
        .success()
        .stdout(predicate::str::contains("No pending store"));
}

#[test]
fn simulate_rejects_bad_drop_rate() {
    sync_sim()
        .args(["simulate", "--ops", "1", "--drop-rate", "1.5"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--drop-rate"));
}

#[test]
fn simulate_small_run() {
    sync_sim()
        .args(["simulate", "--ops", "3", "--wait-secs", "5"])
        .assert()
        .success()
        .stdout(predicate::str::contains("3 submitted, 3 acked"));
}
