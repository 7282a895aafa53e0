//! Integration tests for the procflow CLI.
//!
//! These tests run the simulated vehicle pipeline end-to-end with short
//! periods so each run finishes in a second or two.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::tempdir;

/// Get a command for the procflow binary with fast simulation periods.
fn procflow() -> Command {
    #[allow(deprecated)]
    let mut cmd = Command::cargo_bin("procflow").unwrap();
    cmd.env_remove("PROCFLOW_LOG")
        .env_remove("PROCFLOW_LOG_LEVEL")
        .env_remove("PROCFLOW_LOG_FORMAT")
        .env_remove("PROCFLOW_LOG_DIR")
        .env_remove("PROCFLOW_LOG_FILE")
        .env_remove("RUST_LOG")
        .env("NO_COLOR", "1");
    cmd
}

fn fast_run(cmd: &mut Command) -> &mut Command {
    cmd.args([
        "run",
        "--heartbeat-period",
        "0.05",
        "--telemetry-period",
        "0.05",
    ])
}

#[test]
fn test_help() {
    procflow()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("run"));
}

#[test]
fn test_version() {
    procflow()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("procflow"));
}

#[test]
fn test_run_help_lists_options() {
    procflow()
        .args(["run", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--telemetry-queue"))
        .stdout(predicate::str::contains("--disconnect-threshold"));
}

#[test]
fn test_run_until_duration() {
    fast_run(&mut procflow())
        .args(["--duration", "1"])
        .timeout(std::time::Duration::from_secs(30))
        .assert()
        .success()
        .stdout(predicate::str::contains("heartbeat: Connected"))
        .stdout(predicate::str::contains("command: CHANGE_ALTITUDE"))
        .stdout(predicate::str::contains("Stopped"))
        .stdout(predicate::str::contains("4 replica(s) joined"));
}

#[test]
fn test_run_stops_on_disconnect() {
    fast_run(&mut procflow())
        .args([
            "--duration",
            "20",
            "--disconnect-after",
            "0.3",
            "--disconnect-threshold",
            "3",
        ])
        .timeout(std::time::Duration::from_secs(15))
        .assert()
        .success()
        .stdout(predicate::str::contains("heartbeat: Disconnected"))
        .stdout(predicate::str::contains("link Disconnected"));
}

#[test]
fn test_run_with_replicas_and_unbounded_queue() {
    fast_run(&mut procflow())
        .args([
            "--duration",
            "0.5",
            "--command-workers",
            "3",
            "--telemetry-workers",
            "2",
            "--telemetry-queue",
            "0",
        ])
        .timeout(std::time::Duration::from_secs(30))
        .assert()
        .success()
        .stdout(predicate::str::contains("7 replica(s) joined"));
}

#[test]
fn test_run_quiet_prints_nothing() {
    fast_run(&mut procflow())
        .args(["--duration", "0.3"])
        .arg("--quiet")
        .timeout(std::time::Duration::from_secs(30))
        .assert()
        .success()
        .stdout(predicate::str::is_empty());
}

#[test]
fn test_run_writes_replica_logs() {
    let dir = tempdir().unwrap();
    let logs = dir.path().join("logs");

    fast_run(&mut procflow())
        .args(["--duration", "0.5"])
        .arg("--log-dir")
        .arg(&logs)
        .env("PROCFLOW_LOG_LEVEL", "info")
        .timeout(std::time::Duration::from_secs(30))
        .assert()
        .success();

    let names: Vec<String> = std::fs::read_dir(&logs)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    for worker in ["heartbeat_sender_", "heartbeat_receiver_", "telemetry_", "command_"] {
        assert!(
            names.iter().any(|n| n.starts_with(worker) && n.ends_with(".log")),
            "no log for {} in {:?}",
            worker,
            names
        );
    }
}

#[test]
fn test_run_writes_main_log_file() {
    let dir = tempdir().unwrap();
    let log_file = dir.path().join("main").join("procflow.log");

    fast_run(&mut procflow())
        .args(["--duration", "0.3", "-v"])
        .arg("--log-file")
        .arg(&log_file)
        .timeout(std::time::Duration::from_secs(30))
        .assert()
        .success();

    let contents = std::fs::read_to_string(&log_file).unwrap();
    assert!(contents.contains("Pipeline started"), "{}", contents);
}

#[test]
fn test_run_fails_when_replica_logging_cannot_start() {
    let dir = tempdir().unwrap();
    let blocker = dir.path().join("file");
    std::fs::write(&blocker, b"not a directory").unwrap();

    fast_run(&mut procflow())
        .args(["--duration", "0.3"])
        .arg("--log-dir")
        .arg(&blocker)
        .timeout(std::time::Duration::from_secs(30))
        .assert()
        .failure()
        .stderr(predicate::str::contains("ended abnormally"))
        .stderr(predicate::str::contains("setup failed"));
}

#[test]
fn test_zero_replicas_rejected() {
    procflow()
        .args(["run", "--command-workers", "0"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("command-workers"));
}

#[test]
fn test_invalid_target_rejected() {
    procflow()
        .args(["run", "--target", "1,2"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("x,y,z"));
}

#[test]
fn test_json_log_format_accepted() {
    fast_run(&mut procflow())
        .args(["--duration", "0.3"])
        .args(["--log-format", "json", "-v"])
        .timeout(std::time::Duration::from_secs(30))
        .assert()
        .success()
        .stderr(predicate::str::contains("\"level\":\"INFO\""));
}
