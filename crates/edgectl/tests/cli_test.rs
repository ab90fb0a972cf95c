//! Integration tests for the `edgectl` binary.
//!
//! Everything runs against temporary config files and queues; no broker
//! is contacted.
#![allow(clippy::unwrap_used)]

use std::path::{Path, PathBuf};

use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;

// ── Helpers ─────────────────────────────────────────────────────────

fn edgectl_cmd() -> assert_cmd::Command {
    let mut cmd = cargo_bin_cmd!("edgectl");
    cmd.env("HOME", "/tmp/edgectl-cli-test-nonexistent")
        .env("XDG_CONFIG_HOME", "/tmp/edgectl-cli-test-nonexistent")
        .env("XDG_DATA_HOME", "/tmp/edgectl-cli-test-nonexistent")
        .env_remove("EDGECTL_CONFIG")
        .env_remove("EDGECTL_BROKER__URL")
        .env_remove("EDGECTL_CONTROLLER__ID")
        .env_remove("RUST_LOG");
    cmd
}

fn write_config(dir: &Path, controller_id: &str) -> PathBuf {
    let queue = dir.join("queue.db");
    let body = format!(
        r#"
[controller]
id = "{controller_id}"

[broker]
url = "mqtt://127.0.0.1:1883"
password = "hunter2"

[queue]
path = "{}"

[[devices]]
id = "temp_1"
kind = "sensor"

[[devices]]
id = "fan_1"
kind = "actuator"

[[rules]]
id = "cool"
kind = "THRESHOLD"
priority = 10
conditions = {{ sensor_id = "temp_1", operator = ">", threshold = 30.0 }}
actions = {{ actuator_id = "fan_1", target_state = 1.0 }}

[[rules]]
id = "night-off"
kind = "SCHEDULED"
priority = 50
schedule = "0 22 * * *"
actions = {{ actuator_id = "fan_1", target_state = 0.0 }}

[[rules]]
id = "broken"
kind = "THRESHOLD"
conditions = {{ sensor_id = "missing", operator = ">", threshold = 1.0 }}
actions = {{ actuator_id = "fan_1", target_state = 1.0 }}
"#,
        queue.display()
    );
    let path = dir.join("edgectl.toml");
    std::fs::write(&path, body).unwrap();
    path
}

// ── Basic invocation ────────────────────────────────────────────────

#[test]
fn no_args_shows_usage() {
    let output = edgectl_cmd().output().unwrap();
    assert_eq!(output.status.code(), Some(2));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Usage"), "expected usage text:\n{stderr}");
}

#[test]
fn help_lists_commands() {
    edgectl_cmd().arg("--help").assert().success().stdout(
        predicate::str::contains("run")
            .and(predicate::str::contains("validate"))
            .and(predicate::str::contains("queue")),
    );
}

#[test]
fn version_flag() {
    edgectl_cmd()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("edgectl"));
}

// ── validate ────────────────────────────────────────────────────────

#[test]
fn missing_config_exits_with_config_code() {
    edgectl_cmd()
        .args(["--config", "/tmp/edgectl-cli-test-nonexistent/none.toml", "validate"])
        .assert()
        .code(3)
        .stderr(predicate::str::contains("not found"));
}

#[test]
fn validate_reports_accepted_and_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path(), "gh-01");

    edgectl_cmd()
        .arg("--config")
        .arg(&config)
        .arg("validate")
        .assert()
        .success()
        .stdout(
            predicate::str::contains("controller: gh-01")
                .and(predicate::str::contains("rules:      2 accepted, 1 skipped"))
                .and(predicate::str::contains("broken: unknown sensor 'missing'")),
        );
}

#[test]
fn validate_json_lists_rules_in_evaluation_order() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path(), "gh-01");

    let output = edgectl_cmd()
        .arg("--config")
        .arg(&config)
        .args(["validate", "--output", "json"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let ids: Vec<&str> = report["rules"]
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec!["night-off", "cool"]);
    assert_eq!(report["skipped_rules"][0]["id"], "broken");
}

#[test]
fn validate_dump_masks_password() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path(), "gh-01");

    edgectl_cmd()
        .arg("--config")
        .arg(&config)
        .args(["validate", "--dump"])
        .assert()
        .success()
        .stdout(predicate::str::contains("********").and(predicate::str::contains("hunter2").not()));
}

#[test]
fn environment_overrides_are_applied() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path(), "gh-01");

    edgectl_cmd()
        .env("EDGECTL_CONTROLLER__ID", "gh-02")
        .arg("--config")
        .arg(&config)
        .arg("validate")
        .assert()
        .success()
        .stdout(predicate::str::contains("controller: gh-02"));
}

#[test]
fn invalid_controller_id_is_a_usage_error() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path(), "gh/01");

    edgectl_cmd()
        .arg("--config")
        .arg(&config)
        .arg("validate")
        .assert()
        .code(2);
}

// ── queue ───────────────────────────────────────────────────────────

#[test]
fn queue_stats_on_fresh_queue() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path(), "gh-01");

    let output = edgectl_cmd()
        .arg("--config")
        .arg(&config)
        .args(["queue", "stats", "--output", "json"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let stats: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(stats["pending"], 0);
    assert_eq!(stats["sent"], 0);
    assert!(dir.path().join("queue.db").exists());
}

#[test]
fn queue_prune_reports_count() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path(), "gh-01");

    edgectl_cmd()
        .arg("--config")
        .arg(&config)
        .args(["queue", "prune", "--older-than-hours", "1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("pruned 0 sent entries"));
}
