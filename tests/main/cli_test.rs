//! CLI contract tests.

use std::path::Path;

use assert_cmd::Command;
use bastion::audit::AuditRecord;
use bastion::types::EventKind;

fn bastion() -> Command {
    let mut cmd = Command::cargo_bin("bastion").expect("binary should build");
    cmd.env_remove("BASTION_CONFIG_PATH")
        .env_remove("BASTION_AUDIT_LOG")
        .env_remove("BASTION_MAC_ENFORCING")
        .env_remove("BASTION_IDS_THRESHOLD")
        .env_remove("BASTION_IDS_LEARNING")
        .env_remove("BASTION_AUDIT_CAPACITY")
        .env_remove("BASTION_LOG_LEVEL")
        .env_remove("BASTION_LOG_DIR");
    cmd
}

fn write_config(dir: &Path, contents: &str) -> std::path::PathBuf {
    let path = dir.join("bastion.toml");
    std::fs::write(&path, contents).expect("should write config");
    path
}

fn record(event_id: u64, kind: EventKind, severity: u8, description: &str) -> String {
    let record = AuditRecord {
        timestamp: "2023-11-14T22:13:20Z".to_owned(),
        event_id,
        pid: 42,
        uid: 1000,
        kind,
        severity,
        blocked: false,
        description: description.to_owned(),
        subject: "user_t".to_owned(),
        object: "home_t".to_owned(),
        action: "read".to_owned(),
        seal: None,
    };
    serde_json::to_string(&record).expect("should serialize record")
}

#[test]
fn check_config_accepts_valid_file() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let path = write_config(tmp.path(), "[ids]\nthreshold = 60\n");
    let output = bastion()
        .arg("--config")
        .arg(&path)
        .arg("check-config")
        .output()
        .expect("should run");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("threshold = 60"));
    assert!(stdout.contains("configuration ok"));
}

#[test]
fn check_config_rejects_invalid_file() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let path = write_config(tmp.path(), "[audit]\ncapacity = 0\n");
    bastion()
        .arg("--config")
        .arg(&path)
        .arg("check-config")
        .assert()
        .failure();

    let path = write_config(tmp.path(), "[audit\n");
    bastion()
        .arg("--config")
        .arg(&path)
        .arg("check-config")
        .assert()
        .failure();
}

#[test]
fn selftest_passes_every_check() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let path = write_config(tmp.path(), "[hardware]\ndetect = false\n");
    let output = bastion()
        .arg("--config")
        .arg(&path)
        .arg("selftest")
        .output()
        .expect("should run");
    assert!(
        output.status.success(),
        "selftest failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let report: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("report should be json");
    let checks = report["checks"].as_array().expect("checks array");
    assert_eq!(checks.len(), 6);
    assert!(checks.iter().all(|c| c["passed"] == serde_json::Value::Bool(true)));
    assert!(report["stats"].is_object());
}

#[test]
fn audit_show_filters_and_skips_malformed_lines() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let log = tmp.path().join("audit.jsonl");
    let lines = [
        record(1, EventKind::AccessDenied, 4, "first denial"),
        "{not json".to_owned(),
        String::new(),
        record(2, EventKind::Suspicious, 7, "odd behaviour"),
        record(3, EventKind::AccessDenied, 6, "second denial"),
    ];
    std::fs::write(&log, lines.join("\n")).expect("should write log");

    let output = bastion()
        .args(["audit", "show", "--kind", "access_denied", "--min-severity", "5", "--path"])
        .arg(&log)
        .output()
        .expect("should run");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    let shown: Vec<&str> = stdout.lines().collect();
    assert_eq!(shown.len(), 1);
    assert!(shown[0].contains("second denial"));

    let output = bastion()
        .args(["audit", "show", "--path"])
        .arg(&log)
        .output()
        .expect("should run");
    assert!(output.status.success());
    assert_eq!(String::from_utf8_lossy(&output.stdout).lines().count(), 3);
}

#[test]
fn audit_show_rejects_unknown_kind() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let log = tmp.path().join("audit.jsonl");
    std::fs::write(&log, "").expect("should write log");
    bastion()
        .args(["audit", "show", "--kind", "nonsense", "--path"])
        .arg(&log)
        .assert()
        .failure();
}

#[test]
fn audit_show_requires_existing_file() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    bastion()
        .args(["audit", "show", "--path"])
        .arg(tmp.path().join("missing.jsonl"))
        .assert()
        .failure();
}
