//! CLI-level integration tests (SPEC_FULL §10.4/§10.5) using `assert_cmd`,
//! matching the teacher's binary-level test convention.

use assert_cmd::Command;
use predicates::prelude::*;
use std::io::Write;

#[test]
fn validate_accepts_a_well_formed_config() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mcp-broker.yaml");
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(b"servers:\n  - id: local\n    transport_hint: stdio\n    command: cat\n").unwrap();

    Command::cargo_bin("mcp-broker")
        .unwrap()
        .arg("validate")
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("valid"));
}

#[test]
fn validate_rejects_a_malformed_config() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mcp-broker.yaml");
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(b"servers:\n  - id: broken\n    transport_hint: stdio\n")
        .unwrap();

    Command::cargo_bin("mcp-broker")
        .unwrap()
        .arg("validate")
        .arg(&path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid"));
}

#[test]
fn list_prints_configured_server_ids() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mcp-broker.yaml");
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(b"servers:\n  - id: local\n    transport_hint: stdio\n    command: cat\n").unwrap();

    Command::cargo_bin("mcp-broker")
        .unwrap()
        .arg("--config")
        .arg(&path)
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("local"));
}
