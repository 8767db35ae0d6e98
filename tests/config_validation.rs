//! Integration tests for config loading and the §3 `ServerConfig`
//! invariant (`command` required iff stdio, `url` required iff ws/http).

use mcp_broker::config::Config;
use std::io::Write;

fn write_config(dir: &tempfile::TempDir, name: &str, contents: &str) -> std::path::PathBuf {
    let path = dir.path().join(name);
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    path
}

#[test]
fn yaml_config_with_stdio_and_ws_servers_loads_and_validates() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(
        &dir,
        "mcp-broker.yaml",
        r#"
idle_timeout: "2m"
process_cap: 50
servers:
  - id: fs
    command: npx
    args: ["-y", "@modelcontextprotocol/server-filesystem"]
  - id: remote
    transport_hint: websocket
    url: "wss://example.invalid/mcp"
"#,
    );

    let config = Config::from_file(&path).unwrap();
    assert_eq!(config.process_cap, 50);
    assert_eq!(config.idle_timeout, std::time::Duration::from_secs(120));
    assert_eq!(config.servers.len(), 2);
    config.validate().unwrap();
}

#[test]
fn toml_config_round_trips_through_validation() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(
        &dir,
        "mcp-broker.toml",
        r#"
process_cap = 10

[[servers]]
id = "local"
transport_hint = "stdio"
command = "cat"
"#,
    );

    let config = Config::from_file(&path).unwrap();
    assert_eq!(config.process_cap, 10);
    config.validate().unwrap();
}

#[test]
fn stdio_server_missing_command_fails_validation() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(
        &dir,
        "mcp-broker.yaml",
        r#"
servers:
  - id: broken
    transport_hint: stdio
"#,
    );

    let config = Config::from_file(&path).unwrap();
    assert!(config.validate().is_err());
}

#[test]
fn duplicate_server_ids_fail_validation() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(
        &dir,
        "mcp-broker.yaml",
        r#"
servers:
  - id: dup
    command: cat
  - id: dup
    command: echo
"#,
    );

    let config = Config::from_file(&path).unwrap();
    assert!(config.validate().is_err());
}

#[test]
fn validate_file_reports_errors_without_panicking() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(&dir, "mcp-broker.yaml", "process_cap: 0\n");
    assert!(Config::validate_file(&path).is_err());
}
