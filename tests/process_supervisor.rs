//! Integration tests for the Process Supervisor (spec §4.B, §8 S3/S6).

use mcp_broker::process::{ProcessError, ProcessState, ProcessSupervisor, SpawnConfig};
use std::collections::HashMap;
use std::time::Duration;

fn config(command: &str, args: Vec<&str>, auto_restart: bool) -> SpawnConfig {
    SpawnConfig {
        command: command.to_string(),
        args: args.into_iter().map(str::to_string).collect(),
        env: HashMap::new(),
        working_dir: None,
        auto_restart,
    }
}

#[tokio::test]
async fn spawn_101st_process_is_rejected_at_cap_100() {
    let supervisor = ProcessSupervisor::with_limits(2, 5, Duration::from_millis(10));

    supervisor.spawn(config("cat", vec![], false)).await.unwrap();
    supervisor.spawn(config("cat", vec![], false)).await.unwrap();

    let third = supervisor.spawn(config("cat", vec![], false)).await;
    assert!(matches!(third, Err(ProcessError::CapacityExceeded)));
}

#[tokio::test]
async fn stop_is_idempotent_and_returns_true_when_not_running() {
    let supervisor = ProcessSupervisor::with_limits(10, 5, Duration::from_millis(10));
    let id = supervisor.spawn(config("cat", vec![], false)).await.unwrap();

    assert!(supervisor.stop(&id, 500).await.unwrap());
    assert!(supervisor.stop(&id, 500).await.unwrap());

    let record = supervisor.status(&id).unwrap();
    assert_eq!(record.state, ProcessState::Stopped);
}

#[tokio::test]
async fn auto_restart_reattempts_on_nonzero_exit_up_to_the_cap() {
    // `sh -c "exit 1"` exits nonzero immediately; with a 20ms restart
    // delay and a restart cap of 2 we can observe the whole chain
    // (spec §8 S3, scaled down from the spec's 6-exit/5-restart example).
    let supervisor = ProcessSupervisor::with_limits(10, 2, Duration::from_millis(20));
    let id = supervisor
        .spawn(config("sh", vec!["-c", "exit 1"], true))
        .await
        .unwrap();

    // Wait long enough for both restarts (2 * 20ms + spawn overhead) plus
    // one more exit that should NOT trigger a third restart.
    tokio::time::sleep(Duration::from_millis(400)).await;

    let record = supervisor.status(&id).unwrap();
    assert_eq!(record.restart_count, 2, "restart_count must not exceed the cap");
    assert_eq!(record.state, ProcessState::Stopped);
}

#[tokio::test]
async fn logs_returns_most_recent_n_lines_per_stream() {
    let supervisor = ProcessSupervisor::with_limits(10, 5, Duration::from_millis(10));
    let id = supervisor
        .spawn(config("sh", vec!["-c", "printf 'one\\ntwo\\nthree\\n'"], false))
        .await
        .unwrap();

    // Give the stdout reader task a moment to drain the short-lived child.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let logs = supervisor.logs(&id, 2).unwrap();
    assert_eq!(logs.stdout, vec!["two".to_string(), "three".to_string()]);
}

#[tokio::test]
async fn status_on_unknown_id_is_not_found() {
    let supervisor = ProcessSupervisor::with_limits(10, 5, Duration::from_millis(10));
    assert!(matches!(supervisor.status("proc_999"), Err(ProcessError::NotFound(_))));
}
