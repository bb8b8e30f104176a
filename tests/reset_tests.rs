
use std::path::Path;

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use fleet_coord::protocol::{ExperimentId, RESET_ERROR, RESET_SUCCESSFUL};
use fleet_coord::services::reset::RemoteClear;
use fleet_coord::services::ExpResetter;
use fleet_coord::WorkerServer;
use test_harness::{
    context, free_port, list_dir, loopback, test_config, trusted_client, write_file, MockBehavior,
    MockWorker,
};

fn exp() -> ExperimentId {
    "office:1".parse().unwrap()
}

/// Populate a run directory owned by `machine`.
fn seed_run(runs: &Path, machine: Option<&str>) {
    let run_dir = runs.join("office/1");
    write_file(&run_dir.join("run.sh"), b"#!/bin/sh\npython train.py\n");
    write_file(&run_dir.join("eval_res_hist.csv"), b"step,reward\n");
    write_file(&run_dir.join("checkpoints/ckpt_100.pt"), b"weights");
    let meta = match machine {
        Some(m) => format!(r#"{{"status": "running", "step": "100", "machine": "{}"}}"#, m),
        None => r#"{"status": "running", "step": "100"}"#.to_string(),
    };
    write_file(&run_dir.join("run.meta"), meta.as_bytes());
}

fn bad_replies(n: usize) -> std::collections::VecDeque<String> {
    (0..n).map(|_| "busy".to_string()).collect()
}

#[tokio::test]
async fn test_reset_clears_worker_then_local() {
    let dir = TempDir::new().unwrap();
    let runs = dir.path().join("runs");
    let worker = MockWorker::start(MockBehavior::default()).await;
    let config = test_config(31200, &dir, &[], vec![worker.addr_string()]);
    seed_run(&runs, Some("127.0.0.1"));

    let resetter = ExpResetter::new(context(config));
    let reply = resetter.reset(&exp(), &CancellationToken::new()).await;

    assert_eq!(reply, RESET_SUCCESSFUL);
    assert_eq!(worker.reset_requests().await, vec!["resetexp:office:1".to_string()]);
    assert_eq!(list_dir(&runs.join("office/1")), vec!["run.sh"]);
}

#[tokio::test]
async fn test_reset_succeeds_on_last_attempt() {
    let dir = TempDir::new().unwrap();
    let runs = dir.path().join("runs");
    let worker = MockWorker::start(MockBehavior {
        reset_replies: bad_replies(4),
        ..Default::default()
    })
    .await;
    let config = test_config(31210, &dir, &[], vec![worker.addr_string()]);
    seed_run(&runs, Some("127.0.0.1"));

    let reply = ExpResetter::new(context(config))
        .reset(&exp(), &CancellationToken::new())
        .await;

    assert_eq!(reply, RESET_SUCCESSFUL);
    assert_eq!(worker.reset_requests().await.len(), 5);
    assert_eq!(list_dir(&runs.join("office/1")), vec!["run.sh"]);
}

#[tokio::test]
async fn test_cleared_reply_with_trailing_newline_is_accepted() {
    let dir = TempDir::new().unwrap();
    let runs = dir.path().join("runs");
    let worker = MockWorker::start(MockBehavior {
        reset_replies: ["exp_cleared\n".to_string()].into_iter().collect(),
        ..Default::default()
    })
    .await;
    let config = test_config(31215, &dir, &[], vec![worker.addr_string()]);
    seed_run(&runs, Some("127.0.0.1"));

    let reply = ExpResetter::new(context(config))
        .reset(&exp(), &CancellationToken::new())
        .await;

    assert_eq!(reply, RESET_SUCCESSFUL);
    assert_eq!(worker.reset_requests().await.len(), 1);
}

#[tokio::test]
async fn test_reset_gives_up_after_attempts() {
    let dir = TempDir::new().unwrap();
    let runs = dir.path().join("runs");
    let worker = MockWorker::start(MockBehavior {
        reset_replies: bad_replies(10),
        ..Default::default()
    })
    .await;
    let config = test_config(31220, &dir, &[], vec![worker.addr_string()]);
    seed_run(&runs, Some("127.0.0.1"));

    let reply = ExpResetter::new(context(config))
        .reset(&exp(), &CancellationToken::new())
        .await;

    assert_eq!(reply, RESET_ERROR);
    assert_eq!(worker.reset_requests().await.len(), 5);
    // Local copy untouched.
    assert_eq!(
        list_dir(&runs.join("office/1")),
        vec!["checkpoints", "eval_res_hist.csv", "run.meta", "run.sh"]
    );
}

#[tokio::test]
async fn test_unreachable_worker_leaves_local_copy() {
    let dir = TempDir::new().unwrap();
    let runs = dir.path().join("runs");
    let dead = format!("localhost:{}", free_port());
    let config = test_config(31230, &dir, &[], vec![dead]);
    seed_run(&runs, Some("localhost"));

    let resetter = ExpResetter::new(context(config));
    assert_eq!(
        resetter.clear_remote(&exp(), &CancellationToken::new()).await,
        RemoteClear::Failed
    );
    assert_eq!(resetter.reset(&exp(), &CancellationToken::new()).await, RESET_ERROR);
    assert_eq!(list_dir(&runs.join("office/1")).len(), 4);
}

#[tokio::test]
async fn test_machine_missing_from_directory_is_error() {
    let dir = TempDir::new().unwrap();
    let runs = dir.path().join("runs");
    let config = test_config(31240, &dir, &[], vec!["10.9.9.9:7000".to_string()]);
    seed_run(&runs, Some("10.0.0.1"));

    let reply = ExpResetter::new(context(config))
        .reset(&exp(), &CancellationToken::new())
        .await;

    assert_eq!(reply, RESET_ERROR);
    assert_eq!(list_dir(&runs.join("office/1")).len(), 4);
}

#[tokio::test]
async fn test_unknown_owner_skips_remote_and_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let runs = dir.path().join("runs");
    let worker = MockWorker::start(MockBehavior::default()).await;
    let config = test_config(31250, &dir, &[], vec![worker.addr_string()]);
    seed_run(&runs, None);

    let resetter = ExpResetter::new(context(config));
    let token = CancellationToken::new();
    assert_eq!(resetter.reset(&exp(), &token).await, RESET_SUCCESSFUL);
    assert_eq!(list_dir(&runs.join("office/1")), vec!["run.sh"]);

    // run.meta is gone now, so a second reset has nothing left to do.
    assert_eq!(resetter.reset(&exp(), &token).await, RESET_SUCCESSFUL);
    assert_eq!(list_dir(&runs.join("office/1")), vec!["run.sh"]);
    assert!(worker.reset_requests().await.is_empty());
}

#[tokio::test]
async fn test_malformed_run_meta_treated_as_unknown_owner() {
    let dir = TempDir::new().unwrap();
    let runs = dir.path().join("runs");
    let config = test_config(31260, &dir, &[], vec![]);
    seed_run(&runs, None);
    write_file(&runs.join("office/1/run.meta"), b"{truncated");

    let reply = ExpResetter::new(context(config))
        .reset(&exp(), &CancellationToken::new())
        .await;

    assert_eq!(reply, RESET_SUCCESSFUL);
    assert_eq!(list_dir(&runs.join("office/1")), vec!["run.sh"]);
}

#[tokio::test]
async fn test_empty_machine_treated_as_unknown_owner() {
    let dir = TempDir::new().unwrap();
    let runs = dir.path().join("runs");
    let worker = MockWorker::start(MockBehavior::default()).await;
    let config = test_config(31265, &dir, &[], vec![worker.addr_string()]);
    seed_run(&runs, Some(""));

    let resetter = ExpResetter::new(context(config));
    let token = CancellationToken::new();
    assert_eq!(resetter.clear_remote(&exp(), &token).await, RemoteClear::Skipped);
    assert_eq!(resetter.reset(&exp(), &token).await, RESET_SUCCESSFUL);
    assert_eq!(list_dir(&runs.join("office/1")), vec!["run.sh"]);
    assert!(worker.reset_requests().await.is_empty());
}

#[tokio::test]
async fn test_missing_run_dir_is_success() {
    let dir = TempDir::new().unwrap();
    let config = test_config(31270, &dir, &[], vec![]);

    let reply = ExpResetter::new(context(config))
        .reset(&exp(), &CancellationToken::new())
        .await;

    assert_eq!(reply, RESET_SUCCESSFUL);
    assert!(!dir.path().join("runs/office/1").exists());
}

#[tokio::test]
async fn test_reset_over_the_wire() {
    let dir = TempDir::new().unwrap();
    let runs = dir.path().join("runs");
    let worker = MockWorker::start(MockBehavior::default()).await;
    let client_addr = loopback(free_port());
    let config = test_config(31280, &dir, &[client_addr], vec![worker.addr_string()]);
    seed_run(&runs, Some("127.0.0.1"));

    let handle = WorkerServer::new(config).start(CancellationToken::new()).await.unwrap();

    // Keyword case does not matter; the experiment id keeps its case.
    let socket = tokio::net::TcpSocket::new_v4().unwrap();
    socket.set_reuseaddr(true).unwrap();
    socket.bind(client_addr).unwrap();
    let mut stream = socket.connect(handle.reset_addr).await.unwrap();
    fleet_coord::protocol::write_message(&mut stream, b"ResetExp:office:1").await.unwrap();
    let reply = fleet_coord::protocol::read_message(&mut stream, std::time::Duration::from_secs(10))
        .await
        .unwrap();

    assert_eq!(reply, RESET_SUCCESSFUL);
    assert_eq!(worker.reset_requests().await, vec!["resetexp:office:1".to_string()]);
    assert_eq!(list_dir(&runs.join("office/1")), vec!["run.sh"]);

    handle.shutdown().await;
}

#[tokio::test]
async fn test_reset_via_client() {
    let dir = TempDir::new().unwrap();
    let runs = dir.path().join("runs");
    let client_addr = loopback(free_port());
    let config = test_config(31290, &dir, &[client_addr], vec![]);
    seed_run(&runs, None);

    let handle = WorkerServer::new(config).start(CancellationToken::new()).await.unwrap();
    let reply = trusted_client(handle.reset_addr, client_addr)
        .reset(&exp())
        .await
        .unwrap();
    assert_eq!(reply, RESET_SUCCESSFUL);

    handle.shutdown().await;
}
