
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use fleet_coord::protocol::{self, ExperimentId, RECEIVED, RESET_SUCCESSFUL};
use fleet_coord::WorkerServer;
use test_harness::{
    free_port, list_dir, loopback, test_config, trusted_client, write_file, MockBehavior, MockWorker,
};

/// Deploy a run, have the "worker" report back, then reset it.
#[tokio::test]
async fn test_deploy_report_reset_cycle() {
    let dir = TempDir::new().unwrap();
    let runs = dir.path().join("runs");
    let worker = MockWorker::start(MockBehavior::default()).await;
    let operator = loopback(free_port());
    let worker_push = loopback(free_port());
    let operator_reset = loopback(free_port());
    let config = test_config(
        31400,
        &dir,
        &[operator, worker_push, operator_reset],
        vec![worker.addr_string()],
    );

    let exp: ExperimentId = "lab:42".parse().unwrap();
    let script = b"#!/bin/sh\nexec python train.py\n".to_vec();
    let meta = br#"{"status": "queued", "step": "0", "machine": "127.0.0.1"}"#.to_vec();
    write_file(&runs.join("lab/42/run.sh"), &script);
    write_file(&runs.join("lab/42/run.meta"), &meta);

    let handle = WorkerServer::new(config).start(CancellationToken::new()).await.unwrap();

    let reply = trusted_client(handle.deploy_addr, operator)
        .deploy(&worker.addr_string(), &exp)
        .await
        .unwrap();
    assert_eq!(reply, RECEIVED);

    // What the worker got is byte-for-byte what is stored here.
    let body = worker.deployments().await.remove(0);
    let parts = protocol::decode_transfer(&body).unwrap();
    assert_eq!(parts.len(), 3);
    assert_eq!(parts[0], b"lab:42");
    assert_eq!(parts[1], script.as_slice());
    assert_eq!(parts[2], meta.as_slice());

    let csv = b"step,reward\n1000,-1.5\n";
    let reported = br#"{"status": "running", "step": "1000", "machine": "127.0.0.1"}"#;
    let reply = trusted_client(handle.eval_log_addr, worker_push)
        .push_eval_log(&exp, csv, reported)
        .await
        .unwrap();
    assert_eq!(reply, RECEIVED);
    assert_eq!(std::fs::read(runs.join("lab/42/run.meta")).unwrap(), reported);
    assert_eq!(
        list_dir(&runs.join("lab/42")),
        vec!["eval_res_hist.csv", "run.meta", "run.sh"]
    );

    let reply = trusted_client(handle.reset_addr, operator_reset)
        .reset(&exp)
        .await
        .unwrap();
    assert_eq!(reply, RESET_SUCCESSFUL);
    assert_eq!(worker.reset_requests().await, vec!["resetexp:lab:42".to_string()]);
    assert_eq!(list_dir(&runs.join("lab/42")), vec!["run.sh"]);
    assert_eq!(std::fs::read(runs.join("lab/42/run.sh")).unwrap(), script);

    handle.shutdown().await;
}
