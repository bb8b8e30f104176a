use std::collections::BTreeMap;

use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::config::host_of;
use crate::error::Result;
use crate::meta::{value_text, RunMetaUpdate, WorkerMeta};
use crate::net::Outbound;
use crate::protocol::{self, Command, ExperimentId};
use crate::services::ServiceContext;

const SERVICE: &str = "state_sync";
const STATUS_LIMIT: usize = 1024 * 1024;
const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

/// Status document a worker returns for `getstatus`.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerStatus {
    pub cpu: Value,
    pub mem: Value,
    pub dsk: Value,
    pub running_queuing: Value,
    /// `project:run` -> `[status, step]`
    #[serde(default)]
    pub exps: BTreeMap<String, (Value, Value)>,
}

/// Outcome of one pass over the worker directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub updated: Vec<String>,
    pub failed: Vec<String>,
}

/// Polls every worker for status and mirrors it into the metadata store.
pub struct StateSyncher {
    ctx: ServiceContext,
    outbound: Outbound,
}

impl StateSyncher {
    pub fn new(ctx: ServiceContext) -> Self {
        let outbound = ctx.outbound(ctx.config.state_sync_local_addr());
        Self { ctx, outbound }
    }

    pub async fn run(self, shutdown: CancellationToken) {
        tracing::info!(
            service = SERVICE,
            workers = self.ctx.config.workers.len(),
            interval_ms = self.ctx.config.poll_interval.as_millis() as u64,
            "Poller started"
        );

        loop {
            let report = self.poll_once().await;
            tracing::debug!(
                service = SERVICE,
                updated = report.updated.len(),
                failed = report.failed.len(),
                "Poll cycle finished"
            );

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.ctx.config.poll_interval) => {}
            }
        }

        tracing::info!(service = SERVICE, "Poller stopped");
    }

    /// Poll each worker once, in directory order. One worker failing never stops the others.
    pub async fn poll_once(&self) -> SyncReport {
        let mut report = SyncReport::default();
        for worker in self.ctx.config.workers.iter() {
            match self.sync_worker(worker).await {
                Ok(exps) => {
                    tracing::info!(service = SERVICE, worker, exps, "Worker state synced");
                    report.updated.push(worker.to_string());
                }
                Err(e) => {
                    tracing::error!(service = SERVICE, worker, error = %e, "Failed to sync worker");
                    report.failed.push(worker.to_string());
                }
            }
        }
        report
    }

    /// Fetch one worker's status and apply it. Returns the number of experiments updated.
    pub async fn sync_worker(&self, worker: &str) -> Result<usize> {
        let status = self.fetch_status(worker).await?;
        self.apply_status(worker, status).await
    }

    async fn fetch_status(&self, worker: &str) -> Result<WorkerStatus> {
        let mut stream = self.outbound.connect(worker).await?;
        tracing::debug!(service = SERVICE, worker, "Connected");

        protocol::write_message(&mut stream, Command::GetStatus.to_wire().as_bytes()).await?;
        protocol::read_json(&mut stream, self.ctx.config.io_timeout, STATUS_LIMIT).await
    }

    /// Write a fetched status. Every experiment id is validated before anything is written.
    pub async fn apply_status(&self, worker: &str, status: WorkerStatus) -> Result<usize> {
        let host = host_of(worker);

        let exps = status
            .exps
            .iter()
            .map(|(id, (state, step))| Ok((id.parse::<ExperimentId>()?, state, step)))
            .collect::<Result<Vec<_>>>()?;

        for (exp, state, step) in &exps {
            let update = RunMetaUpdate {
                status: Some(value_text(state).unwrap_or_default()),
                step: Some(value_text(step).unwrap_or_default()),
                machine: Some(host.to_string()),
            };
            self.ctx.store.upsert_run_meta(exp, update).await?;
        }

        let meta = WorkerMeta {
            cpu: value_text(&status.cpu).unwrap_or_default(),
            mem: value_text(&status.mem).unwrap_or_default(),
            dsk: value_text(&status.dsk).unwrap_or_default(),
            running_queuing: value_text(&status.running_queuing).unwrap_or_default(),
            time: Utc::now().format(TIME_FORMAT).to_string(),
        };
        self.ctx.store.write_worker_meta(host, &meta).await?;

        Ok(exps.len())
    }
}
