use std::net::SocketAddr;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::ServerConfig;
use crate::error::{CoordError, Result};
use crate::net::bind_listener;
use crate::services::{EvalLogReceiver, ExpResetter, RunDeployer, ServiceContext, StateSyncher};

/// Owns the configuration and starts the four coordination services.
pub struct WorkerServer {
    config: Arc<ServerConfig>,
}

impl WorkerServer {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    /// Bind every listener and spawn the services.
    ///
    /// Binding happens before anything is spawned, so a port conflict fails startup
    /// instead of silently leaving one service down. After that the services run on
    /// their own; a listener that stops (for example on an untrusted peer) does not
    /// affect the others.
    pub async fn start(self, shutdown: CancellationToken) -> Result<ServerHandle> {
        self.config
            .validate()
            .map_err(|e| CoordError::Config(e.to_string()))?;
        tokio::fs::create_dir_all(&self.config.runs_dir).await?;
        tokio::fs::create_dir_all(&self.config.workers_meta_dir).await?;

        let eval_log = bind(self.config.eval_log_addr(), "eval_log")?;
        let reset = bind(self.config.reset_addr(), "exp_reset")?;
        let deploy = bind(self.config.deploy_addr(), "run_deploy")?;

        let eval_log_addr = eval_log.local_addr()?;
        let reset_addr = reset.local_addr()?;
        let deploy_addr = deploy.local_addr()?;

        let ctx = ServiceContext::new(self.config.clone());
        let tasks = vec![
            tokio::spawn(EvalLogReceiver::new(ctx.clone()).run(eval_log, shutdown.clone())),
            tokio::spawn(StateSyncher::new(ctx.clone()).run(shutdown.clone())),
            tokio::spawn(ExpResetter::new(ctx.clone()).run(reset, shutdown.clone())),
            tokio::spawn(RunDeployer::new(ctx).run(deploy, shutdown.clone())),
        ];

        tracing::info!(
            eval_log = %eval_log_addr,
            exp_reset = %reset_addr,
            run_deploy = %deploy_addr,
            trusted = self.config.trusted.len(),
            workers = self.config.workers.len(),
            runs_dir = %self.config.runs_dir.display(),
            "Worker server started"
        );

        Ok(ServerHandle {
            shutdown,
            tasks,
            eval_log_addr,
            reset_addr,
            deploy_addr,
        })
    }

    /// Start the services and run until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        self.start(shutdown).await?.wait().await;
        Ok(())
    }
}

fn bind(addr: SocketAddr, service: &'static str) -> Result<tokio::net::TcpListener> {
    bind_listener(addr).map_err(|e| {
        tracing::error!(service, addr = %addr, error = %e, "Failed to bind listener");
        CoordError::Io(e)
    })
}

/// Handle to the running services.
pub struct ServerHandle {
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    pub eval_log_addr: SocketAddr,
    pub reset_addr: SocketAddr,
    pub deploy_addr: SocketAddr,
}

impl ServerHandle {
    /// Wait for shutdown to be requested, then for every service to finish.
    pub async fn wait(self) {
        self.shutdown.cancelled().await;
        join_all(self.tasks).await;
    }

    /// Request shutdown and wait for every service to finish.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        join_all(self.tasks).await;
    }
}

async fn join_all(tasks: Vec<JoinHandle<()>>) {
    for task in tasks {
        if let Err(e) = task.await {
            tracing::error!(error = %e, "Service task panicked");
        }
    }
}
