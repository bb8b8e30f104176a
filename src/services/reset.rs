use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::error::{CoordError, Result};
use crate::net::Outbound;
use crate::protocol::{self, Command, ExperimentId, EXP_CLEARED, RESET_ERROR, RESET_SUCCESSFUL};
use crate::services::ServiceContext;

const SERVICE: &str = "exp_reset";

/// Result of the remote phase of a reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteClear {
    /// No owning worker is recorded, so there is nothing to clear remotely.
    Skipped,
    Cleared,
    Failed,
}

/// Two-phase experiment reset: clear the owning worker's copy, then the local one.
///
/// The local copy is only touched once the worker has confirmed with `exp_cleared`.
/// There is no rollback if the local phase fails part-way.
pub struct ExpResetter {
    ctx: ServiceContext,
    outbound: Outbound,
}

impl ExpResetter {
    pub fn new(ctx: ServiceContext) -> Self {
        let outbound = ctx.outbound(ctx.config.reset_local_addr());
        Self { ctx, outbound }
    }

    pub async fn run(self, listener: TcpListener, shutdown: CancellationToken) {
        tracing::info!(service = SERVICE, addr = ?listener.local_addr().ok(), "Listener started");

        while let Some((mut stream, peer)) =
            self.ctx.gate.next_admitted(&listener, &shutdown, SERVICE).await
        {
            match self.handle(&mut stream, &shutdown).await {
                Ok(reply) => tracing::info!(service = SERVICE, peer = %peer, reply, "Reset handled"),
                Err(e) => tracing::warn!(service = SERVICE, peer = %peer, error = %e, "Reset request failed"),
            }
        }

        tracing::info!(service = SERVICE, "Listener stopped");
    }

    /// Serve one `resetexp:<project>:<run>` request and return the reply sent.
    pub async fn handle<S>(&self, stream: &mut S, shutdown: &CancellationToken) -> Result<&'static str>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let raw = protocol::read_message(stream, self.ctx.config.io_timeout).await?;
        let exp = match Command::parse(&raw)? {
            Command::ResetExp(exp) => exp,
            other => {
                return Err(CoordError::Protocol(format!(
                    "unexpected command {:?} on reset listener",
                    other.to_wire()
                )))
            }
        };
        tracing::info!(service = SERVICE, exp = %exp, "Received reset request");

        let reply = self.reset(&exp, shutdown).await;
        protocol::write_message(stream, reply.as_bytes()).await?;
        Ok(reply)
    }

    /// Run both phases and pick the reply token.
    pub async fn reset(&self, exp: &ExperimentId, shutdown: &CancellationToken) -> &'static str {
        if self.clear_remote(exp, shutdown).await == RemoteClear::Failed {
            return RESET_ERROR;
        }

        match self.ctx.store.clear_run(exp).await {
            Ok(outcome) => {
                tracing::info!(
                    service = SERVICE,
                    exp = %exp,
                    removed = outcome.removed,
                    kept = outcome.kept,
                    "Cleared local run directory"
                );
                RESET_SUCCESSFUL
            }
            Err(e) => {
                tracing::error!(
                    service = SERVICE,
                    exp = %exp,
                    error = %e,
                    "Clearing local run directory failed, it may be partially cleared"
                );
                RESET_ERROR
            }
        }
    }

    pub async fn clear_remote(&self, exp: &ExperimentId, shutdown: &CancellationToken) -> RemoteClear {
        let machine = match self.ctx.store.read_run_meta(exp).await {
            Ok(meta) => meta.and_then(|m| m.machine).filter(|m| !m.is_empty()),
            Err(e) => {
                tracing::error!(service = SERVICE, exp = %exp, error = %e, "Could not read run metadata");
                None
            }
        };
        let Some(machine) = machine else {
            tracing::info!(service = SERVICE, exp = %exp, "Owning worker unknown, skipping remote clear");
            return RemoteClear::Skipped;
        };

        let Some(worker) = self.ctx.config.workers.resolve(&machine) else {
            tracing::error!(service = SERVICE, exp = %exp, machine = %machine, "Owning worker is not in the directory");
            return RemoteClear::Failed;
        };

        let attempts = self.ctx.config.reset_attempts.max(1);
        for attempt in 1..=attempts {
            match self.request_clear(worker, exp).await {
                Ok(reply) if protocol::is_reply(&reply, EXP_CLEARED) => {
                    tracing::info!(service = SERVICE, exp = %exp, worker, attempt, "Remote run directory cleared");
                    return RemoteClear::Cleared;
                }
                Ok(reply) => {
                    tracing::warn!(service = SERVICE, exp = %exp, worker, attempt, reply = %reply, "Worker did not confirm clear");
                }
                Err(e) if attempt < attempts => {
                    tracing::warn!(service = SERVICE, exp = %exp, worker, attempt, error = %e, "Retrying worker");
                }
                Err(e) => {
                    tracing::error!(service = SERVICE, exp = %exp, worker, attempt, error = %e, "Failed to reach worker");
                }
            }

            if attempt < attempts {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.ctx.config.reset_retry_delay) => {}
                }
            }
        }

        tracing::error!(service = SERVICE, exp = %exp, worker, attempts, "Remote clear failed");
        RemoteClear::Failed
    }

    async fn request_clear(&self, worker: &str, exp: &ExperimentId) -> Result<String> {
        let mut stream = self.outbound.connect(worker).await?;
        let cmd = Command::ResetExp(exp.clone()).to_wire();
        protocol::write_message(&mut stream, cmd.as_bytes()).await?;
        protocol::read_message(&mut stream, self.ctx.config.io_timeout).await
    }
}
