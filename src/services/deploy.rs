use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::error::{CoordError, Result};
use crate::meta::{RUN_META, RUN_SCRIPT};
use crate::net::Outbound;
use crate::protocol::{self, Command, ExperimentId, READY_TO_RECEIVE};
use crate::services::ServiceContext;

const SERVICE: &str = "run_deploy";

/// Pushes a run's `run.sh` and `run.meta` to a worker and relays the worker's answer.
pub struct RunDeployer {
    ctx: ServiceContext,
    outbound: Outbound,
}

impl RunDeployer {
    pub fn new(ctx: ServiceContext) -> Self {
        let outbound = ctx.outbound(ctx.config.deploy_local_addr());
        Self { ctx, outbound }
    }

    pub async fn run(self, listener: TcpListener, shutdown: CancellationToken) {
        tracing::info!(service = SERVICE, addr = ?listener.local_addr().ok(), "Listener started");

        while let Some((mut stream, peer)) =
            self.ctx.gate.next_admitted(&listener, &shutdown, SERVICE).await
        {
            match self.handle(&mut stream, &shutdown).await {
                Ok(reply) => tracing::info!(service = SERVICE, peer = %peer, reply = %reply, "Deploy handled"),
                Err(e) => tracing::warn!(service = SERVICE, peer = %peer, error = %e, "Deploy request failed"),
            }
        }

        tracing::info!(service = SERVICE, "Listener stopped");
    }

    /// Serve one `deployrun:<ip>:<port>:<project>:<run>` request. Returns the relayed reply.
    pub async fn handle<S>(&self, stream: &mut S, shutdown: &CancellationToken) -> Result<String>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let raw = protocol::read_message(stream, self.ctx.config.io_timeout).await?;
        let (worker, exp) = match Command::parse(&raw)? {
            Command::DeployRunTo { worker, exp } => (worker, exp),
            other => {
                return Err(CoordError::Protocol(format!(
                    "unexpected command {:?} on deploy listener",
                    other.to_wire()
                )))
            }
        };
        tracing::info!(service = SERVICE, exp = %exp, worker, "Received deploy request");

        let reply = self.deploy(&worker, &exp, shutdown).await?;
        if !reply.is_empty() {
            protocol::write_message(stream, reply.as_bytes()).await?;
        }
        Ok(reply)
    }

    /// Send the run to `worker` and return whatever the worker answered last.
    pub async fn deploy(
        &self,
        worker: &str,
        exp: &ExperimentId,
        shutdown: &CancellationToken,
    ) -> Result<String> {
        let timeout = self.ctx.config.io_timeout;
        let mut conn = self
            .outbound
            .connect_waiting_for_bind(worker, self.ctx.config.bind_retry_delay, shutdown)
            .await?;

        protocol::write_message(&mut conn, Command::DeployRun.to_wire().as_bytes()).await?;
        let ready = read_reply(&mut conn, timeout).await?;
        if !protocol::is_reply(&ready, READY_TO_RECEIVE) {
            tracing::warn!(service = SERVICE, exp = %exp, worker, reply = %ready, "Worker not ready, relaying its reply");
            return Ok(ready);
        }

        // Missing files go out as empty parts.
        let script = self.ctx.store.read_run_file(exp, RUN_SCRIPT).await?;
        let meta = self.ctx.store.read_run_file(exp, RUN_META).await?;
        let id = exp.to_string();
        let payload = protocol::encode_transfer(&[id.as_bytes(), script.as_slice(), meta.as_slice()]);
        protocol::write_message(&mut conn, &payload).await?;
        tracing::info!(
            service = SERVICE,
            exp = %exp,
            worker,
            script_bytes = script.len(),
            meta_bytes = meta.len(),
            "Run files sent"
        );

        read_reply(&mut conn, timeout).await
    }
}

/// A worker hanging up without a reply relays as an empty reply.
async fn read_reply<S>(conn: &mut S, timeout: std::time::Duration) -> Result<String>
where
    S: AsyncRead + Unpin,
{
    match protocol::read_message(conn, timeout).await {
        Ok(reply) => Ok(reply),
        Err(CoordError::ConnectionClosed) => Ok(String::new()),
        Err(e) => Err(e),
    }
}
