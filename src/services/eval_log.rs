use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::error::{CoordError, Result};
use crate::meta::{EVAL_HISTORY, RUN_META};
use crate::protocol::{self, Command, ExperimentId, READY_TO_RECEIVE, RECEIVED};
use crate::services::ServiceContext;

const SERVICE: &str = "eval_log";

/// Receives `eval_res_hist.csv` and `run.meta` from workers.
pub struct EvalLogReceiver {
    ctx: ServiceContext,
}

impl EvalLogReceiver {
    pub fn new(ctx: ServiceContext) -> Self {
        Self { ctx }
    }

    pub async fn run(self, listener: TcpListener, shutdown: CancellationToken) {
        tracing::info!(service = SERVICE, addr = ?listener.local_addr().ok(), "Listener started");

        while let Some((mut stream, peer)) =
            self.ctx.gate.next_admitted(&listener, &shutdown, SERVICE).await
        {
            match self.handle(&mut stream).await {
                Ok(exp) => {
                    tracing::info!(service = SERVICE, peer = %peer, exp = %exp, "Eval log stored")
                }
                Err(e) => {
                    tracing::warn!(service = SERVICE, peer = %peer, error = %e, "Eval log transfer aborted")
                }
            }
        }

        tracing::info!(service = SERVICE, "Listener stopped");
    }

    /// Run one exchange on an admitted connection.
    ///
    /// Nothing is written unless the whole transfer arrives and decodes into
    /// exactly id, csv and meta.
    pub async fn handle<S>(&self, stream: &mut S) -> Result<ExperimentId>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let timeout = self.ctx.config.io_timeout;
        let raw = protocol::read_message(stream, timeout).await?;
        match Command::parse(&raw)? {
            Command::RecvEvalLog => {}
            other => {
                return Err(CoordError::Protocol(format!(
                    "unexpected command {:?} on eval log listener",
                    other.to_wire()
                )))
            }
        }

        protocol::write_message(stream, READY_TO_RECEIVE.as_bytes()).await?;
        let buf =
            protocol::read_transfer(stream, timeout, self.ctx.config.max_transfer_bytes).await?;
        let parts = protocol::decode_transfer(&buf)?;
        let [id, csv, meta] = parts.as_slice() else {
            return Err(CoordError::Protocol(format!(
                "expected 3 transfer parts, got {}",
                parts.len()
            )));
        };

        let exp: ExperimentId = std::str::from_utf8(id)
            .map_err(|_| CoordError::InvalidExperimentId(String::from_utf8_lossy(id).into_owned()))?
            .parse()?;
        tracing::info!(service = SERVICE, exp = %exp, csv_bytes = csv.len(), meta_bytes = meta.len(), "Writing eval log");

        // csv first, then meta.
        self.ctx.store.write_run_file(&exp, EVAL_HISTORY, csv).await?;
        self.ctx.store.write_run_file(&exp, RUN_META, meta).await?;

        protocol::write_message(stream, RECEIVED.as_bytes()).await?;
        Ok(exp)
    }
}
