//! Client side of the coordination protocol, for operator tooling and workers.
//!
//! The server only admits clients whose exact `ip:port` is trusted, so a client
//! usually pins its local address with [`Client::with_local`].

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpStream;

use crate::error::{CoordError, Result};
use crate::net::Outbound;
use crate::protocol::{self, Command, ExperimentId, READY_TO_RECEIVE};

#[derive(Debug, Clone)]
pub struct Client {
    server: String,
    local: Option<SocketAddr>,
    timeout: Duration,
}

impl Client {
    pub fn new(server: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            local: None,
            // Long enough for the server to exhaust its own worker retries.
            timeout: Duration::from_secs(120),
        }
    }

    pub fn with_local(mut self, local: SocketAddr) -> Self {
        self.local = Some(local);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn connect(&self) -> Result<TcpStream> {
        Outbound::new(self.local, self.timeout)
            .connect(&self.server)
            .await
    }

    /// Send one command and return the reply. A server hanging up without a reply yields `""`.
    pub async fn request(&self, cmd: &Command) -> Result<String> {
        let mut stream = self.connect().await?;
        protocol::write_message(&mut stream, cmd.to_wire().as_bytes()).await?;
        match protocol::read_message(&mut stream, self.timeout).await {
            Ok(reply) => Ok(reply),
            Err(CoordError::ConnectionClosed) => Ok(String::new()),
            Err(e) => Err(e),
        }
    }

    /// Ask the reset listener to reset `exp`.
    pub async fn reset(&self, exp: &ExperimentId) -> Result<String> {
        self.request(&Command::ResetExp(exp.clone())).await
    }

    /// Ask the deploy listener to push `exp` to `worker` (`ip:port`).
    pub async fn deploy(&self, worker: &str, exp: &ExperimentId) -> Result<String> {
        self.request(&Command::DeployRunTo {
            worker: worker.to_string(),
            exp: exp.clone(),
        })
        .await
    }

    /// Push evaluation history and run metadata to the eval log listener.
    pub async fn push_eval_log(&self, exp: &ExperimentId, csv: &[u8], meta: &[u8]) -> Result<String> {
        let mut stream = self.connect().await?;
        protocol::write_message(&mut stream, Command::RecvEvalLog.to_wire().as_bytes()).await?;

        let ready = protocol::read_message(&mut stream, self.timeout).await?;
        if !protocol::is_reply(&ready, READY_TO_RECEIVE) {
            return Err(CoordError::Protocol(format!(
                "expected {:?}, got {:?}",
                READY_TO_RECEIVE, ready
            )));
        }

        let id = exp.to_string();
        let payload = protocol::encode_transfer(&[id.as_bytes(), csv, meta]);
        protocol::write_message(&mut stream, &payload).await?;
        protocol::read_message(&mut stream, self.timeout).await
    }
}
