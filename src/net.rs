//! Secondary outbound connections opened by the services.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::error::{CoordError, Result};

/// Connects to workers, optionally from a fixed local port.
#[derive(Debug, Clone)]
pub struct Outbound {
    local: Option<SocketAddr>,
    connect_timeout: Duration,
}

impl Outbound {
    /// `local` is the pinned source address, or `None` to let the OS pick one.
    pub fn new(local: Option<SocketAddr>, connect_timeout: Duration) -> Self {
        Self {
            local,
            connect_timeout,
        }
    }

    /// Open a connection. A failed local bind is reported like any other transport error.
    pub async fn connect(&self, remote: &str) -> Result<TcpStream> {
        let remote = resolve(remote).await?;
        let socket = self.bound_socket(remote)?;
        self.finish_connect(socket, remote).await
    }

    /// Open a connection, waiting out contention on the pinned local port.
    ///
    /// The bind is retried every `delay` until it succeeds or `shutdown` fires.
    /// Only the bind is retried; a failed connect is returned to the caller.
    pub async fn connect_waiting_for_bind(
        &self,
        remote: &str,
        delay: Duration,
        shutdown: &CancellationToken,
    ) -> Result<TcpStream> {
        let remote = resolve(remote).await?;
        let socket = loop {
            match self.bound_socket(remote) {
                Ok(socket) => break socket,
                Err(e) => {
                    tracing::error!(
                        local = ?self.local,
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "Binding the outbound socket failed, will retry"
                    );
                    tokio::select! {
                        _ = shutdown.cancelled() => return Err(e),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        };
        self.finish_connect(socket, remote).await
    }

    fn bound_socket(&self, remote: SocketAddr) -> Result<TcpSocket> {
        let socket = if remote.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        if let Some(local) = self.local {
            socket.set_reuseaddr(true)?;
            socket.bind(local)?;
        }
        Ok(socket)
    }

    async fn finish_connect(&self, socket: TcpSocket, remote: SocketAddr) -> Result<TcpStream> {
        tokio::time::timeout(self.connect_timeout, socket.connect(remote))
            .await
            .map_err(|_| CoordError::Timeout("connecting to a worker"))?
            .map_err(CoordError::from)
    }
}

async fn resolve(addr: &str) -> Result<SocketAddr> {
    tokio::net::lookup_host(addr)
        .await?
        .next()
        .ok_or_else(|| CoordError::UnknownWorker(addr.to_string()))
}

/// Bind a listening socket with `SO_REUSEADDR`, so a restarted server can reclaim its ports.
pub fn bind_listener(addr: SocketAddr) -> std::io::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(128)
}
