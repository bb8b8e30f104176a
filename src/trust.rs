//! Admission control for the inbound listeners.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::config::{TrustList, UntrustedPeerPolicy};

/// Pause after a failed accept, so a persistent error (fd exhaustion) does not spin.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct TrustGate {
    trusted: TrustList,
    policy: UntrustedPeerPolicy,
}

impl TrustGate {
    pub fn new(trusted: TrustList, policy: UntrustedPeerPolicy) -> Self {
        Self { trusted, policy }
    }

    pub fn is_trusted(&self, peer: &SocketAddr) -> bool {
        self.trusted.contains(&peer.to_string())
    }

    /// Accept until a trusted peer connects.
    ///
    /// Returns `None` when the listener has to stop: shutdown was requested, or an
    /// untrusted peer connected under [`UntrustedPeerPolicy::StopListener`].
    pub async fn next_admitted(
        &self,
        listener: &TcpListener,
        shutdown: &CancellationToken,
        service: &'static str,
    ) -> Option<(TcpStream, SocketAddr)> {
        loop {
            tracing::debug!(service, "Listening");
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => return None,
                accepted = listener.accept() => accepted,
            };

            let (stream, peer) = match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    tracing::warn!(service, error = %e, "Accept failed");
                    if !back_off(shutdown, ACCEPT_RETRY_DELAY).await {
                        return None;
                    }
                    continue;
                }
            };
            tracing::info!(service, peer = %peer, "Got connection");

            if self.is_trusted(&peer) {
                return Some((stream, peer));
            }

            match self.policy {
                UntrustedPeerPolicy::StopListener => {
                    tracing::warn!(service, peer = %peer, "Untrusted connection, listener exits");
                    return None;
                }
                UntrustedPeerPolicy::RejectConnection => {
                    tracing::warn!(service, peer = %peer, "Untrusted connection rejected");
                    drop(stream);
                }
            }
        }
    }
}

/// Sleep for `delay`. Returns `false` if shutdown fired first.
async fn back_off(shutdown: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trusted_peer_matches_full_socket_addr() {
        let gate = TrustGate::new(
            TrustList::new(["127.0.0.1:40001"]),
            UntrustedPeerPolicy::StopListener,
        );
        assert!(gate.is_trusted(&"127.0.0.1:40001".parse().unwrap()));
        assert!(!gate.is_trusted(&"127.0.0.1:40002".parse().unwrap()));
        assert!(!gate.is_trusted(&"127.0.0.2:40001".parse().unwrap()));
    }

    #[test]
    fn empty_trust_list_admits_nobody() {
        let gate = TrustGate::new(TrustList::default(), UntrustedPeerPolicy::RejectConnection);
        assert!(!gate.is_trusted(&"127.0.0.1:1".parse().unwrap()));
    }

    #[tokio::test]
    async fn accept_back_off_waits_before_retrying() {
        let shutdown = CancellationToken::new();
        let started = std::time::Instant::now();
        assert!(back_off(&shutdown, ACCEPT_RETRY_DELAY).await);
        assert!(started.elapsed() >= ACCEPT_RETRY_DELAY);
    }

    #[tokio::test]
    async fn accept_back_off_ends_on_shutdown() {
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let started = std::time::Instant::now();
        assert!(!back_off(&shutdown, Duration::from_secs(30)).await);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn next_admitted_returns_none_on_shutdown() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let gate = TrustGate::new(TrustList::default(), UntrustedPeerPolicy::StopListener);
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        assert!(gate.next_admitted(&listener, &shutdown, "test").await.is_none());
    }
}
