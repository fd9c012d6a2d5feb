//! TCP listener for the server accept loop.
//!
//! # Responsibilities
//! - Bind to the configured host and port
//! - Accept incoming TCP connections
//! - Report the actually bound port when port 0 was requested

use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};

/// Error type for listener operations.
#[derive(Debug)]
pub enum ListenerError {
    /// Failed to bind to address.
    Bind(std::io::Error),
    /// Failed to accept connection.
    Accept(std::io::Error),
}

impl std::fmt::Display for ListenerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ListenerError::Bind(e) => write!(f, "Failed to bind: {}", e),
            ListenerError::Accept(e) => write!(f, "Failed to accept: {}", e),
        }
    }
}

impl std::error::Error for ListenerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ListenerError::Bind(e) | ListenerError::Accept(e) => Some(e),
        }
    }
}

/// A bound TCP listener.
#[derive(Debug)]
pub struct Listener {
    inner: TcpListener,
    local_addr: SocketAddr,
}

impl Listener {
    /// Bind to `host:port`. Port 0 picks a free port.
    pub async fn bind(host: &str, port: u16) -> Result<Self, ListenerError> {
        let listener = TcpListener::bind((host, port))
            .await
            .map_err(ListenerError::Bind)?;

        let local_addr = listener.local_addr().map_err(ListenerError::Bind)?;

        tracing::info!(address = %local_addr, "Listener bound");

        Ok(Self {
            inner: listener,
            local_addr,
        })
    }

    /// Accept a new connection.
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr), ListenerError> {
        let (stream, addr) = self.inner.accept().await.map_err(ListenerError::Accept)?;

        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(peer_addr = %addr, error = %e, "Failed to set TCP_NODELAY");
        }

        tracing::debug!(peer_addr = %addr, "Connection accepted");

        Ok((stream, addr))
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn binds_ephemeral_port_and_accepts() {
        let listener = Listener::bind("127.0.0.1", 0).await.unwrap();
        assert_ne!(listener.port(), 0);

        let addr = listener.local_addr();
        let client = tokio::spawn(async move { TcpStream::connect(addr).await });

        let (_stream, peer) = listener.accept().await.unwrap();
        assert_eq!(peer.ip(), addr.ip());
        client.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn bind_conflict_is_reported() {
        let first = Listener::bind("127.0.0.1", 0).await.unwrap();
        let err = Listener::bind("127.0.0.1", first.port()).await.unwrap_err();
        assert!(matches!(err, ListenerError::Bind(_)));
        assert!(err.to_string().starts_with("Failed to bind"));
    }
}
