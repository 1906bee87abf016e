//! Reactor abstraction and the TCP backend.
//!
//! # Responsibilities
//! - Hide the socket backend behind one `Reactor` trait
//! - Bind the configured address and accept TCP connections
//! - Classify accept errors as transient (retry) or fatal
//!
//! # Design Decisions
//! - The trait only accepts; connection limits, pipes and lifecycle live in
//!   the transport, so every backend gets them for free
//! - Accepted streams are owned values and close on drop on every exit path

use std::future::Future;
use std::io;
use std::net::SocketAddr;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};

use super::connection::Endpoints;
use crate::config::ListenerConfig;

/// Error type for listener-level failures. Per-connection errors never
/// surface here.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Failed to bind to address.
    #[error("Failed to bind: {0}")]
    Bind(io::Error),
    /// Failed to accept connection, and the failure is not transient.
    #[error("Failed to accept: {0}")]
    Accept(io::Error),
}

/// A freshly accepted stream.
#[derive(Debug)]
pub struct Accepted<S> {
    pub stream: S,
    pub endpoints: Endpoints,
}

/// Source of accepted byte streams.
pub trait Reactor: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Wait for the next inbound connection.
    fn accept(&self) -> impl Future<Output = io::Result<Accepted<Self::Stream>>> + Send;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

/// Accept errors worth retrying after a delay: resource exhaustion, or a
/// peer that went away between SYN and accept.
pub fn is_transient_accept_error(error: &io::Error) -> bool {
    if matches!(
        error.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::OutOfMemory
    ) {
        return true;
    }

    // EMFILE, ENFILE, ENOBUFS, ENOMEM on Linux.
    matches!(error.raw_os_error(), Some(24 | 23 | 105 | 12))
}

/// TCP listener backend.
#[derive(Debug)]
pub struct TcpReactor {
    inner: TcpListener,
}

impl TcpReactor {
    /// Bind to the configured address.
    pub async fn bind(config: &ListenerConfig) -> Result<Self, TransportError> {
        let addr: SocketAddr = config.bind_address.parse().map_err(|e| {
            TransportError::Bind(io::Error::new(io::ErrorKind::InvalidInput, e))
        })?;

        let listener = TcpListener::bind(addr)
            .await
            .map_err(TransportError::Bind)?;
        let local_addr = listener.local_addr().map_err(TransportError::Bind)?;

        tracing::info!(
            address = %local_addr,
            max_connections = config.max_connections,
            "Listener bound"
        );

        Ok(Self { inner: listener })
    }

    /// Wrap an already bound listener.
    pub fn from_listener(listener: TcpListener) -> Self {
        Self { inner: listener }
    }
}

impl Reactor for TcpReactor {
    type Stream = TcpStream;

    async fn accept(&self) -> io::Result<Accepted<TcpStream>> {
        let (stream, remote) = self.inner.accept().await?;
        let local = stream.local_addr()?;
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(remote_addr = %remote, error = %e, "Failed to set TCP_NODELAY");
        }
        Ok(Accepted {
            stream,
            endpoints: Endpoints { remote, local },
        })
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}
