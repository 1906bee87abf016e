//! In-process reactor backend.
//!
//! Connections are `tokio::io::duplex` pairs handed over a channel, so the
//! whole transport can run without sockets. The connector side plays the
//! peer.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use tokio::io::DuplexStream;
use tokio::sync::{mpsc, Mutex};

use super::connection::Endpoints;
use super::reactor::{Accepted, Reactor};

const MEMORY_ADDR: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

/// Create a connected reactor/connector pair.
///
/// `buffer_size` is the per-direction capacity of each in-memory stream;
/// `backlog` bounds connections waiting to be accepted.
pub fn memory_reactor(buffer_size: usize, backlog: usize) -> (MemoryReactor, MemoryConnector) {
    let (tx, rx) = mpsc::channel(backlog);
    let local = SocketAddr::new(MEMORY_ADDR, 1);
    (
        MemoryReactor {
            incoming: Mutex::new(rx),
            local,
        },
        MemoryConnector {
            tx,
            local,
            buffer_size,
            next_port: Arc::new(AtomicU16::new(40_000)),
        },
    )
}

#[derive(Debug)]
pub struct MemoryReactor {
    incoming: Mutex<mpsc::Receiver<Accepted<DuplexStream>>>,
    local: SocketAddr,
}

impl Reactor for MemoryReactor {
    type Stream = DuplexStream;

    async fn accept(&self) -> io::Result<Accepted<DuplexStream>> {
        self.incoming.lock().await.recv().await.ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, "all memory connectors dropped")
        })
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.local)
    }
}

/// Client side of a [`MemoryReactor`].
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    tx: mpsc::Sender<Accepted<DuplexStream>>,
    local: SocketAddr,
    buffer_size: usize,
    next_port: Arc<AtomicU16>,
}

impl MemoryConnector {
    /// Open a connection; returns the peer's end of the stream.
    pub async fn connect(&self) -> io::Result<DuplexStream> {
        let (client, server) = tokio::io::duplex(self.buffer_size);
        let port = self.next_port.fetch_add(1, Ordering::Relaxed);
        let accepted = Accepted {
            stream: server,
            endpoints: Endpoints {
                remote: SocketAddr::new(MEMORY_ADDR, port),
                local: self.local,
            },
        };
        self.tx
            .send(accepted)
            .await
            .map_err(|_| io::Error::from(io::ErrorKind::ConnectionRefused))?;
        Ok(client)
    }
}
