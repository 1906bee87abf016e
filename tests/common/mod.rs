//! Shared utilities for integration tests.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

use transport_core::net::{ConnectionHandler, TcpReactor, TransportError};
use transport_core::pipe::ApplicationPipe;
use transport_core::{Connection, DrainOutcome, Shutdown, Transport, TransportConfig};

/// A transport running on an ephemeral local port.
pub struct TestServer<H> {
    pub addr: SocketAddr,
    pub transport: Arc<Transport<TcpReactor, H>>,
    pub shutdown: Shutdown,
    pub task: JoinHandle<Result<DrainOutcome, TransportError>>,
}

impl<H: ConnectionHandler> TestServer<H> {
    /// Trigger shutdown and wait for the drain to finish.
    pub async fn stop(self) -> DrainOutcome {
        self.shutdown.trigger();
        self.task
            .await
            .expect("transport task panicked")
            .expect("transport failed")
    }

    /// Wait until exactly `n` connections are registered.
    pub async fn wait_for_connections(&self, n: usize) {
        let transport = Arc::clone(&self.transport);
        wait_until(move || transport.registry().len() == n).await;
    }
}

/// Test configuration: ephemeral port, small segments.
pub fn test_config() -> TransportConfig {
    let mut config = TransportConfig::default();
    config.listener.bind_address = "127.0.0.1:0".into();
    config.pipe.segment_size = 512;
    config.pool.segment_capacity = 32;
    config
}

pub async fn start_server<H: ConnectionHandler>(config: TransportConfig, handler: H) -> TestServer<H> {
    let reactor = TcpReactor::bind(&config.listener).await.unwrap();
    let transport = Arc::new(Transport::new(reactor, handler, config).unwrap());
    let addr = transport.local_addr().unwrap();

    let shutdown = Shutdown::new();
    let receiver = shutdown.subscribe();
    let task = {
        let transport = Arc::clone(&transport);
        tokio::spawn(async move { transport.run(receiver).await })
    };

    TestServer {
        addr,
        transport,
        shutdown,
        task,
    }
}

/// Poll `condition` every few milliseconds for up to five seconds.
pub async fn wait_until<F>(condition: F)
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Whether the server closed (or reset) the connection within `within`.
pub async fn server_hung_up(stream: &mut TcpStream, within: Duration) -> bool {
    let mut buf = [0u8; 64];
    loop {
        match tokio::time::timeout(within, stream.read(&mut buf)).await {
            Err(_) => return false,
            Ok(Ok(0)) | Ok(Err(_)) => return true,
            Ok(Ok(_)) => continue,
        }
    }
}

/// Consumes and discards input until the peer finishes, then closes.
#[allow(dead_code)]
pub async fn sink(_connection: Arc<Connection>, pipe: ApplicationPipe) {
    let ApplicationPipe { mut input, output } = pipe;
    while let Ok(read) = input.read().await {
        let len = read.buffer.len();
        let completed = read.is_completed;
        drop(read);
        if input.advance(len).is_err() || completed {
            break;
        }
    }
    output.complete();
}

/// Never reads, never writes, ignores graceful close.
#[allow(dead_code)]
pub async fn stubborn(_connection: Arc<Connection>, pipe: ApplicationPipe) {
    let _pipe = pipe;
    std::future::pending::<()>().await;
}
