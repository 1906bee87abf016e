//! Transport: accept loop, byte pump and connection hand-off.
//!
//! # Responsibilities
//! - Accept streams from a [`Reactor`], consulting the connection limiter
//!   before any connection state exists
//! - Wire each stream to a duplex pipe and hand the application ends to the
//!   [`ConnectionHandler`]
//! - Pump bytes socket → input pipe and output pipe → socket
//! - Run the minimum data rate heartbeat
//! - Drain connections when shutdown is signalled
//!
//! # Design Decisions
//! - One task pumps both directions of a connection, one task runs the
//!   handler; a fault in either only ever aborts that connection
//! - Rate timing is paused while the pump waits on the application: input
//!   backpressure inbound, an empty output pipe outbound
//! - The heartbeat task is supervised by the accept loop and restarted if it
//!   ever exits
//! - A connection is `Closed` only after the application completed its output
//!   and every byte was written and the write side shut down

use std::future::Future;
use std::io;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use futures_util::FutureExt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use super::connection::{AbortReason, Connection};
use super::reactor::{is_transient_accept_error, Accepted, Reactor, TransportError};
use super::registry::ConnectionRegistry;
use crate::config::{validate_config, ConfigError, TransportConfig};
use crate::lifecycle::shutdown::{DrainOutcome, ShutdownCoordinator};
use crate::observability::metrics;
use crate::pipe::{ApplicationPipe, DuplexPipe, PipeError, PipeReader, PipeWriter, TransportPipe};
use crate::pool::SegmentPool;
use crate::resilience::Backoff;
use crate::security::limits::ConnectionLimiter;
use crate::security::min_data_rate::{DataPhase, DataRateMonitor};

/// The protocol layer's entry point.
///
/// Called once per accepted connection with the application ends of its
/// duplex pipe. Dropping (or completing) `pipe.output` lets the connection
/// close cleanly once everything written has been sent.
pub trait ConnectionHandler: Send + Sync + 'static {
    fn on_connection(
        &self,
        connection: Arc<Connection>,
        pipe: ApplicationPipe,
    ) -> impl Future<Output = ()> + Send;
}

impl<F, Fut> ConnectionHandler for F
where
    F: Fn(Arc<Connection>, ApplicationPipe) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send,
{
    fn on_connection(
        &self,
        connection: Arc<Connection>,
        pipe: ApplicationPipe,
    ) -> impl Future<Output = ()> + Send {
        self(connection, pipe)
    }
}

pub struct Transport<R, H> {
    reactor: R,
    handler: Arc<H>,
    config: Arc<TransportConfig>,
    registry: ConnectionRegistry,
    limiter: ConnectionLimiter,
    segments: SegmentPool,
}

impl<R, H> Transport<R, H>
where
    R: Reactor,
    H: ConnectionHandler,
{
    /// Build a transport. The configuration is validated first; every
    /// violation is reported together.
    pub fn new(reactor: R, handler: H, config: TransportConfig) -> Result<Self, ConfigError> {
        validate_config(&config).map_err(ConfigError::Validation)?;

        let limiter = ConnectionLimiter::new(config.listener.max_connections);
        let segments = SegmentPool::new(config.pipe.segment_size, config.pool.segment_capacity);
        Ok(Self {
            reactor,
            handler: Arc::new(handler),
            config: Arc::new(config),
            registry: ConnectionRegistry::new(),
            limiter,
            segments,
        })
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn limiter(&self) -> &ConnectionLimiter {
        &self.limiter
    }

    pub fn segment_pool(&self) -> &SegmentPool {
        &self.segments
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn local_addr(&self) -> io::Result<std::net::SocketAddr> {
        self.reactor.local_addr()
    }

    /// Admit one accepted stream.
    ///
    /// Returns `None` when the connection limit is reached; the stream is
    /// dropped and the application never sees it.
    pub fn on_connection(&self, accepted: Accepted<R::Stream>) -> Option<Arc<Connection>> {
        let Accepted { stream, endpoints } = accepted;

        let Some(lease) = self.limiter.try_acquire() else {
            metrics::record_connection_rejected();
            tracing::warn!(
                remote_addr = %endpoints.remote,
                max_connections = self.limiter.max(),
                "Connection rejected: limit reached"
            );
            return None;
        };
        metrics::record_connection_accepted();

        let DuplexPipe {
            transport,
            application,
            control,
        } = DuplexPipe::new(
            &self.segments,
            self.config.pipe.input.watermarks(),
            self.config.pipe.output.watermarks(),
        );
        let rate = &self.config.min_data_rate;
        let monitor = DataRateMonitor::new(rate.limits(), rate.enabled);

        let connection = Connection::open(
            &self.registry,
            endpoints,
            control,
            application,
            monitor,
            Some(lease),
        );
        connection.start_phase(DataPhase::RequestHead);

        tracing::debug!(
            connection_id = %connection.id(),
            remote_addr = %endpoints.remote,
            active = self.limiter.current(),
            "Connection accepted"
        );

        tokio::spawn(pump(
            Arc::clone(&connection),
            stream,
            transport,
            self.config.listener.read_buffer_size,
        ));

        if let Some(pipe) = connection.take_application() {
            let handler = Arc::clone(&self.handler);
            let connection = Arc::clone(&connection);
            tokio::spawn(async move {
                let run = handler.on_connection(Arc::clone(&connection), pipe);
                if AssertUnwindSafe(run).catch_unwind().await.is_err() {
                    tracing::error!(
                        connection_id = %connection.id(),
                        "Connection handler panicked"
                    );
                    connection.abort(AbortReason::HandlerPanicked);
                }
            });
        }

        Some(connection)
    }

    /// Accept connections until `shutdown` fires, then drain.
    ///
    /// Only listener-level failures are returned as errors.
    pub async fn run(
        &self,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<DrainOutcome, TransportError> {
        let mut heartbeat = self.spawn_heartbeat();

        let listener = &self.config.listener;
        let mut backoff = Backoff::new(listener.accept_backoff_base_ms, listener.accept_backoff_max_ms);

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                exit = &mut heartbeat => {
                    match exit {
                        Err(e) if e.is_panic() => {
                            tracing::error!(error = %e, "Rate heartbeat panicked, restarting")
                        }
                        _ => tracing::error!("Rate heartbeat stopped, restarting"),
                    }
                    heartbeat = self.spawn_heartbeat();
                }
                accepted = self.reactor.accept() => match accepted {
                    Ok(accepted) => {
                        backoff.reset();
                        self.on_connection(accepted);
                    }
                    Err(e) if is_transient_accept_error(&e) => {
                        metrics::record_accept_error();
                        let delay = backoff.next_delay();
                        tracing::warn!(
                            error = %e,
                            attempt = backoff.attempt(),
                            delay_ms = delay.as_millis() as u64,
                            "Accept failed, backing off"
                        );
                        tokio::select! {
                            _ = shutdown.recv() => break,
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                    Err(e) => {
                        heartbeat.abort();
                        tracing::error!(error = %e, "Accept loop failed");
                        return Err(TransportError::Accept(e));
                    }
                },
            }
        }

        tracing::info!(
            active_connections = self.registry.len(),
            "Stopped accepting connections"
        );
        let shutdown_config = &self.config.shutdown;
        let outcome = ShutdownCoordinator::new(self.registry.clone())
            .drain(shutdown_config.close_timeout(), shutdown_config.abort_timeout())
            .await;
        heartbeat.abort();
        Ok(outcome)
    }

    fn spawn_heartbeat(&self) -> JoinHandle<()> {
        tokio::spawn(heartbeat(
            self.registry.clone(),
            self.config.min_data_rate.heartbeat_interval(),
        ))
    }
}

/// Periodically run every connection's rate check.
///
/// The first check runs one interval after start.
async fn heartbeat(registry: ConnectionRegistry, interval: Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let now = Instant::now();
        for connection in registry.snapshot() {
            connection.on_heartbeat(now);
        }
    }
}

fn pipe_abort(error: PipeError) -> AbortReason {
    AbortReason::Application(format!("pipe: {error}"))
}

fn io_abort(error: io::Error) -> AbortReason {
    AbortReason::Transport(error.kind())
}

/// Move bytes between one stream and its pipe until the connection ends.
async fn pump<S>(connection: Arc<Connection>, stream: S, pipe: TransportPipe, read_buffer_size: usize)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (reader, writer) = tokio::io::split(stream);
    let TransportPipe { input, output } = pipe;

    let closed = connection.closed();
    let receiving = receive(&connection, reader, input, read_buffer_size);
    let sending = send(&connection, writer, output);
    tokio::pin!(closed, receiving, sending);

    let mut receive_done = false;
    loop {
        tokio::select! {
            _ = &mut closed => break,
            result = &mut receiving, if !receive_done => {
                receive_done = true;
                if let Err(reason) = result {
                    connection.abort(reason);
                    break;
                }
            }
            result = &mut sending => {
                match result {
                    Ok(()) => {
                        connection.mark_closed();
                    }
                    Err(reason) => {
                        connection.abort(reason);
                    }
                }
                break;
            }
        }
    }
}

/// Socket → input pipe.
async fn receive<Rd>(
    connection: &Connection,
    mut reader: Rd,
    mut input: PipeWriter,
    read_buffer_size: usize,
) -> Result<(), AbortReason>
where
    Rd: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(read_buffer_size);
    loop {
        buf.clear();
        let n = reader.read_buf(&mut buf).await.map_err(io_abort)?;
        if n == 0 {
            input.complete();
            return Ok(());
        }
        connection.data_rate().record(true, n);

        match input.append(&buf[..n]) {
            Ok(()) => {}
            // The application stopped reading; discard the rest.
            Err(PipeError::ReaderCompleted) => return Ok(()),
            Err(e) => return Err(pipe_abort(e)),
        }

        if input.is_backpressured() {
            connection.data_rate().pause(true, Instant::now());
            let flushed = input.flush().await;
            connection.data_rate().resume(true, Instant::now());
            if flushed.map_err(pipe_abort)?.is_completed {
                return Ok(());
            }
        }
    }
}

/// Output pipe → socket.
async fn send<Wr>(
    connection: &Connection,
    mut writer: Wr,
    mut output: PipeReader,
) -> Result<(), AbortReason>
where
    Wr: AsyncWrite + Unpin,
{
    loop {
        let result = match output.try_read().map_err(pipe_abort)? {
            Some(result) => result,
            None => {
                // Waiting on the application, not on the peer.
                connection.data_rate().pause(false, Instant::now());
                let read = output.read().await;
                connection.data_rate().resume(false, Instant::now());
                read.map_err(pipe_abort)?
            }
        };
        let len = result.buffer.len();
        for chunk in result.buffer.chunks() {
            writer.write_all(chunk).await.map_err(io_abort)?;
        }
        if len > 0 {
            writer.flush().await.map_err(io_abort)?;
            connection.data_rate().record(false, len);
        }

        let completed = result.is_completed;
        drop(result);
        output.advance(len).map_err(pipe_abort)?;

        if completed {
            writer.shutdown().await.map_err(io_abort)?;
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RateThreshold;
    use crate::echo::EchoHandler;
    use crate::net::connection::{CloseOutcome, ConnectionState};
    use crate::net::memory::memory_reactor;
    use crate::security::min_data_rate::MinDataRate;

    fn config() -> TransportConfig {
        let mut config = TransportConfig::default();
        config.pipe.segment_size = 16;
        config.pool.segment_capacity = 8;
        config
    }

    #[tokio::test]
    async fn echoes_over_memory_reactor_and_closes_cleanly() {
        let (reactor, connector) = memory_reactor(1024, 4);
        let transport = Transport::new(reactor, EchoHandler, config()).unwrap();

        let mut client = connector.connect().await.unwrap();
        let accepted = transport.reactor.accept().await.unwrap();
        let connection = transport.on_connection(accepted).unwrap();

        client.write_all(b"hello over a pipe").await.unwrap();
        let mut buf = [0u8; 17];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello over a pipe");

        // Half-close: the echo handler finishes, the transport closes cleanly.
        client.shutdown().await.unwrap();
        assert_eq!(connection.closed().await, CloseOutcome::Closed);
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
        assert!(transport.registry().is_empty());
        assert_eq!(transport.limiter().current(), 0);
    }

    #[tokio::test]
    async fn over_limit_connections_never_reach_the_handler() {
        let (reactor, connector) = memory_reactor(64, 4);
        let mut config = config();
        config.listener.max_connections = 1;
        let seen = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let transport = Transport::new(
            reactor,
            move |connection: Arc<Connection>, pipe: ApplicationPipe| {
                counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                async move {
                    let _pipe = pipe;
                    connection.closing().await
                }
            },
            config,
        )
        .unwrap();

        let _first_client = connector.connect().await.unwrap();
        let first = transport
            .on_connection(transport.reactor.accept().await.unwrap())
            .unwrap();

        let mut second_client = connector.connect().await.unwrap();
        assert!(transport
            .on_connection(transport.reactor.accept().await.unwrap())
            .is_none());
        // The rejected stream was dropped.
        let mut buf = [0u8; 1];
        assert_eq!(second_client.read(&mut buf).await.unwrap(), 0);

        tokio::task::yield_now().await;
        assert_eq!(seen.load(std::sync::atomic::Ordering::SeqCst), 1);

        first.abort(AbortReason::Requested("test".into()));
        assert_eq!(transport.limiter().current(), 0);
    }

    #[tokio::test]
    async fn handler_panic_aborts_only_its_connection() {
        let (reactor, connector) = memory_reactor(64, 4);
        let transport = Transport::new(
            reactor,
            |connection: Arc<Connection>, pipe: ApplicationPipe| async move {
                let _pipe = pipe;
                if connection.remote_addr().port() % 2 == 0 {
                    panic!("handler bug");
                }
                connection.closing().await;
            },
            config(),
        )
        .unwrap();

        let _a = connector.connect().await.unwrap();
        let first = transport
            .on_connection(transport.reactor.accept().await.unwrap())
            .unwrap();
        let _b = connector.connect().await.unwrap();
        let second = transport
            .on_connection(transport.reactor.accept().await.unwrap())
            .unwrap();

        let (panicked, survivor) = if first.remote_addr().port() % 2 == 0 {
            (first, second)
        } else {
            (second, first)
        };
        assert_eq!(
            panicked.closed().await,
            CloseOutcome::Aborted(AbortReason::HandlerPanicked)
        );
        assert_eq!(survivor.state(), ConnectionState::Open);
    }

    #[tokio::test]
    async fn peer_disconnect_tears_the_connection_down() {
        let (reactor, connector) = memory_reactor(64, 4);
        let transport = Transport::new(reactor, EchoHandler, config()).unwrap();

        let client = connector.connect().await.unwrap();
        let connection = transport
            .on_connection(transport.reactor.accept().await.unwrap())
            .unwrap();
        connection.data_rate().set_enabled(false);

        // An idle echo sees end-of-stream and closes cleanly; a pending
        // write would fail and abort instead.
        drop(client);
        let outcome = connection.closed().await;
        assert!(matches!(
            outcome,
            CloseOutcome::Closed | CloseOutcome::Aborted(AbortReason::Transport(_))
        ));
        assert!(transport.registry().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn silent_peer_is_aborted_by_the_heartbeat() {
        let (reactor, connector) = memory_reactor(64, 4);
        let mut config = config();
        config.min_data_rate.request_head = Some(RateThreshold {
            bytes_per_second: 100.0,
            grace_period_ms: 1000,
        });
        config.min_data_rate.heartbeat_interval_ms = 250;
        let transport = Arc::new(Transport::new(reactor, EchoHandler, config).unwrap());

        let shutdown = crate::lifecycle::shutdown::Shutdown::new();
        let run = {
            let transport = Arc::clone(&transport);
            let rx = shutdown.subscribe();
            tokio::spawn(async move { transport.run(rx).await })
        };

        let _client = connector.connect().await.unwrap();
        let connection = loop {
            if let Some(connection) = transport.registry().snapshot().pop() {
                break connection;
            }
            tokio::task::yield_now().await;
        };

        match connection.closed().await {
            CloseOutcome::Aborted(AbortReason::MinDataRate(violation)) => {
                assert_eq!(violation.phase, DataPhase::RequestHead);
            }
            other => panic!("unexpected outcome {other:?}"),
        }

        shutdown.trigger();
        assert_eq!(run.await.unwrap().unwrap(), DrainOutcome::Clean);
    }

    #[test]
    fn invalid_config_is_rejected_up_front() {
        let (reactor, _connector) = memory_reactor(64, 4);
        let mut config = config();
        config.pipe.segment_size = 0;
        config.min_data_rate.heartbeat_interval_ms = 0;

        match Transport::new(reactor, EchoHandler, config) {
            Err(ConfigError::Validation(errors)) => {
                let fields: Vec<_> = errors.iter().map(|e| e.field.as_str()).collect();
                assert!(fields.contains(&"pipe.segment_size"), "{fields:?}");
                assert!(
                    fields.contains(&"min_data_rate.heartbeat_interval_ms"),
                    "{fields:?}"
                );
            }
            Err(other) => panic!("unexpected error {other}"),
            Ok(_) => panic!("invalid config accepted"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn slow_application_does_not_trip_the_response_rate() {
        let (reactor, connector) = memory_reactor(1024, 4);
        let mut config = config();
        config.min_data_rate.heartbeat_interval_ms = 250;
        let transport = Arc::new(
            Transport::new(
                reactor,
                |connection: Arc<Connection>, pipe: ApplicationPipe| async move {
                    let ApplicationPipe {
                        input: _input,
                        mut output,
                    } = pipe;
                    connection.set_min_data_rate(
                        DataPhase::ResponseBody,
                        Some(MinDataRate::new(100.0, Duration::from_secs(1))),
                    );
                    connection.start_phase(DataPhase::ResponseBody);
                    // Well past the grace period before the first byte.
                    tokio::time::sleep(Duration::from_secs(3)).await;
                    output.write(&[7u8; 400]).await.unwrap();
                    output.complete();
                },
                config,
            )
            .unwrap(),
        );

        let shutdown = crate::lifecycle::shutdown::Shutdown::new();
        let run = {
            let transport = Arc::clone(&transport);
            let rx = shutdown.subscribe();
            tokio::spawn(async move { transport.run(rx).await })
        };

        let mut client = connector.connect().await.unwrap();
        let connection = loop {
            if let Some(connection) = transport.registry().snapshot().pop() {
                break connection;
            }
            tokio::task::yield_now().await;
        };

        let mut received = Vec::new();
        client.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, vec![7u8; 400]);
        assert_eq!(connection.closed().await, CloseOutcome::Closed);

        shutdown.trigger();
        assert_eq!(run.await.unwrap().unwrap(), DrainOutcome::Clean);
    }
}
