//! Connection state machine and lifecycle tracking.
//!
//! # Responsibilities
//! - Generate unique connection IDs for tracing
//! - Track connection state (Open → ClosingGracefully → Closed, or → Aborted)
//! - Tear down exactly once: fire `closed`, deregister, release pipe
//!   segments and the limiter slot
//! - Expose per-connection capabilities (rate enforcement toggles)
//!
//! # Design Decisions
//! - State lives in one `AtomicU8`; every transition is a compare-exchange,
//!   so concurrent `abort` calls and a racing clean close resolve to a single
//!   winner
//! - I/O errors always route through `abort`; a completed graceful close is
//!   the only path to `Closed`

use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::time::Instant;

use super::registry::ConnectionRegistry;
use crate::lifecycle::latch::Latch;
use crate::observability::metrics;
use crate::pipe::{ApplicationPipe, DuplexControl};
use crate::security::limits::LimiterLease;
use crate::security::min_data_rate::{DataPhase, DataRateMonitor, MinDataRate, RateViolation};

/// Global atomic counter for connection IDs.
/// Relaxed ordering is enough: only uniqueness matters.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection. Never reused within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Connection lifecycle state. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    /// Processing traffic.
    Open = 0,
    /// Asked to finish in-flight work and close.
    ClosingGracefully = 1,
    /// Closed cleanly.
    Closed = 2,
    /// Torn down abruptly.
    Aborted = 3,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Open,
            1 => ConnectionState::ClosingGracefully,
            2 => ConnectionState::Closed,
            _ => ConnectionState::Aborted,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Aborted)
    }
}

/// Why a connection was aborted.
#[derive(Debug, Clone, PartialEq)]
pub enum AbortReason {
    /// Socket read or write failed.
    Transport(io::ErrorKind),
    /// The protocol layer rejected the peer's bytes.
    ProtocolViolation(String),
    /// The peer was too slow.
    MinDataRate(RateViolation),
    /// The application gave up on the connection.
    Application(String),
    /// The connection handler panicked.
    HandlerPanicked,
    /// Forced during server shutdown.
    Shutdown,
    /// Explicit request with a free-form reason.
    Requested(String),
}

impl AbortReason {
    /// Static label for metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            AbortReason::Transport(_) => "transport",
            AbortReason::ProtocolViolation(_) => "protocol_violation",
            AbortReason::MinDataRate(_) => "min_data_rate",
            AbortReason::Application(_) => "application",
            AbortReason::HandlerPanicked => "handler_panicked",
            AbortReason::Shutdown => "shutdown",
            AbortReason::Requested(_) => "requested",
        }
    }

    /// Reasons worth a warning rather than a debug line.
    fn is_notable(&self) -> bool {
        matches!(
            self,
            AbortReason::ProtocolViolation(_)
                | AbortReason::MinDataRate(_)
                | AbortReason::HandlerPanicked
        )
    }
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::Transport(kind) => write!(f, "transport error: {}", kind),
            AbortReason::ProtocolViolation(msg) => write!(f, "protocol violation: {}", msg),
            AbortReason::MinDataRate(violation) => write!(f, "{}", violation),
            AbortReason::Application(msg) => write!(f, "application: {}", msg),
            AbortReason::HandlerPanicked => f.write_str("connection handler panicked"),
            AbortReason::Shutdown => f.write_str("server shutdown"),
            AbortReason::Requested(msg) => write!(f, "requested: {}", msg),
        }
    }
}

/// How a connection ended. Carried by the `closed` signal.
#[derive(Debug, Clone, PartialEq)]
pub enum CloseOutcome {
    Closed,
    Aborted(AbortReason),
}

impl CloseOutcome {
    pub fn is_aborted(&self) -> bool {
        matches!(self, CloseOutcome::Aborted(_))
    }

    fn as_str(&self) -> &'static str {
        match self {
            CloseOutcome::Closed => "closed",
            CloseOutcome::Aborted(_) => "aborted",
        }
    }
}

/// Socket endpoints of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoints {
    pub remote: SocketAddr,
    pub local: SocketAddr,
}

/// One accepted connection.
///
/// Shared as `Arc<Connection>` between the registry, the byte pump and the
/// protocol layer.
pub struct Connection {
    id: ConnectionId,
    endpoints: Endpoints,
    created_at: Instant,
    state: AtomicU8,
    /// The state that started the wind-down: `ClosingGracefully` or `Aborted`.
    closing: Latch<ConnectionState>,
    closed: Latch<CloseOutcome>,
    pipes: DuplexControl,
    application: Mutex<Option<ApplicationPipe>>,
    data_rate: DataRateMonitor,
    lease: Option<LimiterLease>,
    registry: ConnectionRegistry,
}

impl Connection {
    /// Create a connection and register it.
    ///
    /// The limiter slot, if any, is held until teardown.
    pub fn open(
        registry: &ConnectionRegistry,
        endpoints: Endpoints,
        pipes: DuplexControl,
        application: ApplicationPipe,
        data_rate: DataRateMonitor,
        lease: Option<LimiterLease>,
    ) -> Arc<Self> {
        let connection = Arc::new(Self {
            id: ConnectionId::new(),
            endpoints,
            created_at: Instant::now(),
            state: AtomicU8::new(ConnectionState::Open as u8),
            closing: Latch::new(),
            closed: Latch::new(),
            pipes,
            application: Mutex::new(Some(application)),
            data_rate,
            lease,
            registry: registry.clone(),
        });
        registry.add(Arc::clone(&connection));
        connection
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.endpoints.remote
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.endpoints.local
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    /// Take the application ends of the duplex pipe. Returns `None` after the
    /// first call.
    pub fn take_application(&self) -> Option<ApplicationPipe> {
        self.application.lock().take()
    }

    /// Ask the connection to finish in-flight work and close.
    ///
    /// Idempotent. Returns `true` for the call that moved the state.
    pub fn close_gracefully(&self) -> bool {
        if !self.transition(&[ConnectionState::Open], ConnectionState::ClosingGracefully) {
            return false;
        }
        tracing::debug!(connection_id = %self.id, "Connection closing gracefully");
        self.closing.fire(ConnectionState::ClosingGracefully);
        true
    }

    /// Abort the connection. Idempotent and infallible.
    ///
    /// Returns `true` for the call that performed the teardown.
    pub fn abort(&self, reason: AbortReason) -> bool {
        if !self.transition(
            &[ConnectionState::Open, ConnectionState::ClosingGracefully],
            ConnectionState::Aborted,
        ) {
            return false;
        }

        if reason.is_notable() {
            tracing::warn!(
                connection_id = %self.id,
                remote_addr = %self.endpoints.remote,
                reason = %reason,
                "Connection aborted"
            );
        } else {
            tracing::debug!(
                connection_id = %self.id,
                remote_addr = %self.endpoints.remote,
                reason = %reason,
                "Connection aborted"
            );
        }
        metrics::record_connection_abort(reason.as_str());

        self.pipes.cancel();
        self.teardown(CloseOutcome::Aborted(reason));
        true
    }

    /// Record a completed close. Only the transport calls this, once the
    /// outbound side has been flushed and shut down.
    ///
    /// An `Open` connection passes through `ClosingGracefully` first, so
    /// `Closed` is only ever reached from a graceful close.
    pub(crate) fn mark_closed(&self) -> bool {
        self.close_gracefully();
        if !self.transition(&[ConnectionState::ClosingGracefully], ConnectionState::Closed) {
            return false;
        }
        tracing::trace!(
            connection_id = %self.id,
            lifetime_ms = self.created_at.elapsed().as_millis() as u64,
            "Connection closed"
        );
        self.pipes.release();
        self.teardown(CloseOutcome::Closed);
        true
    }

    /// Resolves once the connection reaches `Closed` or `Aborted`.
    ///
    /// The future does not borrow the connection and may be awaited by any
    /// number of observers, before or after the fact.
    pub fn closed(&self) -> impl Future<Output = CloseOutcome> + Send + 'static {
        let wait = self.closed.wait();
        async move {
            wait.await
                .unwrap_or(CloseOutcome::Aborted(AbortReason::Shutdown))
        }
    }

    /// Resolves once the connection is asked to wind down, gracefully or not.
    pub fn closing(&self) -> impl Future<Output = ()> + Send + 'static {
        let wait = self.closing.wait();
        async move {
            let _ = wait.await;
        }
    }

    /// The terminal outcome, if reached.
    pub fn outcome(&self) -> Option<CloseOutcome> {
        self.closed.get()
    }

    pub fn data_rate(&self) -> &DataRateMonitor {
        &self.data_rate
    }

    /// Turn minimum-rate enforcement on or off for this connection.
    pub fn set_min_data_rate_enabled(&self, enabled: bool) {
        self.data_rate.set_enabled(enabled);
    }

    /// Override one phase's threshold; `None` stops monitoring it.
    pub fn set_min_data_rate(&self, phase: DataPhase, rate: Option<MinDataRate>) {
        self.data_rate.set_rate(phase, rate);
    }

    /// The connection now carries an opaque byte stream; rate checks stop.
    pub fn mark_upgraded(&self) {
        self.data_rate.mark_upgraded();
    }

    pub fn start_phase(&self, phase: DataPhase) {
        self.data_rate.start(phase, Instant::now());
    }

    pub fn stop_phase(&self, phase: DataPhase) {
        self.data_rate.stop(phase);
    }

    /// Run the rate check at `now`, aborting on a violation.
    ///
    /// Returns `true` if this check aborted the connection.
    pub fn on_heartbeat(&self, now: Instant) -> bool {
        if self.is_terminal() {
            return false;
        }
        match self.data_rate.check(now) {
            Some(violation) => self.abort(AbortReason::MinDataRate(violation)),
            None => false,
        }
    }

    fn transition(&self, from: &[ConnectionState], to: ConnectionState) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if !from.contains(&ConnectionState::from_u8(current)) {
                return false;
            }
            match self.state.compare_exchange(
                current,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Runs once, for whichever transition reached a terminal state.
    fn teardown(&self, outcome: CloseOutcome) {
        // Dropping unclaimed application ends completes them; they are
        // released already.
        drop(self.application.lock().take());
        self.registry.remove(self.id);
        if let Some(lease) = &self.lease {
            lease.release();
        }
        metrics::record_connection_closed(outcome.as_str());

        // Already fired when the close was graceful.
        self.closing.fire(ConnectionState::Aborted);
        self.closed.fire(outcome);
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        // Never registered, or registry already gone: still fire `closed`.
        if !self.is_terminal() {
            self.abort(AbortReason::Shutdown);
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("remote_addr", &self.endpoints.remote)
            .field("local_addr", &self.endpoints.local)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::pipe::{DuplexPipe, TransportPipe, Watermarks};
    use crate::pool::SegmentPool;
    use crate::security::min_data_rate::DataRateLimits;

    pub(crate) fn endpoints() -> Endpoints {
        Endpoints {
            remote: "127.0.0.1:40000".parse().unwrap(),
            local: "127.0.0.1:8080".parse().unwrap(),
        }
    }

    /// A registered connection plus the transport ends of its pipe.
    pub(crate) fn open_connection(registry: &ConnectionRegistry) -> (Arc<Connection>, TransportPipe) {
        open_connection_with(registry, None)
    }

    pub(crate) fn open_connection_with(
        registry: &ConnectionRegistry,
        lease: Option<LimiterLease>,
    ) -> (Arc<Connection>, TransportPipe) {
        let pool = SegmentPool::new(64, 4);
        let DuplexPipe {
            transport,
            application,
            control,
        } = DuplexPipe::new(&pool, Watermarks::unbounded(), Watermarks::unbounded());
        let connection = Connection::open(
            registry,
            endpoints(),
            control,
            application,
            DataRateMonitor::new(DataRateLimits::default(), true),
            lease,
        );
        (connection, transport)
    }
}
