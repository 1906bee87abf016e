//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming stream
//!     → reactor.rs (TcpReactor) or memory.rs (MemoryReactor)
//!     → transport.rs (limiter check, duplex pipe, byte pump)
//!     → connection.rs (lifecycle tracking, state machine)
//!     → registry.rs (live connections, snapshots for heartbeat and drain)
//!     → Hand off to the ConnectionHandler
//!
//! Connection States:
//!     Open → ClosingGracefully → Closed
//!     Open / ClosingGracefully → Aborted
//! ```
//!
//! # Design Decisions
//! - Backends only accept; everything else is shared by all of them
//! - Each connection tracked for graceful shutdown
//! - A per-connection fault never leaves the connection's own tasks

pub mod connection;
pub mod memory;
pub mod reactor;
pub mod registry;
pub mod transport;

pub use connection::{
    AbortReason, CloseOutcome, Connection, ConnectionId, ConnectionState, Endpoints,
};
pub use memory::{memory_reactor, MemoryConnector, MemoryReactor};
pub use reactor::{Accepted, Reactor, TcpReactor, TransportError};
pub use registry::ConnectionRegistry;
pub use transport::{ConnectionHandler, Transport};
