//! Connection and transport core for a network server.
//!
//! Accepts connections from a pluggable reactor, bounds their number, pumps
//! their bytes through flow-controlled duplex pipes backed by pooled
//! segments, cuts off peers that send or receive too slowly, and drains them
//! in two phases on shutdown.

pub mod config;
pub mod echo;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod pipe;
pub mod pool;
pub mod resilience;
pub mod security;

pub use config::TransportConfig;
pub use lifecycle::{DrainOutcome, Shutdown, ShutdownCoordinator};
pub use net::{Connection, ConnectionHandler, Transport};
