//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Shutdown::trigger
//!
//! Shutdown (shutdown.rs):
//!     trigger → accept loop stops
//!     → ShutdownCoordinator::drain
//!         walk_and_close(T1): close_gracefully each, wait for `closed`
//!         on timeout: walk_and_abort(T2): abort each, wait for `closed`
//!
//! Per connection (latch.rs):
//!     Latch<CloseOutcome> fires once on Closed/Aborted → every observer wakes
//! ```
//!
//! # Design Decisions
//! - Ordered shutdown: stop accept, drain, abort stragglers
//! - Shutdown has timeouts: a deadline escalates, it never blocks forever

pub mod latch;
pub mod shutdown;
pub mod signals;

pub use latch::Latch;
pub use shutdown::{DrainOutcome, Shutdown, ShutdownCoordinator};
