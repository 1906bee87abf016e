//! Security subsystem.
//!
//! # Data Flow
//! ```text
//! Accepted stream:
//!     → limits.rs (take a connection slot, or reject before any state exists)
//!     → connection carries the slot as a lease until teardown
//!
//! Live connection:
//!     → min_data_rate.rs (bytes per phase, checked on every heartbeat)
//!     → below minimum after grace → connection aborted
//! ```
//!
//! # Design Decisions
//! - Fail closed: an over-limit accept never reaches application code
//! - Slow peers are cut off, slow applications are not held against them

pub mod limits;
pub mod min_data_rate;

pub use limits::{ConnectionLimiter, LimiterLease};
pub use min_data_rate::{DataPhase, DataRateLimits, DataRateMonitor, MinDataRate, RateViolation};
