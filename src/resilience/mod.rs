//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Transient accept failure (EMFILE, ENOBUFS, ...):
//!     → backoff.rs (exponential delay with jitter)
//!     → accept loop sleeps, then retries
//!     → first successful accept resets the delay
//! ```
//!
//! # Design Decisions
//! - Delays are capped; the accept loop never gives up on transient errors
//! - Jitter spreads retries from many listeners hitting the same limit

pub mod backoff;

pub use backoff::{calculate_backoff, Backoff};
