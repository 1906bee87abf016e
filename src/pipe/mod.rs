//! Duplex pipe subsystem.
//!
//! # Data Flow
//! ```text
//! socket read  → TransportPipe.input  ══(input buffer)══▶  ApplicationPipe.input  → protocol layer
//! socket write ◀ TransportPipe.output ◀══(output buffer)══ ApplicationPipe.output ◀ protocol layer
//! ```
//!
//! # Design Decisions
//! - Each direction is its own flow-controlled buffer with its own watermarks
//! - No ordering guarantee across directions
//! - Backpressure is measured in bytes, independent of segment size

pub mod buffer;
pub mod duplex;

pub use buffer::{
    pipe, FlushResult, PipeControl, PipeError, PipeReader, PipeWriter, ReadResult, ReadView,
    Watermarks,
};
pub use duplex::{ApplicationPipe, DuplexControl, DuplexPipe, TransportPipe};
